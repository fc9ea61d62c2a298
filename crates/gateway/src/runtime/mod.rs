//! Core runtime — run supervision, event fan-out, memory management,
//! queue routing, and the resource-resolution chain behind tool execution.
//!
//! Entry points: [`producer::start_run`] launches the agent loop for a
//! thread; [`queue::route_message`] decides what an inbound user message
//! becomes; [`supervisor::Supervisor::observe`] is the resumable event
//! stream behind the SSE endpoint.

pub mod buffer;
pub mod cancel;
pub mod hooks;
pub mod machine;
pub mod memory;
pub mod monitor;
pub mod producer;
pub mod queue;
pub mod resolver;
pub mod supervisor;
pub mod terminal;
pub mod tools;
