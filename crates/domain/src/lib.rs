//! Shared domain types for the Leon agent runtime.
//!
//! Everything here is provider- and transport-agnostic: the error taxonomy,
//! configuration, conversation messages, run events, and LLM stream events.
//! Crates higher in the stack (store, sandbox, gateway) depend on this crate
//! and never on each other's internals.

pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod resolver;
pub mod stream;

pub use error::{Error, ErrorKind, Result};
