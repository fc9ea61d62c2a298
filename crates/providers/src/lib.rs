//! Language-model provider boundary.
//!
//! The runtime consumes only the [`LlmProvider`] trait; concrete wire
//! adapters live outside this repository. The [`scripted`] provider is the
//! in-tree implementation used by dev mode and the test suite.

pub mod registry;
pub mod scripted;
pub mod traits;

pub use registry::ProviderRegistry;
pub use scripted::{ScriptedProvider, ScriptedTurn};
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
