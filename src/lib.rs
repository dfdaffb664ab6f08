pub mod audit;
pub mod backend;
pub mod chain_config;
pub mod config;
pub mod env;
pub mod errors;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod pipeline;
pub mod session;
pub mod template;
pub mod tracker;

pub use errors::{BackendError, ChainError, ChainResult};
