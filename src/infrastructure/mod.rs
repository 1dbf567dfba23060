//! Infrastructure layer for LLM Relay
//!
//! Configuration-driven implementations of the collaborator traits and the
//! background task tracker used for post-response work.

pub mod adapters;
pub mod background;

pub use adapters::{
    AllowAllScreener, LoggingEscrowLedger, StaticOrgDirectory, StaticPolicyStore,
    StaticProviderRegistry, TracingLogSink,
};
pub use background::BackgroundTasks;
