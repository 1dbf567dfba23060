//! LLM Relay - the inbound request pipeline of an LLM reverse-proxy gateway
//!
//! A client call flows through cache lookup, rate-limit admission, content
//! screening, provider dispatch with retry and fallback, and streaming
//! capture. Logging, billing and cache writes happen after the response has
//! been handed back to the client.

pub mod application;
pub mod cache;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod proxy;
pub mod rate_limit;
pub mod retry;
pub mod storage;

pub use application::Application;
pub use error::{Error, Result};
