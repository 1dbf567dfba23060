//! Process wiring
//!
//! Builds the collaborators, stores and pipeline from `Settings` and runs
//! the HTTP server.

pub mod app;

pub use app::Application;
