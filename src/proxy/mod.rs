//! Request pipeline and its HTTP surface
//!
//! The [`RequestOrchestrator`] runs each mapped request through cache,
//! rate-limit, screening and provider stages. Response bodies stream back
//! through a [`StreamInterceptor`] so the [`Finalizer`] can log, bill and
//! cache them once the client has what it asked for.

pub mod error_response;
pub mod finalizer;
pub mod headers;
pub mod interceptor;
pub mod loggable;
pub mod mapper;
pub mod middleware;
pub mod orchestrator;
pub mod provider_caller;
pub mod response_builder;
pub mod service;
pub mod types;
pub mod url_resolver;

pub use finalizer::{Finalizer, PendingUsage};
pub use interceptor::{CompletedStream, CompletionReason, StreamInterceptor};
pub use loggable::{LogRecord, Loggable, ResponseOrigin};
pub use mapper::RequestMapper;
pub use orchestrator::{PipelineDeps, RequestOrchestrator};
pub use provider_caller::{FailureKind, ProviderCaller, ProviderResponse};
pub use response_builder::ResponseBuilder;
pub use service::ProxyService;
pub use types::{ProxyConfig, ProxyError, ProxyResult};
