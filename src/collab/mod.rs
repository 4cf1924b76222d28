//! In-process implementations of the services a development server's
//! applications commonly talk to: a task queue, a message broker and a
//! service registry.
//!
//! They are independent of the HTTP server. Payloads are JSON values.
use thiserror::Error;

pub mod broker;
pub mod registry;
pub mod tasks;

pub use broker::{Acknowledger, Delivery, ExchangeKind, MemoryBroker, MessageBroker};
pub use registry::{HealthCheck, MemoryRegistry, ServiceRecord, ServiceRegistry};
pub use tasks::{TaskHandle, TaskQueue, ThreadTaskHandle, ThreadTaskQueue};

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("unknown task {0:?}")]
    UnknownTask(String),
    #[error("task failed: {0}")]
    TaskFailed(String),
    #[error("unknown queue {0:?}")]
    UnknownQueue(String),
    #[error("unknown exchange {0:?}")]
    UnknownExchange(String),
    #[error("exchange {name:?} already declared as {existing}")]
    ExchangeMismatch { name: String, existing: ExchangeKind },
    #[error("invalid exchange kind {0:?}")]
    InvalidExchangeKind(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
