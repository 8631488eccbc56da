//! Webhook event pipeline: a queue table of inbound webhooks, a batch
//! processor that delivers them downstream, operator replay of failures, and
//! a kill switch that pauses processing.

pub mod config;
pub mod error;
pub mod handler;
pub mod http_server;
pub mod kill_switch;
pub mod processor;
pub mod reaper;
pub mod replay;
pub mod signature;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{ApiError, PipelineError};
pub use handler::{EventHandler, HandlerError, HttpForwarder};
pub use http_server::{router, AppState};
pub use kill_switch::KillSwitch;
pub use processor::Processor;
pub use reaper::Reaper;
pub use replay::ReplayController;
pub use store::{EventStore, MemoryEventStore, SqliteEventStore, StoreError};
pub use types::{BatchSummary, EventStatus, NewEvent, WebhookEvent};
