//! Dispatcher layer: chain expansion, the scheduling sweep, heartbeat
//! monitoring and the worker/QC service surfaces.

pub mod context;
pub mod expander;
pub mod heartbeat_monitor;
pub mod qc_service;
pub mod retry;
pub mod scheduler;
pub mod worker_service;

pub use context::MetadataResolver;
pub use expander::ChainExpander;
pub use heartbeat_monitor::HeartbeatMonitor;
pub use qc_service::QcService;
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{BlockedTaskReport, SchedulerConfig, SchedulerService, SweepStats};
pub use worker_service::WorkerService;
