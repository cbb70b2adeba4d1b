//! Sandboxed execution of short code snippets.
//!
//! Snipbox runs untrusted snippets submitted by anonymous learners inside IOI
//! Isolate boxes. Each request gets a freshly initialised box from a warm pool,
//! runs under CPU, memory, wall clock and output ceilings, and the box is torn
//! down afterwards whatever happened.
//!
//! # Features
//!
//! - **Warm pool**: Ready sandboxes per language, bounded by a global capacity.
//! - **Fair scheduling**: Bounded FIFO queue with backpressure and end-to-end deadlines.
//! - **Quotas**: Per-session token bucket, concurrency cap and abuse flagging.
//! - **Streaming output**: Ordered stdout/stderr events, pollable by cursor or streamed.
//! - **TOML configuration**: Per-language runtimes, limits and compile steps.
//! - **cgroup v2 support**: Memory limiting in container environments.

pub use aggregator::{PollSnapshot, RequestStatus, ResultAggregator, SequencedEvent, Subscription};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use execution::{
    ExecutionEvent, ExecutionRequest, ExecutionResult, OutputChunk, OutputStream, Outcome,
    RequestId, SessionId,
};
pub use gateway::{ExecutionGateway, GatewayError, ServiceStats, Submission};
pub use isolate::{IsolateBackend, IsolateError, prepare_cgroup};
pub use limiter::{OutputBudget, ResourceLimiter};
pub use pool::{PoolError, PoolStats, WorkerPool};
pub use quota::{Admission, AdmissionGuard, QuotaManager, SessionQuota};
pub use registry::{LanguageId, LanguageSummary, RegistryError, RuntimeProfile, RuntimeRegistry};
pub use sandbox::{SandboxBackend, SandboxError};
pub use scheduler::{Scheduler, SchedulerError, SchedulerStats};
pub use types::{ExecutionStatus, LimitExceeded, MountConfig, ResourceLimits, SandboxReport};
pub use worker::{IsolationWorker, WorkerError, WorkerState};

pub mod aggregator;
pub mod config;
pub mod execution;
pub mod gateway;
pub mod isolate;
pub mod limiter;
pub mod pool;
pub mod quota;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod worker;
