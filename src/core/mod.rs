//! Scheduling, session ordering, backpressure and worker supervision.

pub mod backpressure;
pub mod error;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod scheduler;
pub mod session;
pub mod types;

pub use backpressure::BackpressureMonitor;
pub use error::{ConcurrencyError, PoolResult};
pub use events::{
    BroadcastEventSink, EventSink, InMemoryEventSink, PoolEvent, TracingEventSink,
};
pub use health::WorkerHealth;
pub use lifecycle::TerminationReason;
pub use metrics::ConcurrencyMetrics;
pub use pool::WorkerPool;
pub use scheduler::PriorityScheduler;
pub use session::{MutexHandle, SessionMutex};
pub use types::{
    Priority, QueueEntry, RequestId, SessionId, WorkerId, WorkerInfo, WorkerOutcome,
    WorkerRequest, WorkerResponse, WorkerState,
};
