//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod decision;
mod descriptor;
mod distributed;
mod limiter;
mod policy;
mod redis_log;
mod registry;

pub use backend::CounterStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{CounterRecord, InProcessCounterStore, DEFAULT_CLEANUP_INTERVAL};
pub use decision::Decision;
pub use descriptor::{extract_key, UNKNOWN_CLIENT};
pub use distributed::{
    DistributedCounterStore, EventLog, LogEntry, MemoryEventLog, DEFAULT_BACKEND_TIMEOUT,
};
pub use limiter::{Backend, BackendKind, LimiterOptions, RateLimiter, DEFAULT_KEY_PREFIX};
pub use policy::{Policy, MAX_WINDOW};
pub use redis_log::RedisEventLog;
pub use registry::{EndpointClass, LimiterRegistry};
