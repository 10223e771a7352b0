//! Fail-fast parallel map over a bounded pool of tokio tasks.
//!
//! A [WorkPool] owns a fixed number of execution slots. [fail_fast_map] runs a function against
//! every item of an iterator on those slots and streams the results back in input order. The
//! moment any invocation fails, its error is yielded, every other invocation is aborted, and the
//! slots are handed back to the pool.

/// Errors raised by the pool itself.
pub mod error;

/// Pool settings loaded from the environment.
pub mod config;

/// Fixed-capacity pool of execution slots and the handles of tasks spawned on it.
pub mod pool;

/// The fail-fast mapper.
pub mod map;

/// Log and JSON safe renderings of loosely typed values.
pub mod sanitize;

pub use config::PoolConfig;
pub use error::{Error, Result};
pub use map::{FailFastMap, FailFastMapExt, fail_fast_map};
pub use pool::{TaskHandle, WorkPool};
pub use sanitize::{Dynamic, repr_safe_str, safe_for_json};
