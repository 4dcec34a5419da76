//! # taskguard-breaker
//!
//! Per-key circuit breaker used by `taskguard` to stop hammering a dependency
//! that keeps failing.
//!
//! ## Design
//!
//! - One independent state machine per guarded key (Closed, Open, HalfOpen)
//! - Each key owns its own lock; the key map is only locked for lookup/insert
//! - Rejections happen before the guarded function runs and never touch counters
//! - After the recovery time exactly one trial call decides the key's fate
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use taskguard_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
//!
//! let breaker = CircuitBreaker::new(BreakerConfig {
//!     failure_threshold: 2,
//!     recovery_time: Duration::from_secs(30),
//!     call_timeout: None,
//! });
//!
//! breaker.record_failure("sync");
//! breaker.record_failure("sync");
//! assert_eq!(breaker.state("sync"), CircuitState::Open);
//! assert!(breaker.try_acquire("sync").is_err());
//! ```

pub mod circuit_breaker;
pub mod error;

pub use circuit_breaker::{BreakerConfig, BreakerPermit, CircuitBreaker, CircuitState, KeyHealth};
pub use error::{BreakerOpen, CallError};
