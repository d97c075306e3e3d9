//! Weft Config
//!
//! This crate contains the serializable configuration types for the weft
//! durable execution engine. Every field has a default, so an empty JSON
//! object is a valid configuration.
//!
//! Configuration can be loaded from:
//! - JSON files (via CLI with `--config=engine.json`)
//! - Any other serde source embedding [`EngineConfig`]
//!
//! # Example
//!
//! ```json
//! {
//!   "history": { "max_events": 20000, "warn_events": 5000 },
//!   "infra_retry": { "max_attempts": 5, "backoff_ms": 20 },
//!   "cancellation_grace_period_ms": 30000,
//!   "activity": {
//!     "start_to_close_timeout_ms": 60000,
//!     "retry": { "max_attempts": 3, "initial_interval_ms": 100, "backoff": "exponential" }
//!   }
//! }
//! ```

mod engine;
mod enums;
mod retry;

pub use engine::{EngineConfig, HistoryLimits, InfraRetry};
pub use enums::{MissedTriggerPolicy, RetryBackoff};
pub use retry::{ActivityOptions, RetryPolicy};
