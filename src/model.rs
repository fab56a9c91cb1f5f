//! Core data model.
//!
//! A task envelope is the unit that travels through a queue. It wraps an
//! opaque payload with just enough bookkeeping (attempt counter, retry
//! ceiling) for the worker runtime to decide between retry and dead-letter.

pub mod envelope;
pub mod message;
pub mod task;

pub use envelope::TaskEnvelope;
pub use task::{TaskResult, TaskStatus};
