//! # expensio
//!
//! Durable job queues for the Expensio Telegram expense bot.
//!
//! Producers schedule JSON payloads onto named queues; workers consume them,
//! hand them to a task handler, and apply a bounded retry/backoff policy that
//! ends in a dead-letter queue. Two interchangeable durable backends carry the
//! envelopes: RabbitMQ (push, via lapin) and Postgres pgmq (poll, via sqlx).
//! An in-process backend stands in for both in tests and local runs.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod model;
pub mod queue;
pub mod telemetry;
