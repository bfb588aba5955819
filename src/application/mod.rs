//! Application layer orchestrating the commit pipeline.
//!
//! `TransactionEngine` validates and atomically commits money movements,
//! `OutboxRelay` drains staged events to the bus, and `EventConsumer` applies
//! them downstream. Each takes its collaborators as explicit constructor
//! arguments.

pub mod consumer;
pub mod engine;
pub mod relay;
