//! Stream bus adapter.
//!
//! Uniform access to the JetStream-style bus: create/ensure streams, publish
//! to subjects with server acks, durable pull consumers with explicit ack,
//! and key-value buckets. One [`BusClient`] is opened per process and passed
//! explicitly to every component constructor.

pub mod client;
pub mod consumer;
pub mod kv;
pub mod publisher;

pub use client::{BusClient, BusConfig};
pub use consumer::{Batch, BatchReader, BusMessage};
pub use kv::KvBucket;
pub use publisher::{BatchWriter, OutboundMessage};
