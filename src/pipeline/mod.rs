//! Record processing stages.
//!
//! Each stage is a [`processor::Processor`] turning one record into zero or
//! one record. The [`chain::ProcessorChain`] composes the stages declared on
//! a pipeline and routes failures to the dead-letter stream. Path extraction
//! is shared by filter, transform, dedup and join key lookup.

pub mod chain;
pub mod dedup;
pub mod filter;
pub mod join;
pub mod path;
pub mod processor;
pub mod transform;

pub use chain::{ChainOutput, ProcessorChain};
pub use dedup::DedupProcessor;
pub use filter::{FilterProcessor, Predicate};
pub use join::{JoinEmission, JoinerStats, TemporalJoiner};
pub use path::JsonPath;
pub use processor::{Outcome, Processor};
pub use transform::{TransformPlan, TransformProcessor};
