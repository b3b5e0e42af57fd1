#![deny(unsafe_op_in_unsafe_fn)]

//! Cross-machine DRAM row conflict experiment over RDMA.
//!
//! An Intermediary hosts memory, a Sender modulates a message by hammering conflicting rows of
//! it with paced one-sided reads, and a Receiver times its own reads to the same banks.

pub mod address_selector;
pub mod config;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod roles;
pub mod samples;
pub mod scheduler;

pub use address_selector::{AddressSelector, AddressSet};
pub use config::{ConfigError, ExperimentConfig, IntermediaryArgs, ReceiverArgs, SenderArgs};
pub use connection::{ConnectionManager, ExperimentState, Progress};
pub use error::ExperimentError;
pub use samples::{LatencySummary, LatencyTrace};
