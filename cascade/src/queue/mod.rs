//! Batch engine: allocation, reading and acknowledgement of queue batches.

pub mod base;
pub mod postgres;
