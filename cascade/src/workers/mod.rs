//! Worker implementations: the batch loop, copy workers and their supervision.

pub mod apply;
pub mod base;
pub mod copy;
pub mod policy;
pub mod pool;
