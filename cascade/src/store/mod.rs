//! Transactional writes on the target node and table registry access.

pub mod base;
pub mod postgres;
