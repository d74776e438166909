//! Node RPC seams and their Postgres implementation.

pub mod base;
pub mod postgres;
