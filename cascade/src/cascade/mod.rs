//! Cascade layer: what a node does with each batch besides applying business events.

pub mod propagator;
pub mod watermark;
pub mod worker_state;
