//! Coordination primitives shared by workers and administrative commands.

pub mod shutdown;
pub mod wait;
