//! Shared types used across the worldhost core crates.

pub mod types;

pub use types::{EntityId, Position};
