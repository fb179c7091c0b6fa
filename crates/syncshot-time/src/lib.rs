//! SyncShot Time - fleet clock and timing analysis
//!
//! This crate implements:
//! - The fleet clock abstraction and its system implementation
//! - The deadline spin-wait used to fire captures
//! - Per-agent anomaly classification against a fixed reference round
//! - Cross-agent capture-time skew aggregation

pub mod analysis;
pub mod clock;
pub mod skew;

pub use analysis::*;
pub use clock::*;
pub use skew::*;
