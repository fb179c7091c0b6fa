//! SyncShot Test Harness - whole-fleet sessions in one process
//!
//! This crate provides:
//! - Scripted cameras and resource probes
//! - An in-memory artifact store standing in for packaging and the pull
//! - Raw-protocol agents that misbehave on cue
//! - A fleet harness running a real coordinator against N agents over
//!   loopback TCP

pub mod doubles;
pub mod fleet;
pub mod rogue;

#[cfg(test)]
mod scenarios;

pub use doubles::*;
pub use fleet::*;
pub use rogue::*;
