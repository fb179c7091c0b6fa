//! SyncShot Transport - TCP connections between coordinator and agents
//!
//! This crate provides:
//! - Framed, timeout-bounded message connections over any async byte stream
//! - The agent-side connect with optional source address and retry
//! - The coordinator-side listener that accepts and identifies N agents

pub mod connection;
pub mod listener;

pub use connection::*;
pub use listener::*;
