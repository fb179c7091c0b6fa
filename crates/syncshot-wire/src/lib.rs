//! SyncShot Wire Protocol - Text message format
//!
//! This crate implements the coordinator/agent wire format:
//! - A closed vocabulary of keyword messages with numeric arguments
//! - One message per `\n`-terminated ASCII line
//! - A buffering decoder that tolerates merged and fragmented reads

pub mod framing;
pub mod message;

pub use framing::*;
pub use message::*;
