//! SyncShot Core - Fundamental types and primitives
//!
//! This crate defines the core types shared by the coordinator and agents:
//! - Agent identities and roster verification
//! - Fleet-clock timestamps
//! - Capture settings
//! - Round records and history
//! - The protocol error taxonomy

pub mod id;
pub mod time;
pub mod settings;
pub mod round;
pub mod error;

pub use id::*;
pub use time::*;
pub use settings::*;
pub use round::*;
pub use error::*;
