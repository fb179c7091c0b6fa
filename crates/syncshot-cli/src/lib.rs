//! SyncShot CLI - argument parsing shared by the coordinator and agent
//! binaries

pub mod args;

pub use args::*;
