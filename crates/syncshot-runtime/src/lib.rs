//! SyncShot Runtime - coordinator session and agent trigger loop
//!
//! This crate implements both ends of a capture session:
//! - The coordinator: launch, accept & identify, settings, round loop,
//!   termination and readiness barriers, anomaly collection, artifact pull
//! - The agent: deadline-scheduled capture, resource circuit breaker,
//!   timing analysis and result packaging
//! - The per-agent link tasks and barriers the coordinator is built on
//! - Interfaces to cameras, resource probes, launchers and artifact pulls
//! - Configuration, logging setup and the session report

pub mod agent;
pub mod barrier;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod external;
pub mod link;
pub mod probe;
pub mod report;
pub mod telemetry;

pub use agent::{run_agent, Agent, AgentState, AgentSummary};
pub use config::*;
pub use coordinator::{AbortHandle, Coordinator};
pub use device::{Camera, CommandCamera, SimulatedCamera};
pub use external::{
    ArtifactPuller, BoxFuture, CommandLauncher, CommandPuller, DirectoryPackager, Launcher,
    NoopLauncher, ResultPackager,
};
pub use link::AgentLink;
pub use probe::{FixedProbe, ResourceProbe, ResourceUsage, SysinfoProbe};
pub use report::{SessionReport, ShutdownStage};
pub use telemetry::{init_logging, LogFormat, LoggingConfig};
