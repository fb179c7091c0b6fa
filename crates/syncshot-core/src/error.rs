//! Error types for the SyncShot protocol

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::AgentId;

/// Core SyncShot errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    // Framing errors
    #[error("Unknown keyword: {0:?}")]
    UnknownKeyword(String),

    #[error("Malformed {keyword} frame: {detail}")]
    MalformedFrame { keyword: &'static str, detail: String },

    #[error("Frame too long: limit {limit}, buffered {actual}")]
    FrameTooLong { limit: usize, actual: usize },

    #[error("Frame is not valid UTF-8")]
    InvalidEncoding,

    // Round loop errors
    #[error("Protocol violation by agent {agent}: expected {expected}, received {received}")]
    ProtocolViolation {
        agent: AgentId,
        expected: &'static str,
        received: String,
    },

    #[error("Agent {0} reported resource exhaustion")]
    ResourceExhaustion(AgentId),

    #[error("Connection to agent {0} lost")]
    ConnectionLoss(AgentId),

    #[error("Agent {agent} did not reply within {waited:?}")]
    ReplyTimeout { agent: AgentId, waited: Duration },

    #[error("Capture failed: {0}")]
    CaptureFailure(String),

    #[error("Operator aborted the session")]
    OperatorAbort,

    // Agent-side protocol errors (no coordinator-assigned identity)
    #[error("Unexpected message in state {state}: {received}")]
    UnexpectedMessage {
        state: &'static str,
        received: String,
    },

    // Session setup errors
    #[error("Invalid capture settings: {0}")]
    InvalidSettings(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Agent roster is not a bijection onto 1..={expected}: {detail}")]
    IdentityConflict { expected: usize, detail: String },

    #[error("Cannot derive an agent id from {0}")]
    UnidentifiablePeer(SocketAddr),

    #[error("Timed out accepting agents: {accepted} of {expected} connected")]
    AcceptTimeout { accepted: usize, expected: usize },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("No frame received within {0:?}")]
    ReceiveTimeout(Duration),

    // External interface errors
    #[error("Launch failed for {address}: {detail}")]
    Launch { address: String, detail: String },

    #[error("Artifact pull failed for agent {agent}: {detail}")]
    Pull { agent: AgentId, detail: String },

    #[error("Result packaging failed: {0}")]
    Packaging(String),
}

impl SyncError {
    /// Attribute an anonymous transport failure to the agent behind the link.
    ///
    /// A closed stream becomes `ConnectionLoss`, an expired receive becomes
    /// `ReplyTimeout`; everything else is returned unchanged.
    pub fn for_agent(self, agent: AgentId) -> SyncError {
        match self {
            SyncError::ConnectionClosed | SyncError::Transport(_) => SyncError::ConnectionLoss(agent),
            SyncError::ReceiveTimeout(waited) => SyncError::ReplyTimeout { agent, waited },
            other => other,
        }
    }

    /// True for errors after which the connection cannot carry further frames.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            SyncError::UnknownKeyword(_)
                | SyncError::MalformedFrame { .. }
                | SyncError::FrameTooLong { .. }
                | SyncError::InvalidEncoding
                | SyncError::ConnectionClosed
                | SyncError::ConnectionLoss(_)
                | SyncError::Transport(_)
        )
    }
}

/// Result type for SyncShot operations
pub type SyncResult<T> = Result<T, SyncError>;
