//! Coordinator listener: accept & identify

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::Instant;

use syncshot_core::{verify_roster, AgentId, SyncError, SyncResult};

use crate::Connection;

/// Default coordinator port
pub const DEFAULT_PORT: u16 = 5000;

/// An accepted agent connection together with its derived identity
pub type IdentifiedConnection = (AgentId, Connection);

/// TCP listener the agents connect to
pub struct AgentListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl AgentListener {
    pub async fn bind(addr: SocketAddr) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        tracing::info!(%local_addr, "listening for agents");
        Ok(AgentListener {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one connection and derive the agent id from its peer address
    pub async fn accept(&self) -> SyncResult<IdentifiedConnection> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let id = AgentId::from_peer_addr(&peer)?;
        let connection = Connection::from_tcp(stream)?;

        tracing::info!(agent = %id, %peer, "agent connected");
        Ok((id, connection))
    }

    /// Accept exactly `expected` agents within `timeout`.
    ///
    /// The result is sorted by agent id regardless of arrival order, and the
    /// ids are verified to be exactly `1..=expected`.
    pub async fn accept_agents(
        &self,
        expected: usize,
        timeout: Duration,
    ) -> SyncResult<Vec<IdentifiedConnection>> {
        let deadline = Instant::now() + timeout;
        let mut agents: Vec<IdentifiedConnection> = Vec::with_capacity(expected);

        while agents.len() < expected {
            match tokio::time::timeout_at(deadline, self.accept()).await {
                Ok(accepted) => agents.push(accepted?),
                Err(_) => {
                    tracing::warn!(accepted = agents.len(), expected, "accept window closed");
                    return Err(SyncError::AcceptTimeout {
                        accepted: agents.len(),
                        expected,
                    });
                }
            }
        }

        agents.sort_by_key(|(id, _)| *id);
        let ids: Vec<AgentId> = agents.iter().map(|(id, _)| *id).collect();
        verify_roster(&ids, expected)?;

        tracing::info!(count = expected, "all agents identified");
        Ok(agents)
    }
}
