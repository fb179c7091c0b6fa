//! Raw-protocol agents that break the protocol on cue
//!
//! A rogue agent speaks the wire protocol directly through a
//! [`Connection`] instead of running the real trigger loop, so it can fall
//! silent, disconnect, or send the wrong keyword at an exact point.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use syncshot_core::{AgentId, SyncError, SyncResult};
use syncshot_transport::{connect_with_retry, Connection};
use syncshot_wire::Message;

use crate::doubles::NOMINAL_ELAPSED;

/// How a rogue agent misbehaves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RogueBehavior {
    /// Read everything, never reply
    Silent,
    /// Drop the connection on receiving TAKE_PHOTO for this round
    DisconnectAtRound(u32),
    /// Answer TAKE_PHOTO for this round with READY
    WrongReplyAtRound(u32),
    /// Play along with every round but never acknowledge STOP_RECORD
    IgnoreStop,
}

/// A misbehaving agent connecting from a chosen source address
pub struct RogueAgent {
    agent: AgentId,
    behavior: RogueBehavior,
}

impl RogueAgent {
    pub fn new(agent: AgentId, behavior: RogueBehavior) -> Self {
        Self { agent, behavior }
    }

    /// Connect and misbehave until the coordinator closes the connection
    pub async fn run(self, coordinator: SocketAddr, source: IpAddr) -> SyncResult<()> {
        let mut connection =
            connect_with_retry(coordinator, Some(source), 50, Duration::from_millis(20)).await?;
        let result = self.serve(&mut connection).await;
        connection.shutdown().await;
        match result {
            Err(SyncError::ConnectionClosed) | Err(SyncError::Transport(_)) => Ok(()),
            other => other,
        }
    }

    async fn serve(&self, connection: &mut Connection) -> SyncResult<()> {
        let agent = self.agent;
        let mut round = 0;

        loop {
            let message = connection.recv().await?;
            tracing::debug!(%agent, behavior = ?self.behavior, %message, "rogue received");

            if self.behavior == RogueBehavior::Silent {
                continue;
            }

            match message {
                Message::Settings(_) => {}
                Message::TakePhoto { .. } => {
                    round += 1;
                    match self.behavior {
                        RogueBehavior::DisconnectAtRound(r) if r == round => return Ok(()),
                        RogueBehavior::WrongReplyAtRound(r) if r == round => {
                            connection.send(&Message::Ready).await?;
                        }
                        _ => {
                            connection
                                .send(&Message::PhotoTaken {
                                    elapsed: Some(NOMINAL_ELAPSED),
                                })
                                .await?;
                        }
                    }
                }
                Message::StopRecord if self.behavior == RogueBehavior::IgnoreStop => {}
                Message::StopRecord => {
                    connection.send(&Message::RecordingStopped).await?;
                    connection.send(&Message::Ready).await?;
                    connection
                        .send(&Message::Anomalies {
                            agent,
                            rounds: Vec::new(),
                        })
                        .await?;
                }
                Message::ExtractionComplete => return Ok(()),
                _ => {}
            }
        }
    }
}
