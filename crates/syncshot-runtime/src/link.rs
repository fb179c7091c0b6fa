//! Per-agent connection task
//!
//! Each accepted connection is owned by exactly one task. The session talks
//! to it through an [`AgentLink`] handle, so barriers can wait on many
//! agents at once without sharing any stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use syncshot_core::{AgentId, SyncError, SyncResult};
use syncshot_transport::Connection;
use syncshot_wire::Message;

const REQUEST_QUEUE: usize = 16;

enum LinkRequest {
    Send {
        message: Message,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Recv {
        timeout: Duration,
        reply: oneshot::Sender<SyncResult<Message>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the task owning one agent's connection
#[derive(Clone, Debug)]
pub struct AgentLink {
    agent: AgentId,
    requests: mpsc::Sender<LinkRequest>,
}

/// A receive that has been queued but not yet awaited
pub struct PendingReply {
    agent: AgentId,
    reply: Option<oneshot::Receiver<SyncResult<Message>>>,
}

impl PendingReply {
    pub async fn wait(self) -> SyncResult<Message> {
        match self.reply {
            Some(rx) => rx.await.unwrap_or(Err(SyncError::ConnectionLoss(self.agent))),
            None => Err(SyncError::ConnectionLoss(self.agent)),
        }
    }
}

impl AgentLink {
    /// Move `connection` into a new task and return its handle
    pub fn spawn<S>(agent: AgentId, connection: Connection<S>) -> AgentLink
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        tokio::spawn(serve(agent, connection, rx));
        AgentLink {
            agent,
            requests: tx,
        }
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub async fn send(&self, message: Message) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(LinkRequest::Send { message, reply })
            .await
            .map_err(|_| SyncError::ConnectionLoss(self.agent))?;
        rx.await.unwrap_or(Err(SyncError::ConnectionLoss(self.agent)))
    }

    /// Queue a receive without waiting for it.
    ///
    /// Requests are served in order, so a receive queued after a send sees
    /// only frames the agent wrote in response to it or later.
    pub async fn start_recv(&self, timeout: Duration) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        let queued = self
            .requests
            .send(LinkRequest::Recv { timeout, reply })
            .await
            .is_ok();
        PendingReply {
            agent: self.agent,
            reply: queued.then_some(rx),
        }
    }

    pub async fn recv(&self, timeout: Duration) -> SyncResult<Message> {
        self.start_recv(timeout).await.wait().await
    }

    /// Shut the connection down and wait for the task to finish
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.requests.send(LinkRequest::Close { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn serve<S>(agent: AgentId, mut connection: Connection<S>, mut requests: mpsc::Receiver<LinkRequest>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    // Set once the stream can no longer carry frames
    let mut broken = false;

    while let Some(request) = requests.recv().await {
        match request {
            LinkRequest::Send { message, reply } => {
                let result = if broken {
                    Err(SyncError::ConnectionLoss(agent))
                } else {
                    connection.send(&message).await.map_err(|e| e.for_agent(agent))
                };
                if let Err(e) = &result {
                    broken |= e.is_fatal_to_connection();
                }
                let _ = reply.send(result);
            }
            LinkRequest::Recv { timeout, reply } => {
                let result = if broken {
                    Err(SyncError::ConnectionLoss(agent))
                } else {
                    connection
                        .recv_timeout(timeout)
                        .await
                        .map_err(|e| e.for_agent(agent))
                };
                if let Err(e) = &result {
                    tracing::debug!(%agent, "receive failed: {}", e);
                    broken |= e.is_fatal_to_connection();
                }
                let _ = reply.send(result);
            }
            LinkRequest::Close { done } => {
                connection.shutdown().await;
                let _ = done.send(());
                break;
            }
        }
    }

    tracing::debug!(%agent, "link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn pair(n: u32) -> (AgentLink, Connection<DuplexStream>) {
        let (a, b) = tokio::io::duplex(256);
        let link = AgentLink::spawn(AgentId::new(n).unwrap(), Connection::new(a));
        (link, Connection::new(b))
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (link, mut agent) = pair(1);

        link.send(Message::StopRecord).await.unwrap();
        assert_eq!(agent.recv().await.unwrap(), Message::StopRecord);

        let pending = link.start_recv(Duration::from_secs(1)).await;
        agent.send(&Message::RecordingStopped).await.unwrap();
        assert_eq!(pending.wait().await.unwrap(), Message::RecordingStopped);
    }

    #[tokio::test]
    async fn test_errors_are_attributed() {
        let (link, agent) = pair(4);
        let id = AgentId::new(4).unwrap();

        assert_eq!(
            link.recv(Duration::from_millis(20)).await,
            Err(SyncError::ReplyTimeout {
                agent: id,
                waited: Duration::from_millis(20)
            })
        );

        drop(agent);
        assert_eq!(
            link.recv(Duration::from_secs(1)).await,
            Err(SyncError::ConnectionLoss(id))
        );
        // Stays broken without touching the stream again
        assert_eq!(
            link.recv(Duration::from_secs(1)).await,
            Err(SyncError::ConnectionLoss(id))
        );
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let (link, mut agent) = pair(2);
        link.close().await;

        assert_eq!(agent.recv().await, Err(SyncError::ConnectionClosed));
        assert_eq!(
            link.send(Message::Ready).await,
            Err(SyncError::ConnectionLoss(AgentId::new(2).unwrap()))
        );
    }
}
