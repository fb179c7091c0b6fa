//! Fleet-wide barriers
//!
//! A barrier sends to every agent in id order, then waits for every reply.
//! Per-agent waits run concurrently, but results are always consumed in
//! agent id order so logs and abort reasons are deterministic. There is no
//! quorum: one missing reply fails the barrier.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use syncshot_core::{AgentId, SyncError, SyncResult};
use syncshot_wire::{Keyword, Message};

use crate::link::AgentLink;

/// Per-agent results of one barrier, in agent id order
pub type BarrierResults<T> = Vec<(AgentId, SyncResult<T>)>;

/// Round replies a late agent may still have in flight when STOP_RECORD
/// goes out
pub const STALE_ROUND_REPLIES: &[Keyword] =
    &[Keyword::PhotoTaken, Keyword::RamLow, Keyword::CaptureFailed];

/// Send `message` to every link, one after the other
pub async fn broadcast(links: &[AgentLink], message: &Message) -> BarrierResults<()> {
    let mut results = Vec::with_capacity(links.len());
    for link in links {
        let result = link.send(message.clone()).await;
        if let Err(e) = &result {
            tracing::warn!(agent = %link.agent(), keyword = %message.keyword(), "send failed: {}", e);
        }
        results.push((link.agent(), result));
    }
    results
}

/// Run `f` for every link concurrently and collect the results in link order
pub async fn for_each_link<F, Fut, T>(links: &[AgentLink], f: F) -> BarrierResults<T>
where
    F: Fn(AgentLink) -> Fut,
    Fut: Future<Output = SyncResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let tasks: Vec<_> = links
        .iter()
        .map(|link| (link.agent(), tokio::spawn(f(link.clone()))))
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for (agent, task) in tasks {
        let result = task
            .await
            .unwrap_or_else(|_| Err(SyncError::ConnectionLoss(agent)));
        results.push((agent, result));
    }
    results
}

/// Exactly one reply from every link, whatever it is
pub async fn gather(links: &[AgentLink], timeout: Duration) -> BarrierResults<Message> {
    // Queue every receive first so all agents are waited on at once
    let mut pending = Vec::with_capacity(links.len());
    for link in links {
        pending.push((link.agent(), link.start_recv(timeout).await));
    }

    let mut results = Vec::with_capacity(pending.len());
    for (agent, reply) in pending {
        results.push((agent, reply.wait().await.map_err(|e| framing_violation(e, agent, "a reply"))));
    }
    results
}

/// Wait for a reply with one of the `expected` keywords from every link.
///
/// Replies listed in `skip` are discarded while waiting; anything else is a
/// protocol violation. `timeout` bounds the whole wait per agent, skipped
/// frames included.
pub async fn expect_all(
    links: &[AgentLink],
    expected: &'static [Keyword],
    skip: &'static [Keyword],
    timeout: Duration,
) -> BarrierResults<Message> {
    for_each_link(links, move |link| expect_reply(link, expected, skip, timeout)).await
}

async fn expect_reply(
    link: AgentLink,
    expected: &'static [Keyword],
    skip: &'static [Keyword],
    timeout: Duration,
) -> SyncResult<Message> {
    let agent = link.agent();
    let expected_name = expected.first().map_or("nothing", |k| k.as_str());
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SyncError::ReplyTimeout {
                agent,
                waited: timeout,
            });
        }

        let message = link
            .recv(remaining)
            .await
            .map_err(|e| match e {
                SyncError::ReplyTimeout { agent, .. } => SyncError::ReplyTimeout {
                    agent,
                    waited: timeout,
                },
                other => framing_violation(other, agent, expected_name),
            })?;

        let keyword = message.keyword();
        if expected.contains(&keyword) {
            return Ok(message);
        }
        if skip.contains(&keyword) {
            tracing::debug!(%agent, %keyword, "skipping stale reply");
            continue;
        }
        return Err(SyncError::ProtocolViolation {
            agent,
            expected: expected_name,
            received: message.to_string(),
        });
    }
}

/// A frame the agent sent but that did not decode is a violation by that
/// agent
fn framing_violation(e: SyncError, agent: AgentId, expected: &'static str) -> SyncError {
    match e {
        SyncError::UnknownKeyword(_)
        | SyncError::MalformedFrame { .. }
        | SyncError::FrameTooLong { .. }
        | SyncError::InvalidEncoding => SyncError::ProtocolViolation {
            agent,
            expected,
            received: e.to_string(),
        },
        other => other,
    }
}

/// First failure in agent id order, if any
pub fn first_failure<T>(results: &BarrierResults<T>) -> Option<&SyncError> {
    results.iter().find_map(|(_, r)| r.as_ref().err())
}
