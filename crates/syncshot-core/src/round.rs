//! Round records and session round history

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AgentId, Timestamp};

/// Per-agent result of one round
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentOutcome {
    /// PHOTO_TAKEN
    Ok,
    /// Protocol violation, capture failure, timeout or lost connection
    Failed,
    /// RAM_LOW
    Degraded,
}

/// One synchronized trigger cycle across the fleet.
///
/// Written once when the round completes or aborts, never mutated after
/// being appended to the history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    /// 1-based round index
    pub round_index: u32,
    /// Absolute capture deadline broadcast for this round
    pub deadline: Timestamp,
    /// Capture durations reported by the agents that acknowledged
    pub elapsed: BTreeMap<AgentId, Duration>,
    pub outcomes: BTreeMap<AgentId, AgentOutcome>,
}

impl RoundRecord {
    pub fn new(round_index: u32, deadline: Timestamp) -> Self {
        RoundRecord {
            round_index,
            deadline,
            elapsed: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }

    /// True when every agent acknowledged with PHOTO_TAKEN
    pub fn is_complete(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.values().all(|o| *o == AgentOutcome::Ok)
    }

    /// Agents that did not acknowledge the round
    pub fn failed_agents(&self) -> Vec<AgentId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| **o != AgentOutcome::Ok)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Append-only history of the rounds of one session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundHistory {
    rounds: Vec<RoundRecord>,
}

impl RoundHistory {
    pub fn new() -> Self {
        RoundHistory::default()
    }

    pub fn push(&mut self, record: RoundRecord) {
        debug_assert!(
            self.rounds
                .last()
                .map_or(true, |last| last.round_index < record.round_index),
            "round indices must increase"
        );
        self.rounds.push(record);
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.rounds.last()
    }

    /// Number of rounds every agent acknowledged
    pub fn completed(&self) -> usize {
        self.rounds.iter().filter(|r| r.is_complete()).count()
    }

    /// Elapsed series of one agent, keyed by round index
    pub fn elapsed_series(&self, agent: AgentId) -> BTreeMap<u32, Duration> {
        self.rounds
            .iter()
            .filter_map(|r| r.elapsed.get(&agent).map(|d| (r.round_index, *d)))
            .collect()
    }
}
