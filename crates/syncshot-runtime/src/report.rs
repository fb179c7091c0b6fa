//! Session report
//!
//! Everything the coordinator learned during one session, written once at
//! the end. Nothing is read back.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use syncshot_core::{AgentId, CaptureSettings, RoundHistory, SyncError, SyncResult};
use syncshot_time::{pairwise_skew, worst_pair, PairSkew, PairSkewStats, REFERENCE_ROUND};

/// How far the shutdown sequence got
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownStage {
    /// The session failed before the round loop (accept or settings)
    NotStarted,
    /// Some agent did not acknowledge STOP_RECORD; results were not collected
    TerminationFailed,
    /// Some agent did not report READY
    ReadinessFailed,
    /// Some agent did not send a valid anomaly report
    AnomalyCollectionFailed,
    /// Anomaly reports collected and pulls attempted for every agent
    Collected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionReport {
    pub settings: CaptureSettings,
    pub agents: Vec<AgentId>,
    pub history: RoundHistory,
    /// First failure that cut the session short; `None` when every round
    /// and barrier succeeded
    pub abort_reason: Option<String>,
    #[serde(skip)]
    pub abort: Option<SyncError>,
    pub shutdown: ShutdownStage,
    /// Flagged rounds per agent; agents with a clean report map to `[]`
    pub anomalies: BTreeMap<AgentId, Vec<u32>>,
    /// Pulled artifact size in bytes per agent
    pub artifacts: BTreeMap<AgentId, usize>,
    pub pull_failures: BTreeMap<AgentId, String>,
    /// Cross-agent capture-time differences over the measured rounds
    pub skew: Vec<PairSkew>,
    /// Max and mean of `skew` for every pair that shared a round
    pub skew_stats: Vec<PairSkewStats>,
}

impl SessionReport {
    pub fn new(settings: CaptureSettings) -> Self {
        Self {
            settings,
            agents: Vec::new(),
            history: RoundHistory::new(),
            abort_reason: None,
            abort: None,
            shutdown: ShutdownStage::NotStarted,
            anomalies: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            pull_failures: BTreeMap::new(),
            skew: Vec::new(),
            skew_stats: Vec::new(),
        }
    }

    /// Record why the session was cut short; the first reason wins
    pub fn set_abort(&mut self, error: SyncError) {
        if self.abort.is_none() {
            self.abort_reason = Some(error.to_string());
            self.abort = Some(error);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }

    /// Compute pairwise skew from the round history
    pub fn compute_skew(&mut self) {
        let series = self
            .agents
            .iter()
            .map(|agent| (*agent, self.history.elapsed_series(*agent)))
            .collect();
        self.skew = pairwise_skew(&series, REFERENCE_ROUND + 1);
        self.skew_stats = self.skew.iter().filter_map(PairSkew::stats).collect();
    }

    /// True when the session ran to completion with no anomaly and every
    /// artifact pulled
    pub fn is_clean(&self) -> bool {
        !self.is_aborted()
            && self.shutdown == ShutdownStage::Collected
            && self.anomalies.values().all(|rounds| rounds.is_empty())
            && self.pull_failures.is_empty()
    }

    pub fn to_json_pretty(&self) -> SyncResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Packaging(format!("session report: {}", e)))
    }

    pub fn write_json(&self, path: &Path) -> SyncResult<()> {
        let json = self.to_json_pretty()?;
        std::fs::write(path, json)
            .map_err(|e| SyncError::Packaging(format!("{}: {}", path.display(), e)))
    }
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} agents, {} rounds ({} complete)",
            self.agents.len(),
            self.history.len(),
            self.history.completed()
        )?;
        if let Some(reason) = &self.abort_reason {
            writeln!(f, "aborted: {}", reason)?;
        }
        writeln!(f, "shutdown: {:?}", self.shutdown)?;
        for (agent, rounds) in &self.anomalies {
            if !rounds.is_empty() {
                writeln!(f, "agent {} anomalous rounds: {:?}", agent, rounds)?;
            }
        }
        for (agent, detail) in &self.pull_failures {
            writeln!(f, "agent {} pull failed: {}", agent, detail)?;
        }
        for pair in &self.skew_stats {
            writeln!(
                f,
                "skew agents {}/{}: max {:.3} ms, mean {:+.3} ms over {} rounds",
                pair.a,
                pair.b,
                pair.max_abs_nanos as f64 / 1e6,
                pair.mean_nanos / 1e6,
                pair.rounds
            )?;
        }
        if let Some(worst) = worst_pair(&self.skew) {
            if let Some(max) = worst.max_abs_nanos() {
                writeln!(
                    f,
                    "worst skew: agents {}/{} at {:.3} ms",
                    worst.a,
                    worst.b,
                    max as f64 / 1e6
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use syncshot_core::{AgentOutcome, RoundRecord, Timestamp};

    fn id(n: u32) -> AgentId {
        AgentId::new(n).unwrap()
    }

    fn report_with_rounds() -> SessionReport {
        let mut report = SessionReport::new(CaptureSettings::default());
        report.agents = vec![id(1), id(2)];
        for round in 1..=5 {
            let mut record = RoundRecord::new(round, Timestamp::from_nanos(round as u64 * 1_000));
            for (agent, micros) in [(id(1), 50_000), (id(2), 50_000 + round as u64 * 100)] {
                record.outcomes.insert(agent, AgentOutcome::Ok);
                record.elapsed.insert(agent, Duration::from_micros(micros));
            }
            report.history.push(record);
        }
        report
    }

    #[test]
    fn test_first_abort_reason_wins() {
        let mut report = SessionReport::new(CaptureSettings::default());
        report.set_abort(SyncError::ResourceExhaustion(id(2)));
        report.set_abort(SyncError::OperatorAbort);

        assert_eq!(report.abort, Some(SyncError::ResourceExhaustion(id(2))));
        assert_eq!(
            report.abort_reason.as_deref(),
            Some("Agent 2 reported resource exhaustion")
        );
    }

    #[test]
    fn test_skew_starts_after_reference_round() {
        let mut report = report_with_rounds();
        report.compute_skew();

        assert_eq!(report.skew.len(), 1);
        assert_eq!(
            report.skew[0].samples,
            vec![(4, -400_000), (5, -500_000)]
        );
    }

    #[test]
    fn test_json_output() {
        let mut report = report_with_rounds();
        report.shutdown = ShutdownStage::Collected;
        report.anomalies.insert(id(1), vec![]);
        report.anomalies.insert(id(2), vec![]);
        report.compute_skew();
        assert!(report.is_clean());

        let json = report.to_json_pretty().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["history"].as_array().unwrap().len(), 5);
        assert_eq!(value["shutdown"], "Collected");
        assert!(value["abort_reason"].is_null());
        assert_eq!(value["skew_stats"][0]["max_abs_nanos"], 500_000);
        assert_eq!(value["skew_stats"][0]["mean_nanos"], -450_000.0);
    }

    #[test]
    fn test_summary_text() {
        let mut report = report_with_rounds();
        report.set_abort(SyncError::OperatorAbort);
        report.pull_failures.insert(id(2), "scp: connection refused".into());
        report.compute_skew();

        let text = report.to_string();
        assert!(text.contains("skew agents 1/2: max 0.500 ms, mean -0.450 ms over 2 rounds"));
        assert!(text.starts_with("2 agents, 5 rounds (5 complete)"));
        assert!(text.contains("aborted: Operator aborted the session"));
        assert!(text.contains("agent 2 pull failed"));
        assert!(!report.is_clean());
    }
}
