//! Per-agent capture timing analysis
//!
//! The first captures after camera initialisation are slow and erratic, so
//! rounds 1 and 2 never enter the statistics. Round 3 becomes the agent's
//! reference duration and every later round is compared against it. The
//! policy is fixed; a rolling baseline would hide slow drift.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use syncshot_core::{duration_as_nanos, AgentId};

/// Rounds discarded as camera warm-up
pub const WARMUP_ROUNDS: u32 = 2;

/// Round whose capture duration becomes the reference
pub const REFERENCE_ROUND: u32 = WARMUP_ROUNDS + 1;

/// Relative error above which a round is anomalous
pub const ANOMALY_THRESHOLD: f64 = 0.06;

/// `ANOMALY_THRESHOLD` in percent, for exact integer comparison
const ANOMALY_THRESHOLD_PERCENT: u128 = 6;

/// `|elapsed - reference| / reference`
///
/// A zero reference makes every non-zero sample infinitely wrong.
pub fn relative_error(elapsed: Duration, reference: Duration) -> f64 {
    let reference_s = reference.as_secs_f64();
    let diff_s = (elapsed.as_secs_f64() - reference_s).abs();
    if reference.is_zero() {
        return if elapsed.is_zero() { 0.0 } else { f64::INFINITY };
    }
    diff_s / reference_s
}

/// Whether `elapsed` deviates from `reference` by strictly more than 6%.
///
/// Evaluated on integer nanoseconds so the boundary is exact: a deviation
/// of exactly 6% passes.
pub fn exceeds_threshold(elapsed: Duration, reference: Duration) -> bool {
    let elapsed_ns = elapsed.as_nanos();
    let reference_ns = reference.as_nanos();
    let diff_ns = elapsed_ns.abs_diff(reference_ns);
    diff_ns * 100 > reference_ns * ANOMALY_THRESHOLD_PERCENT
}

/// A round that entered the statistics
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasuredRound {
    pub round: u32,
    pub elapsed: Duration,
    pub relative_error: f64,
    pub anomalous: bool,
}

/// What the analyzer did with a sample
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleVerdict {
    /// Rounds 1..=2
    WarmUp,
    /// Round 3 set the reference
    Reference(Duration),
    /// Round 3 arrived again after the reference was fixed
    ReferenceAlreadySet,
    Measured(MeasuredRound),
    /// No reference exists (round 3 failed), the round cannot be vouched for
    Unreferenced,
}

/// Anomaly report of one agent, sent after the round loop ends
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub agent: AgentId,
    pub rounds: Vec<u32>,
}

impl AnomalyReport {
    pub fn is_clean(&self) -> bool {
        self.rounds.is_empty()
    }
}

/// Per-agent timing classifier
#[derive(Clone, Debug, Default)]
pub struct TimingAnalyzer {
    reference: Option<Duration>,
    measured: Vec<MeasuredRound>,
    anomalies: Vec<u32>,
}

impl TimingAnalyzer {
    pub fn new() -> Self {
        TimingAnalyzer::default()
    }

    /// Feed the capture duration of `round` (1-based).
    pub fn record(&mut self, round: u32, elapsed: Duration) -> SampleVerdict {
        if round <= WARMUP_ROUNDS {
            return SampleVerdict::WarmUp;
        }

        if round == REFERENCE_ROUND {
            if self.reference.is_some() {
                return SampleVerdict::ReferenceAlreadySet;
            }
            self.reference = Some(elapsed);
            return SampleVerdict::Reference(elapsed);
        }

        let Some(reference) = self.reference else {
            self.flag(round);
            return SampleVerdict::Unreferenced;
        };

        let anomalous = exceeds_threshold(elapsed, reference);
        let measured = MeasuredRound {
            round,
            elapsed,
            relative_error: relative_error(elapsed, reference),
            anomalous,
        };
        self.measured.push(measured);
        if anomalous {
            self.flag(round);
        }
        SampleVerdict::Measured(measured)
    }

    /// A round whose capture failed outright is always anomalous
    pub fn record_failure(&mut self, round: u32) {
        self.flag(round);
    }

    fn flag(&mut self, round: u32) {
        if let Err(pos) = self.anomalies.binary_search(&round) {
            self.anomalies.insert(pos, round);
        }
    }

    pub fn reference(&self) -> Option<Duration> {
        self.reference
    }

    pub fn measured(&self) -> &[MeasuredRound] {
        &self.measured
    }

    /// Flagged round indices in ascending order
    pub fn anomalies(&self) -> &[u32] {
        &self.anomalies
    }

    pub fn report(&self, agent: AgentId) -> AnomalyReport {
        AnomalyReport {
            agent,
            rounds: self.anomalies.clone(),
        }
    }

    /// Results table shipped back with the captured images
    pub fn to_csv(&self) -> String {
        let mut out = String::from("Photo_Index,Capture_Time (s),Relative_Error (%)\n");
        for m in &self.measured {
            // Writing into a String cannot fail
            let _ = writeln!(
                out,
                "{},{:.9},{:.4}",
                m.round,
                duration_as_nanos(m.elapsed) as f64 / 1e9,
                m.relative_error * 100.0
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn agent() -> AgentId {
        AgentId::new(1).unwrap()
    }

    #[test]
    fn test_warmup_rounds_are_discarded() {
        let mut analyzer = TimingAnalyzer::new();
        assert_eq!(analyzer.record(1, ms(400)), SampleVerdict::WarmUp);
        assert_eq!(analyzer.record(2, ms(300)), SampleVerdict::WarmUp);
        assert_eq!(analyzer.reference(), None);

        assert_eq!(analyzer.record(3, ms(50)), SampleVerdict::Reference(ms(50)));
        assert!(analyzer.anomalies().is_empty());
        assert!(analyzer.measured().is_empty());
    }

    #[test]
    fn test_reference_is_never_overwritten() {
        let mut analyzer = TimingAnalyzer::new();
        analyzer.record(3, ms(50));
        assert_eq!(analyzer.record(3, ms(90)), SampleVerdict::ReferenceAlreadySet);
        assert_eq!(analyzer.reference(), Some(ms(50)));
    }

    #[test]
    fn test_baseline_independent_of_warmup_data() {
        let later = [ms(51), ms(49), ms(60), ms(50)];

        let mut fast_warmup = TimingAnalyzer::new();
        fast_warmup.record(1, ms(10));
        fast_warmup.record(2, ms(20));

        let mut slow_warmup = TimingAnalyzer::new();
        slow_warmup.record(1, ms(900));
        slow_warmup.record(2, ms(700));

        for analyzer in [&mut fast_warmup, &mut slow_warmup] {
            analyzer.record(3, ms(50));
            for (i, elapsed) in later.iter().enumerate() {
                analyzer.record(4 + i as u32, *elapsed);
            }
        }

        assert_eq!(fast_warmup.reference(), slow_warmup.reference());
        assert_eq!(fast_warmup.measured(), slow_warmup.measured());
        assert_eq!(fast_warmup.anomalies(), &[6]);
        assert_eq!(slow_warmup.anomalies(), &[6]);
    }

    #[test]
    fn test_baseline_does_not_roll() {
        let mut analyzer = TimingAnalyzer::new();
        analyzer.record(3, ms(100));
        // Each step is within 6% of the previous one, but the drift adds up
        analyzer.record(4, ms(105));
        analyzer.record(5, ms(110));

        assert_eq!(analyzer.anomalies(), &[5]);
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let reference = Duration::from_nanos(1_000_000);

        // Exactly 6.000%
        assert!(!exceeds_threshold(Duration::from_nanos(1_060_000), reference));
        assert!(!exceeds_threshold(Duration::from_nanos(940_000), reference));
        // 6.0001%
        assert!(exceeds_threshold(Duration::from_nanos(1_060_001), reference));
        assert!(exceeds_threshold(Duration::from_nanos(939_999), reference));
    }

    #[test]
    fn test_boundary_through_analyzer() {
        let mut analyzer = TimingAnalyzer::new();
        analyzer.record(3, Duration::from_nanos(50_000_000));
        analyzer.record(4, Duration::from_nanos(53_000_000));
        assert!(analyzer.report(agent()).is_clean());

        analyzer.record(5, Duration::from_nanos(53_000_050));
        assert_eq!(analyzer.report(agent()).rounds, vec![5]);
    }

    #[test]
    fn test_twenty_percent_late_round_is_flagged() {
        let mut analyzer = TimingAnalyzer::new();
        for round in 1..=6 {
            analyzer.record(round, ms(50));
        }
        let verdict = analyzer.record(7, ms(60));

        let SampleVerdict::Measured(m) = verdict else {
            panic!("round 7 should be measured, got {:?}", verdict);
        };
        assert!((m.relative_error - 0.2).abs() < 1e-9);
        assert!(m.anomalous);
        assert_eq!(analyzer.anomalies(), &[7]);
    }

    #[test]
    fn test_failures_and_missing_reference() {
        let mut analyzer = TimingAnalyzer::new();
        analyzer.record_failure(3);
        assert_eq!(analyzer.record(4, ms(50)), SampleVerdict::Unreferenced);
        assert_eq!(analyzer.anomalies(), &[3, 4]);
    }

    #[test]
    fn test_zero_reference() {
        assert_eq!(relative_error(Duration::ZERO, Duration::ZERO), 0.0);
        assert!(relative_error(ms(1), Duration::ZERO).is_infinite());
        assert!(exceeds_threshold(ms(1), Duration::ZERO));
        assert!(!exceeds_threshold(Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn test_csv_table() {
        let mut analyzer = TimingAnalyzer::new();
        analyzer.record(3, ms(50));
        analyzer.record(4, ms(60));

        let csv = analyzer.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Photo_Index,Capture_Time (s),Relative_Error (%)");
        assert_eq!(lines[1], "4,0.060000000,20.0000");
        assert_eq!(lines.len(), 2);
    }

    proptest::proptest! {
        #[test]
        fn prop_warmup_never_changes_the_report(
            warmup in proptest::collection::vec(0u64..5_000_000_000, 2),
            reference in 1u64..1_000_000_000,
            later in proptest::collection::vec(0u64..2_000_000_000, 0..20),
        ) {
            let run = |first: u64, second: u64| {
                let mut analyzer = TimingAnalyzer::new();
                analyzer.record(1, Duration::from_nanos(first));
                analyzer.record(2, Duration::from_nanos(second));
                analyzer.record(3, Duration::from_nanos(reference));
                for (i, nanos) in later.iter().enumerate() {
                    analyzer.record(4 + i as u32, Duration::from_nanos(*nanos));
                }
                analyzer.report(agent())
            };

            proptest::prop_assert_eq!(run(warmup[0], warmup[1]), run(reference, reference));
        }

        #[test]
        fn prop_flag_agrees_with_relative_error(
            reference in 1_000u64..10_000_000_000,
            elapsed in 0u64..20_000_000_000,
        ) {
            let reference = Duration::from_nanos(reference);
            let elapsed = Duration::from_nanos(elapsed);
            let error = relative_error(elapsed, reference);
            // Float rounding only matters right at the boundary
            proptest::prop_assume!((error - ANOMALY_THRESHOLD).abs() > 1e-9);

            proptest::prop_assert_eq!(
                exceeds_threshold(elapsed, reference),
                error > ANOMALY_THRESHOLD
            );
        }
    }
}
