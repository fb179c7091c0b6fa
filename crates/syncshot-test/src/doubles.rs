//! Test doubles for the agent's collaborators
//!
//! Everything here is deterministic: cameras replay a per-round script,
//! probes trip on a chosen sample, and artifacts never touch the disk.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use syncshot_core::{AgentId, CaptureSettings, SyncError, SyncResult, Timestamp};
use syncshot_runtime::{
    AbortHandle, ArtifactPuller, BoxFuture, Camera, Launcher, ResourceProbe, ResourceUsage,
    ResultPackager,
};
use syncshot_time::{Clock, SystemClock};

/// Capture time the scripted camera reports when a round has no entry
pub const NOMINAL_ELAPSED: Duration = Duration::from_millis(50);

// ============================================================================
// CAMERA
// ============================================================================

/// One shutter release as seen from the host wall clock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Firing {
    pub round: u32,
    pub deadline: Timestamp,
    /// Wall-clock time the capture started, whatever clock the agent ran on
    pub fired_at: Timestamp,
}

/// Camera that reports a scripted elapsed time per round without sleeping
pub struct ScriptedCamera {
    nominal: Duration,
    rounds: BTreeMap<u32, Option<Duration>>,
    abort_at: Option<(u32, AbortHandle)>,
    captures: Arc<AtomicU32>,
    firings: Arc<Mutex<Vec<Firing>>>,
}

impl ScriptedCamera {
    pub fn steady(nominal: Duration) -> Self {
        Self {
            nominal,
            rounds: BTreeMap::new(),
            abort_at: None,
            captures: Arc::new(AtomicU32::new(0)),
            firings: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Report `elapsed` for `round` instead of the nominal time
    pub fn at_round(mut self, round: u32, elapsed: Duration) -> Self {
        self.rounds.insert(round, Some(elapsed));
        self
    }

    /// Fail the capture of `round`
    pub fn fail_at_round(mut self, round: u32) -> Self {
        self.rounds.insert(round, None);
        self
    }

    /// Request an operator abort while capturing `round`
    pub fn abort_at_round(mut self, round: u32, handle: AbortHandle) -> Self {
        self.abort_at = Some((round, handle));
        self
    }

    /// Shared capture counter, readable after the camera moved into an agent
    pub fn capture_counter(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.captures)
    }

    /// Shared log of every capture, in round order
    pub fn firing_log(&self) -> Arc<Mutex<Vec<Firing>>> {
        Arc::clone(&self.firings)
    }
}

impl Default for ScriptedCamera {
    fn default() -> Self {
        Self::steady(NOMINAL_ELAPSED)
    }
}

impl Camera for ScriptedCamera {
    fn configure(&mut self, settings: &CaptureSettings) -> SyncResult<()> {
        settings.validate()
    }

    fn capture(&mut self, round: u32, deadline: Timestamp) -> SyncResult<Duration> {
        let fired_at = SystemClock.now();
        self.firings.lock().push(Firing {
            round,
            deadline,
            fired_at,
        });
        self.captures.fetch_add(1, Ordering::SeqCst);
        if let Some((at, handle)) = &self.abort_at {
            if *at == round {
                handle.abort();
            }
        }
        match self.rounds.get(&round) {
            Some(Some(elapsed)) => Ok(*elapsed),
            Some(None) => Err(SyncError::CaptureFailure(format!("scripted failure in round {}", round))),
            None => Ok(self.nominal),
        }
    }
}

// ============================================================================
// PROBE
// ============================================================================

/// Probe reporting idle usage until a chosen sample, then memory pressure
#[derive(Clone, Debug, Default)]
pub struct ScriptedProbe {
    /// 1-based sample from which memory reads as exhausted
    exhausted_from: Option<u32>,
    samples: u32,
}

impl ScriptedProbe {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn exhausted_from(sample: u32) -> Self {
        Self {
            exhausted_from: Some(sample),
            samples: 0,
        }
    }
}

impl ResourceProbe for ScriptedProbe {
    fn sample(&mut self) -> ResourceUsage {
        self.samples += 1;
        let exhausted = self.exhausted_from.map_or(false, |from| self.samples >= from);
        ResourceUsage {
            memory_percent: if exhausted { 97.5 } else { 10.0 },
            storage_percent: 10.0,
        }
    }
}

// ============================================================================
// ARTIFACTS
// ============================================================================

#[derive(Default)]
struct StoreState {
    staged: BTreeMap<AgentId, String>,
    pulled: BTreeMap<AgentId, String>,
    released: Vec<AgentId>,
    unreachable: BTreeSet<AgentId>,
}

/// In-memory stand-in for the agents' result files and the copy command.
///
/// Agents stage through [`StorePackager`]; the coordinator pulls from the
/// store itself.
#[derive(Clone, Default)]
pub struct ArtifactStore {
    state: Arc<Mutex<StoreState>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packager(&self) -> StorePackager {
        StorePackager {
            store: self.clone(),
        }
    }

    /// Make every pull for `agent` fail
    pub fn make_unreachable(&self, agent: AgentId) {
        self.state.lock().unreachable.insert(agent);
    }

    pub fn pulled(&self, agent: AgentId) -> Option<String> {
        self.state.lock().pulled.get(&agent).cloned()
    }

    pub fn pulled_agents(&self) -> Vec<AgentId> {
        self.state.lock().pulled.keys().copied().collect()
    }

    /// Agents that released their staged results, in release order
    pub fn released(&self) -> Vec<AgentId> {
        self.state.lock().released.clone()
    }
}

impl ArtifactPuller for ArtifactStore {
    fn pull(&self, agent: AgentId) -> BoxFuture<'_, SyncResult<Vec<u8>>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.unreachable.contains(&agent) {
                return Err(SyncError::Pull {
                    agent,
                    detail: "host unreachable".into(),
                });
            }
            let csv = state.staged.get(&agent).cloned().ok_or_else(|| SyncError::Pull {
                agent,
                detail: "nothing staged".into(),
            })?;
            state.pulled.insert(agent, csv.clone());
            Ok(csv.into_bytes())
        })
    }
}

/// Agent-side handle staging results into an [`ArtifactStore`]
pub struct StorePackager {
    store: ArtifactStore,
}

impl ResultPackager for StorePackager {
    fn package(&mut self, agent: AgentId, csv: &str) -> SyncResult<()> {
        self.store.state.lock().staged.insert(agent, csv.to_string());
        Ok(())
    }

    fn release(&mut self, agent: AgentId) {
        let mut state = self.store.state.lock();
        if state.staged.remove(&agent).is_some() {
            state.released.push(agent);
        }
    }
}

// ============================================================================
// LAUNCH
// ============================================================================

/// Launcher that only records what it was asked to start
#[derive(Default)]
pub struct RecordingLauncher {
    launches: Mutex<Vec<(String, AgentId)>>,
}

impl RecordingLauncher {
    pub fn launches(&self) -> Vec<(String, AgentId)> {
        self.launches.lock().clone()
    }
}

impl Launcher for RecordingLauncher {
    fn launch(&self, address: &str, agent: AgentId) -> SyncResult<()> {
        self.launches.lock().push((address.to_string(), agent));
        Ok(())
    }
}
