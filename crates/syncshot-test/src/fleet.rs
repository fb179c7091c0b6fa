//! Whole-fleet sessions over loopback TCP
//!
//! The harness runs a real [`Coordinator`] and N agents in one runtime.
//! Agent k connects from 127.0.0.k, so the coordinator derives ids exactly
//! as it does on the camera network.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use syncshot_core::{AgentId, SyncError, SyncResult};
use syncshot_runtime::{Agent, AgentConfig, AgentSummary, Coordinator, CoordinatorConfig, SessionReport};
use syncshot_time::{Clock, OffsetClock, SystemClock};
use syncshot_transport::connect_with_retry;

use crate::doubles::{ArtifactStore, RecordingLauncher, ScriptedCamera, ScriptedProbe};
use crate::rogue::{RogueAgent, RogueBehavior};

/// Rounds a harness session runs unless told otherwise
pub const DEFAULT_HARNESS_ROUNDS: u32 = 5;

/// Upper bound on how long an agent may outlive the coordinator
const AGENT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(20);

/// One seat in the fleet
pub enum Participant {
    /// The real trigger loop with scripted collaborators
    Agent {
        camera: ScriptedCamera,
        probe: ScriptedProbe,
    },
    Rogue(RogueBehavior),
}

impl Default for Participant {
    fn default() -> Self {
        Participant::Agent {
            camera: ScriptedCamera::default(),
            probe: ScriptedProbe::idle(),
        }
    }
}

/// Everything a harness session produced
pub struct FleetOutcome {
    pub report: SessionReport,
    /// Results of the real agents; rogue agents are not listed
    pub agents: BTreeMap<AgentId, SyncResult<AgentSummary>>,
    pub store: ArtifactStore,
    pub launches: Vec<(String, AgentId)>,
}

impl FleetOutcome {
    pub fn summary(&self, agent: u32) -> Option<&AgentSummary> {
        let agent = AgentId::new(agent)?;
        self.agents.get(&agent)?.as_ref().ok()
    }
}

/// Builder for one in-process session
pub struct FleetHarness {
    config: CoordinatorConfig,
    participants: BTreeMap<u32, Participant>,
    connect_order: Vec<u32>,
    connect_stagger: Duration,
    abort_at: Option<(u32, u32)>,
    clock_offsets: BTreeMap<u32, i64>,
    store: ArtifactStore,
}

impl FleetHarness {
    /// `agent_count` well-behaved agents, [`DEFAULT_HARNESS_ROUNDS`] rounds
    pub fn new(agent_count: u32) -> Self {
        let mut config = CoordinatorConfig::local_test(agent_count as usize);
        config.max_rounds = Some(DEFAULT_HARNESS_ROUNDS);

        Self {
            config,
            participants: (1..=agent_count).map(|k| (k, Participant::default())).collect(),
            connect_order: (1..=agent_count).collect(),
            connect_stagger: Duration::ZERO,
            abort_at: None,
            clock_offsets: BTreeMap::new(),
            store: ArtifactStore::new(),
        }
    }

    pub fn rounds(mut self, max_rounds: Option<u32>) -> Self {
        self.config.max_rounds = max_rounds;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut CoordinatorConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn camera(mut self, agent: u32, camera: ScriptedCamera) -> Self {
        let probe = match self.participants.remove(&agent) {
            Some(Participant::Agent { probe, .. }) => probe,
            _ => ScriptedProbe::idle(),
        };
        self.participants.insert(agent, Participant::Agent { camera, probe });
        self
    }

    pub fn probe(mut self, agent: u32, probe: ScriptedProbe) -> Self {
        let camera = match self.participants.remove(&agent) {
            Some(Participant::Agent { camera, .. }) => camera,
            _ => ScriptedCamera::default(),
        };
        self.participants.insert(agent, Participant::Agent { camera, probe });
        self
    }

    pub fn rogue(mut self, agent: u32, behavior: RogueBehavior) -> Self {
        self.participants.insert(agent, Participant::Rogue(behavior));
        self
    }

    /// Connect agents one at a time in this order
    pub fn connect_order(mut self, order: &[u32]) -> Self {
        self.connect_order = order.to_vec();
        self.connect_stagger = Duration::from_millis(30);
        self
    }

    /// Have the operator abort while `agent` captures `round`
    pub fn abort_at(mut self, agent: u32, round: u32) -> Self {
        self.abort_at = Some((agent, round));
        self
    }

    /// Run `agent` on a clock `offset_nanos` away from the coordinator's
    pub fn clock_offset(mut self, agent: u32, offset_nanos: i64) -> Self {
        self.clock_offsets.insert(agent, offset_nanos);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run the session to completion
    pub async fn run(mut self) -> SyncResult<FleetOutcome> {
        let launcher = Arc::new(RecordingLauncher::default());
        let coordinator = Coordinator::bind(
            self.config.clone(),
            Arc::new(SystemClock),
            launcher.clone(),
            Arc::new(self.store.clone()),
        )
        .await?;
        let addr = coordinator.local_addr();
        let abort = coordinator.abort_handle();
        let session = tokio::spawn(coordinator.run());

        let mut agents: Vec<(AgentId, JoinHandle<SyncResult<AgentSummary>>)> = Vec::new();
        let mut rogues: Vec<JoinHandle<SyncResult<()>>> = Vec::new();

        for k in self.connect_order.clone() {
            let Some(participant) = self.participants.remove(&k) else {
                continue;
            };
            let agent = AgentId::new(k)
                .ok_or_else(|| SyncError::InvalidConfig(format!("agent id {} out of range", k)))?;
            let source = loopback_source(agent)?;

            match participant {
                Participant::Agent { mut camera, probe } => {
                    if let Some((abort_agent, round)) = self.abort_at {
                        if abort_agent == k {
                            camera = camera.abort_at_round(round, abort.clone());
                        }
                    }
                    let mut config = AgentConfig::new(addr, agent);
                    config.bind_ip = Some(source);
                    config.command_timeout = Some(AGENT_JOIN_TIMEOUT);
                    let packager = self.store.packager();
                    let clock: Arc<dyn Clock> = match self.clock_offsets.get(&k) {
                        Some(offset) => Arc::new(OffsetClock::new(SystemClock, *offset)),
                        None => Arc::new(SystemClock),
                    };

                    agents.push((
                        agent,
                        tokio::spawn(async move {
                            let connection =
                                connect_with_retry(addr, Some(source), CONNECT_ATTEMPTS, CONNECT_BACKOFF)
                                    .await?;
                            Agent::new(config, connection, Box::new(camera), clock)
                                .with_probe(Box::new(probe))
                                .with_packager(Box::new(packager))
                                .run()
                                .await
                        }),
                    ));
                }
                Participant::Rogue(behavior) => {
                    rogues.push(tokio::spawn(RogueAgent::new(agent, behavior).run(addr, source)));
                }
            }

            if !self.connect_stagger.is_zero() {
                tokio::time::sleep(self.connect_stagger).await;
            }
        }

        let report = match session.await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                abort_all(&agents, &rogues);
                return Err(e);
            }
            Err(e) => {
                abort_all(&agents, &rogues);
                return Err(SyncError::Transport(format!("coordinator task: {}", e)));
            }
        };

        let mut results = BTreeMap::new();
        for (agent, mut handle) in agents {
            let result = match tokio::time::timeout(AGENT_JOIN_TIMEOUT, &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(SyncError::Transport(format!("agent {} task: {}", agent, e))),
                Err(_) => {
                    handle.abort();
                    Err(SyncError::ReplyTimeout {
                        agent,
                        waited: AGENT_JOIN_TIMEOUT,
                    })
                }
            };
            results.insert(agent, result);
        }
        for mut handle in rogues {
            if tokio::time::timeout(AGENT_JOIN_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        Ok(FleetOutcome {
            report,
            agents: results,
            store: self.store,
            launches: launcher.launches(),
        })
    }
}

/// 127.0.0.k for agent k
fn loopback_source(agent: AgentId) -> SyncResult<IpAddr> {
    let octet = u8::try_from(agent.get())
        .map_err(|_| SyncError::InvalidConfig(format!("agent {} has no loopback address", agent)))?;
    Ok(IpAddr::V4(Ipv4Addr::new(127, 0, 0, octet)))
}

fn abort_all<A, B>(agents: &[(AgentId, JoinHandle<A>)], rogues: &[JoinHandle<B>]) {
    for (_, handle) in agents {
        handle.abort();
    }
    for handle in rogues {
        handle.abort();
    }
}
