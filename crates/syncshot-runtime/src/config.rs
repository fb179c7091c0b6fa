//! Coordinator and agent configuration
//!
//! Both configurations are fixed when the process starts; nothing here is
//! renegotiated during a session.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use syncshot_core::{AgentId, CaptureSettings, SyncError, SyncResult};
use syncshot_time::DEFAULT_SPIN_WINDOW;
use syncshot_transport::DEFAULT_PORT;

/// Lead time between broadcasting TAKE_PHOTO and the capture instant
pub const DEFAULT_SCHEDULE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on one agent's PHOTO_TAKEN / RECORDING_STOPPED reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on READY; agents write their result files first
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Window for the whole fleet to connect after launch
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(120);

/// How long an agent waits for the next command before presuming the
/// coordinator dead
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// Memory or storage usage above which an agent reports RAM_LOW
pub const DEFAULT_RESOURCE_THRESHOLD_PERCENT: f32 = 90.0;

/// Coordinator configuration
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Address the agents connect to
    pub bind_addr: SocketAddr,
    /// Fleet size N
    pub agent_count: usize,
    pub settings: CaptureSettings,
    /// Lead time added to "now" for each round's deadline
    pub schedule_delay: Duration,
    pub reply_timeout: Duration,
    pub ready_timeout: Duration,
    pub accept_timeout: Duration,
    /// Stop after this many rounds; `None` runs until abort
    pub max_rounds: Option<u32>,
    /// Hosts passed to the launcher, one per agent. Empty when agents are
    /// started out of band.
    pub agent_addresses: Vec<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            agent_count: 12,
            settings: CaptureSettings::default(),
            schedule_delay: DEFAULT_SCHEDULE_DELAY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            max_rounds: None,
            agent_addresses: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    /// One synchronized capture, then shut down
    pub fn single_shot() -> Self {
        Self {
            max_rounds: Some(1),
            ..Default::default()
        }
    }

    /// Short timeouts for loopback fleets
    pub fn local_test(agent_count: usize) -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            agent_count,
            schedule_delay: Duration::from_millis(20),
            reply_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        self.settings.validate()?;

        if self.agent_count == 0 {
            return Err(SyncError::InvalidConfig("agent count must be at least 1".into()));
        }
        if self.schedule_delay.is_zero() {
            return Err(SyncError::InvalidConfig(
                "schedule delay must be positive, agents need time to arm".into(),
            ));
        }
        for (name, timeout) in [
            ("reply", self.reply_timeout),
            ("ready", self.ready_timeout),
            ("accept", self.accept_timeout),
        ] {
            if timeout.is_zero() {
                return Err(SyncError::InvalidConfig(format!("{} timeout must be positive", name)));
            }
        }
        if self.max_rounds == Some(0) {
            return Err(SyncError::InvalidConfig("max rounds must be at least 1".into()));
        }
        if !self.agent_addresses.is_empty() && self.agent_addresses.len() != self.agent_count {
            return Err(SyncError::InvalidConfig(format!(
                "{} agent addresses given for {} agents",
                self.agent_addresses.len(),
                self.agent_count
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} agents on {}, {}x{} @ {}us, delay {}, rounds {}",
            self.agent_count,
            self.bind_addr,
            self.settings.width,
            self.settings.height,
            self.settings.exposure_micros,
            humantime::format_duration(self.schedule_delay),
            self.max_rounds
                .map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
        )
    }
}

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub coordinator_addr: SocketAddr,
    /// Own identity, used in the anomaly report and result file name
    pub agent_id: AgentId,
    /// Source address for the coordinator connection; the coordinator
    /// derives the agent id from it
    pub bind_ip: Option<IpAddr>,
    pub spin_window: Duration,
    /// `None` waits for commands indefinitely
    pub command_timeout: Option<Duration>,
    pub memory_threshold_percent: f32,
    pub storage_threshold_percent: f32,
    /// Where captured images and the result file are written
    pub capture_dir: PathBuf,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
}

impl AgentConfig {
    pub fn new(coordinator_addr: SocketAddr, agent_id: AgentId) -> Self {
        Self {
            coordinator_addr,
            agent_id,
            bind_ip: None,
            spin_window: DEFAULT_SPIN_WINDOW,
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            memory_threshold_percent: DEFAULT_RESOURCE_THRESHOLD_PERCENT,
            storage_threshold_percent: DEFAULT_RESOURCE_THRESHOLD_PERCENT,
            capture_dir: PathBuf::from("."),
            connect_attempts: 30,
            connect_backoff: Duration::from_secs(1),
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        for (name, value) in [
            ("memory", self.memory_threshold_percent),
            ("storage", self.storage_threshold_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(SyncError::InvalidConfig(format!(
                    "{} threshold {} is not a percentage in (0, 100]",
                    name, value
                )));
            }
        }
        if self.command_timeout.map_or(false, |t| t.is_zero()) {
            return Err(SyncError::InvalidConfig("command timeout must be positive".into()));
        }
        if self.connect_attempts == 0 {
            return Err(SyncError::InvalidConfig("connect attempts must be at least 1".into()));
        }
        Ok(())
    }
}
