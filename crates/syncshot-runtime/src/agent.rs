//! Agent trigger loop
//!
//! One agent serves one coordinator connection:
//!
//! ```text
//! Idle --SETTINGS--> Configured --TAKE_PHOTO--> Armed -> Capturing -> Acked
//!                         |                                            |
//!                         +----------------STOP_RECORD-----------------+
//!                                              |
//!                                          Stopping --EXTRACTION_COMPLETE--> Stopped
//! ```
//!
//! Any message the current state does not expect ends the session: the
//! agent closes the connection and the coordinator sees a lost agent.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use syncshot_core::{AgentId, CaptureSettings, SyncError, SyncResult, Timestamp};
use syncshot_time::{spin_until, AnomalyReport, Clock, SampleVerdict, TimingAnalyzer};
use syncshot_transport::{connect_with_retry, Connection};
use syncshot_wire::Message;

use crate::config::AgentConfig;
use crate::device::Camera;
use crate::external::{DirectoryPackager, ResultPackager};
use crate::probe::{ResourceProbe, SysinfoProbe};

/// Deadline overshoot worth a warning; the spin-wait normally lands within
/// microseconds
const LATE_WAKE_WARNING: Duration = Duration::from_millis(1);

/// Trigger loop state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Configured,
    Armed,
    Capturing,
    Acked,
    Stopping,
    Stopped,
}

impl AgentState {
    pub fn name(self) -> &'static str {
        match self {
            AgentState::Idle => "Idle",
            AgentState::Configured => "Configured",
            AgentState::Armed => "Armed",
            AgentState::Capturing => "Capturing",
            AgentState::Acked => "Acked",
            AgentState::Stopping => "Stopping",
            AgentState::Stopped => "Stopped",
        }
    }

    /// States in which TAKE_PHOTO and STOP_RECORD are accepted
    fn accepts_rounds(self) -> bool {
        matches!(self, AgentState::Configured | AgentState::Acked)
    }
}

/// What an agent did during its session
#[derive(Clone, Debug, PartialEq)]
pub struct AgentSummary {
    pub agent: AgentId,
    /// TAKE_PHOTO commands received
    pub rounds: u32,
    /// Rounds acknowledged with PHOTO_TAKEN
    pub photos_taken: u32,
    pub breaker_tripped: bool,
    pub reference: Option<Duration>,
    pub anomalies: AnomalyReport,
    /// False when the coordinator closed without EXTRACTION_COMPLETE
    pub extracted: bool,
}

/// Camera agent serving one coordinator connection
pub struct Agent<S = TcpStream> {
    config: AgentConfig,
    connection: Connection<S>,
    camera: Arc<Mutex<Box<dyn Camera>>>,
    clock: Arc<dyn Clock>,
    probe: Box<dyn ResourceProbe>,
    packager: Box<dyn ResultPackager>,
    state: AgentState,
    settings: Option<CaptureSettings>,
    analyzer: TimingAnalyzer,
    round: u32,
    photos_taken: u32,
    breaker_tripped: bool,
    extracted: bool,
}

impl<S> Agent<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create an agent probing and packaging into `config.capture_dir`
    pub fn new(
        config: AgentConfig,
        connection: Connection<S>,
        camera: Box<dyn Camera>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let probe = Box::new(SysinfoProbe::new(config.capture_dir.clone()));
        let packager = Box::new(DirectoryPackager::new(config.capture_dir.clone()));
        Self {
            config,
            connection,
            camera: Arc::new(Mutex::new(camera)),
            clock,
            probe,
            packager,
            state: AgentState::Idle,
            settings: None,
            analyzer: TimingAnalyzer::new(),
            round: 0,
            photos_taken: 0,
            breaker_tripped: false,
            extracted: false,
        }
    }

    pub fn with_probe(mut self, probe: Box<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_packager(mut self, packager: Box<dyn ResultPackager>) -> Self {
        self.packager = packager;
        self
    }

    pub fn id(&self) -> AgentId {
        self.config.agent_id
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Serve the coordinator until the session ends.
    ///
    /// Local results are released and the connection is closed on every
    /// exit path.
    pub async fn run(mut self) -> SyncResult<AgentSummary> {
        let agent = self.config.agent_id;
        tracing::info!(%agent, "agent started");

        let result = self.serve().await;

        self.packager.release(agent);
        self.connection.shutdown().await;

        match result {
            Ok(()) => {
                self.state = AgentState::Stopped;
                tracing::info!(
                    %agent,
                    rounds = self.round,
                    photos = self.photos_taken,
                    anomalies = self.analyzer.anomalies().len(),
                    "agent stopped"
                );
                Ok(self.summary())
            }
            Err(e) => {
                tracing::error!(%agent, state = self.state.name(), "agent failed: {}", e);
                Err(e)
            }
        }
    }

    fn summary(&self) -> AgentSummary {
        AgentSummary {
            agent: self.config.agent_id,
            rounds: self.round,
            photos_taken: self.photos_taken,
            breaker_tripped: self.breaker_tripped,
            reference: self.analyzer.reference(),
            anomalies: self.analyzer.report(self.config.agent_id),
            extracted: self.extracted,
        }
    }

    async fn next_command(&mut self) -> SyncResult<Message> {
        match self.config.command_timeout {
            Some(timeout) => self.connection.recv_timeout(timeout).await,
            None => self.connection.recv().await,
        }
    }

    fn unexpected(&self, message: &Message) -> SyncError {
        SyncError::UnexpectedMessage {
            state: self.state.name(),
            received: message.to_string(),
        }
    }

    async fn serve(&mut self) -> SyncResult<()> {
        loop {
            let message = self.next_command().await?;
            match message {
                Message::Settings(settings) if self.state == AgentState::Idle => {
                    self.configure(settings)?;
                }
                Message::TakePhoto { deadline } if self.state.accepts_rounds() => {
                    self.take_photo(deadline).await?;
                }
                Message::StopRecord if self.state.accepts_rounds() => {
                    return self.stop().await;
                }
                other => return Err(self.unexpected(&other)),
            }
        }
    }

    fn configure(&mut self, settings: CaptureSettings) -> SyncResult<()> {
        self.camera.lock().configure(&settings)?;
        self.settings = Some(settings);
        self.state = AgentState::Configured;
        tracing::info!(
            agent = %self.config.agent_id,
            width = settings.width,
            height = settings.height,
            exposure_us = settings.exposure_micros,
            "camera configured"
        );
        Ok(())
    }

    async fn take_photo(&mut self, deadline: Timestamp) -> SyncResult<()> {
        let agent = self.config.agent_id;
        self.round += 1;
        let round = self.round;

        if self.breaker_tripped {
            tracing::debug!(%agent, round, "breaker open, refusing capture");
            self.connection.send(&Message::RamLow).await?;
            self.state = AgentState::Acked;
            return Ok(());
        }

        let usage = self.probe.sample();
        if usage.exceeds(
            self.config.memory_threshold_percent,
            self.config.storage_threshold_percent,
        ) {
            tracing::warn!(
                %agent,
                round,
                memory = usage.memory_percent,
                storage = usage.storage_percent,
                "resource pressure, tripping breaker"
            );
            self.breaker_tripped = true;
            self.connection.send(&Message::RamLow).await?;
            self.state = AgentState::Acked;
            return Ok(());
        }

        self.state = AgentState::Armed;
        let camera = Arc::clone(&self.camera);
        let clock = Arc::clone(&self.clock);
        let spin_window = self.config.spin_window;

        self.state = AgentState::Capturing;
        let (wake, result) = tokio::task::spawn_blocking(move || {
            let wake = spin_until(clock.as_ref(), deadline, spin_window);
            let result = camera.lock().capture(round, deadline);
            (wake, result)
        })
        .await
        .map_err(|e| SyncError::CaptureFailure(format!("capture thread: {}", e)))?;

        let lateness = wake.lateness();
        if lateness > LATE_WAKE_WARNING {
            tracing::warn!(%agent, round, ?lateness, "woke late for deadline");
        }

        let reply = match result {
            Ok(elapsed) => {
                let verdict = self.analyzer.record(round, elapsed);
                match verdict {
                    SampleVerdict::Measured(m) if m.anomalous => tracing::warn!(
                        %agent,
                        round,
                        ?elapsed,
                        relative_error = m.relative_error,
                        "capture time anomaly"
                    ),
                    SampleVerdict::Reference(reference) => {
                        tracing::info!(%agent, ?reference, "reference capture time set")
                    }
                    _ => tracing::debug!(%agent, round, ?elapsed, ?verdict, "captured"),
                }
                self.photos_taken += 1;
                Message::PhotoTaken {
                    elapsed: Some(elapsed),
                }
            }
            Err(e) => {
                tracing::warn!(%agent, round, "capture failed: {}", e);
                self.analyzer.record_failure(round);
                Message::CaptureFailed
            }
        };

        self.connection.send(&reply).await?;
        self.state = AgentState::Acked;
        Ok(())
    }

    async fn stop(&mut self) -> SyncResult<()> {
        let agent = self.config.agent_id;
        self.state = AgentState::Stopping;
        self.connection.send(&Message::RecordingStopped).await?;
        tracing::info!(%agent, rounds = self.round, "recording stopped");

        self.packager.package(agent, &self.analyzer.to_csv())?;
        self.connection.send(&Message::Ready).await?;

        let report = self.analyzer.report(agent);
        self.connection
            .send(&Message::Anomalies {
                agent,
                rounds: report.rounds,
            })
            .await?;

        match self.next_command().await {
            Ok(Message::ExtractionComplete) => {
                self.extracted = true;
                Ok(())
            }
            Ok(other) => Err(self.unexpected(&other)),
            // The coordinator skips extraction when a shutdown barrier
            // failed; it just closes the connection, possibly with our
            // unread reports still queued, which resets it.
            Err(SyncError::ConnectionClosed | SyncError::Transport(_)) => {
                tracing::warn!(%agent, "coordinator closed without extracting results");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Connect to the coordinator and serve it with the system probe and
/// directory packager
pub async fn run_agent(
    config: AgentConfig,
    camera: Box<dyn Camera>,
    clock: Arc<dyn Clock>,
) -> SyncResult<AgentSummary> {
    config.validate()?;
    let connection = connect_with_retry(
        config.coordinator_addr,
        config.bind_ip,
        config.connect_attempts,
        config.connect_backoff,
    )
    .await?;
    Agent::new(config, connection, camera, clock).run().await
}
