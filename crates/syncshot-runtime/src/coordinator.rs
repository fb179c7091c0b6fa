//! Coordinator session
//!
//! Drives one session end to end:
//! 1. Launch agents
//! 2. Accept and identify exactly N connections
//! 3. Broadcast SETTINGS
//! 4. Round loop: TAKE_PHOTO at a shared deadline, one reply per agent
//! 5. Termination barrier (STOP_RECORD / RECORDING_STOPPED)
//! 6. Readiness barrier (READY)
//! 7. Anomaly collection
//! 8. Artifact pull, each followed by EXTRACTION_COMPLETE
//! 9. Close every connection
//!
//! Failures in stages 3 and 4 end the round loop but never skip stage 5;
//! failures in stages 5 to 7 skip the stages after them. Stage 9 always runs.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use syncshot_core::{AgentId, AgentOutcome, RoundRecord, SyncError, SyncResult};
use syncshot_time::Clock;
use syncshot_transport::AgentListener;
use syncshot_wire::{Keyword, Message};

use crate::barrier::{self, BarrierResults, STALE_ROUND_REPLIES};
use crate::config::CoordinatorConfig;
use crate::external::{ArtifactPuller, Launcher};
use crate::link::AgentLink;
use crate::report::{SessionReport, ShutdownStage};

/// Requests an orderly stop before the next round
#[derive(Clone, Debug)]
pub struct AbortHandle(Arc<watch::Sender<bool>>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.send_replace(true);
    }
}

/// Coordinator bound to its listening address, ready to run a session
pub struct Coordinator {
    config: CoordinatorConfig,
    listener: AgentListener,
    clock: Arc<dyn Clock>,
    launcher: Arc<dyn Launcher>,
    puller: Arc<dyn ArtifactPuller>,
    abort_tx: Arc<watch::Sender<bool>>,
    abort_rx: watch::Receiver<bool>,
}

impl Coordinator {
    /// Validate the configuration and start listening
    pub async fn bind(
        config: CoordinatorConfig,
        clock: Arc<dyn Clock>,
        launcher: Arc<dyn Launcher>,
        puller: Arc<dyn ArtifactPuller>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let listener = AgentListener::bind(config.bind_addr).await?;
        let (abort_tx, abort_rx) = watch::channel(false);

        Ok(Self {
            config,
            listener,
            clock,
            launcher,
            puller,
            abort_tx: Arc::new(abort_tx),
            abort_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(Arc::clone(&self.abort_tx))
    }

    /// Run one session.
    ///
    /// Returns `Err` only when the fleet never assembled, including an
    /// operator abort during assembly; every later failure is recorded in
    /// the report.
    pub async fn run(self) -> SyncResult<SessionReport> {
        let mut abort = self.abort_rx.clone();
        if *abort.borrow_and_update() {
            tracing::info!("operator abort before launch");
            return Err(SyncError::OperatorAbort);
        }

        tracing::info!(config = %self.config, "session starting");
        self.launch_agents();

        let accepted = tokio::select! {
            accepted = self
                .listener
                .accept_agents(self.config.agent_count, self.config.accept_timeout) => accepted?,
            _ = abort_requested(&mut abort) => {
                tracing::warn!("operator abort while assembling the fleet");
                return Err(SyncError::OperatorAbort);
            }
        };

        let links: Vec<AgentLink> = accepted
            .into_iter()
            .map(|(agent, connection)| AgentLink::spawn(agent, connection))
            .collect();

        let mut session = Session {
            config: &self.config,
            clock: self.clock.as_ref(),
            puller: self.puller.as_ref(),
            abort: self.abort_rx.clone(),
            report: SessionReport::new(self.config.settings),
            links,
        };
        session.report.agents = session.links.iter().map(|l| l.agent()).collect();

        session.drive().await;
        session.close().await;

        session.report.compute_skew();
        tracing::info!(
            rounds = session.report.history.len(),
            aborted = session.report.is_aborted(),
            shutdown = ?session.report.shutdown,
            "session finished"
        );
        Ok(session.report)
    }

    fn launch_agents(&self) {
        for (index, address) in self.config.agent_addresses.iter().enumerate() {
            let Some(agent) = AgentId::new(index as u32 + 1) else {
                continue;
            };
            match self.launcher.launch(address, agent) {
                Ok(()) => tracing::info!(%agent, %address, "agent launched"),
                Err(e) => tracing::warn!(%agent, %address, "launch failed: {}", e),
            }
        }
    }
}

/// Resolves once the abort flag is set. Never resolves if every handle is
/// gone, since nobody can set it any more.
async fn abort_requested(abort: &mut watch::Receiver<bool>) {
    if abort.wait_for(|aborted| *aborted).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// State of one session after the fleet assembled
struct Session<'a> {
    config: &'a CoordinatorConfig,
    clock: &'a dyn Clock,
    puller: &'a dyn ArtifactPuller,
    abort: watch::Receiver<bool>,
    report: SessionReport,
    links: Vec<AgentLink>,
}

impl Session<'_> {
    async fn drive(&mut self) {
        // Agents still in Idle have nothing to stop
        let aborted = *self.abort.borrow();
        if aborted {
            tracing::info!("operator abort before settings");
            self.report.set_abort(SyncError::OperatorAbort);
            return;
        }

        if self.negotiate().await {
            self.round_loop().await;
        }

        if !self.terminate().await {
            self.report.shutdown = ShutdownStage::TerminationFailed;
            return;
        }
        if !self.await_ready().await {
            self.report.shutdown = ShutdownStage::ReadinessFailed;
            return;
        }
        if !self.collect_anomalies().await {
            self.report.shutdown = ShutdownStage::AnomalyCollectionFailed;
            return;
        }
        self.pull_artifacts().await;
        self.report.shutdown = ShutdownStage::Collected;
    }

    /// Record the first failed barrier result as the abort reason
    fn check<T>(&mut self, stage: &str, results: &BarrierResults<T>) -> bool {
        match barrier::first_failure(results) {
            Some(e) => {
                tracing::warn!(stage, "barrier failed: {}", e);
                self.report.set_abort(e.clone());
                false
            }
            None => true,
        }
    }

    async fn negotiate(&mut self) -> bool {
        let settings = Message::Settings(self.config.settings);
        let results = barrier::broadcast(&self.links, &settings).await;
        self.check("settings", &results)
    }

    async fn round_loop(&mut self) {
        let mut round: u32 = 0;

        loop {
            if self.config.max_rounds.map_or(false, |max| round >= max) {
                tracing::info!(rounds = round, "round limit reached");
                return;
            }
            let aborted = *self.abort.borrow();
            if aborted {
                tracing::info!(rounds = round, "operator abort");
                self.report.set_abort(SyncError::OperatorAbort);
                return;
            }

            round += 1;
            if let Err(e) = self.run_round(round).await {
                let failed = self
                    .report
                    .history
                    .last()
                    .map(RoundRecord::failed_agents)
                    .unwrap_or_default();
                tracing::warn!(round, ?failed, "round failed: {}", e);
                self.report.set_abort(e);
                return;
            }
        }
    }

    /// One trigger cycle. The record is appended whether or not the round
    /// succeeds.
    async fn run_round(&mut self, round: u32) -> SyncResult<()> {
        let deadline = self.clock.now() + self.config.schedule_delay;
        let mut record = RoundRecord::new(round, deadline);
        let mut failure: Option<SyncError> = None;

        let sent = barrier::broadcast(&self.links, &Message::TakePhoto { deadline }).await;
        let mut waiting = Vec::with_capacity(self.links.len());
        for ((agent, result), link) in sent.into_iter().zip(&self.links) {
            match result {
                Ok(()) => waiting.push(link.clone()),
                Err(e) => {
                    record.outcomes.insert(agent, AgentOutcome::Failed);
                    failure.get_or_insert(e);
                }
            }
        }

        for (agent, reply) in barrier::gather(&waiting, self.config.reply_timeout).await {
            let outcome = match reply {
                Ok(Message::PhotoTaken { elapsed }) => {
                    if let Some(elapsed) = elapsed {
                        record.elapsed.insert(agent, elapsed);
                    }
                    AgentOutcome::Ok
                }
                Ok(Message::RamLow) => {
                    failure.get_or_insert(SyncError::ResourceExhaustion(agent));
                    AgentOutcome::Degraded
                }
                Ok(Message::CaptureFailed) => {
                    failure.get_or_insert(SyncError::CaptureFailure(format!(
                        "agent {} round {}",
                        agent, round
                    )));
                    AgentOutcome::Failed
                }
                Ok(other) => {
                    failure.get_or_insert(SyncError::ProtocolViolation {
                        agent,
                        expected: Keyword::PhotoTaken.as_str(),
                        received: other.to_string(),
                    });
                    AgentOutcome::Failed
                }
                Err(e) => {
                    failure.get_or_insert(e);
                    AgentOutcome::Failed
                }
            };
            record.outcomes.insert(agent, outcome);
        }

        self.report.history.push(record);

        if let Some(e) = failure {
            return Err(e);
        }
        tracing::info!(round, %deadline, "round complete");
        Ok(())
    }

    async fn terminate(&mut self) -> bool {
        let sent = barrier::broadcast(&self.links, &Message::StopRecord).await;
        if !self.check("stop", &sent) {
            return false;
        }

        let results = barrier::expect_all(
            &self.links,
            &[Keyword::RecordingStopped],
            STALE_ROUND_REPLIES,
            self.config.reply_timeout,
        )
        .await;
        let ok = self.check("termination", &results);
        if ok {
            tracing::info!("all agents stopped recording");
        }
        ok
    }

    async fn await_ready(&mut self) -> bool {
        let results =
            barrier::expect_all(&self.links, &[Keyword::Ready], &[], self.config.ready_timeout)
                .await;
        self.check("readiness", &results)
    }

    async fn collect_anomalies(&mut self) -> bool {
        let results = barrier::expect_all(
            &self.links,
            &[Keyword::Anomalies, Keyword::NoAnomalies],
            &[],
            self.config.reply_timeout,
        )
        .await;
        if !self.check("anomalies", &results) {
            return false;
        }

        for (link_agent, result) in results {
            if let Ok(Message::Anomalies { agent, rounds }) = result {
                if agent != link_agent {
                    tracing::warn!(%link_agent, reported = %agent, "anomaly report names another agent");
                }
                if rounds.is_empty() {
                    tracing::info!(agent = %link_agent, "no anomalies");
                } else {
                    tracing::warn!(agent = %link_agent, ?rounds, "anomalous rounds");
                }
                self.report.anomalies.insert(link_agent, rounds);
            }
        }
        true
    }

    async fn pull_artifacts(&mut self) {
        for link in &self.links {
            let agent = link.agent();
            match self.puller.pull(agent).await {
                Ok(blob) => {
                    tracing::info!(%agent, bytes = blob.len(), "artifacts pulled");
                    self.report.artifacts.insert(agent, blob.len());
                }
                Err(e) => {
                    tracing::warn!(%agent, "pull failed: {}", e);
                    self.report.pull_failures.insert(agent, e.to_string());
                }
            }

            // Sent regardless of the pull outcome so the agent tears down
            if let Err(e) = link.send(Message::ExtractionComplete).await {
                tracing::warn!(%agent, "could not release agent: {}", e);
            }
        }
    }

    async fn close(&self) {
        for link in &self.links {
            link.close().await;
        }
    }
}
