//! Per-call orchestration.
//!
//! The engine reacts to switch control-plane events: on channel creation it
//! leases a port, binds the media receiver, opens the model session, and
//! wires the audio pump between them; on stream readiness it starts the
//! paced sender toward the switch's media endpoint; on channel destruction
//! it tears everything down in order and returns the port. A background
//! sweep audits the port pool against the registry so a missed teardown
//! can never leak a port forever.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use voicebridge_ai_session::{ModelSession, SessionEvent};
use voicebridge_call_registry::{CallKey, CallPhase, CallRegistry};
use voicebridge_rtp_relay::{
    AudioPreFilter, EnergyGateConfig, EnergyGateFilter, MediaReceiver, MediaReceiverHandle,
    MediaSender, MediaSenderHandle, NoopFilter, PoolStats, PortPool,
};

use crate::config::EngineConfig;
use crate::diagnostics::{CallStatus, OrphanReport, OrphanedLease};
use crate::error::{Error, Result};
use crate::switch::{SwitchCommand, SwitchEvent};

/// Consumer of transcript text produced during a call.
///
/// The engine never stores transcripts; it hands each fragment to the sink
/// and forgets it.
#[async_trait]
pub trait TranscriptSink: Send + Sync {
    /// Incremental transcript of model speech.
    async fn model_transcript(&self, call_key: &str, delta: &str);
    /// Completed transcription of one caller utterance.
    async fn caller_transcript(&self, call_key: &str, text: &str);
}

/// Default sink: transcripts go to the log and nowhere else.
pub struct LogTranscriptSink;

#[async_trait]
impl TranscriptSink for LogTranscriptSink {
    async fn model_transcript(&self, call_key: &str, delta: &str) {
        debug!(call_key, delta, "model transcript");
    }

    async fn caller_transcript(&self, call_key: &str, text: &str) {
        info!(call_key, text, "caller transcript");
    }
}

/// Live per-call units. The registry record is the authoritative state;
/// this holds only the running tasks and their handles.
struct CallRuntime {
    receiver: MediaReceiverHandle,
    /// Started on `StreamReady`; absent until the switch has negotiated
    /// its media endpoint.
    sender: Option<MediaSenderHandle>,
    /// Parked end of the model-audio channel, consumed when the sender
    /// starts.
    segments_rx: Option<mpsc::Receiver<Bytes>>,
    session: Arc<ModelSession>,
    pump: JoinHandle<()>,
}

/// One engine bridges every concurrent call in the deployment.
pub struct BridgeEngine {
    config: EngineConfig,
    registry: Arc<CallRegistry>,
    pool: Arc<PortPool>,
    calls: DashMap<CallKey, CallRuntime>,
    command_tx: mpsc::Sender<SwitchCommand>,
    transcripts: Arc<dyn TranscriptSink>,
    audit_task: Mutex<Option<JoinHandle<()>>>,
    audit_shutdown: watch::Sender<bool>,
}

impl BridgeEngine {
    /// Build the engine and return the command stream the control layer
    /// must consume and execute against the switch.
    ///
    /// Fails with [`Error::Config`] when the RTP port range is empty or
    /// would run past the top of the port space.
    pub fn new(config: EngineConfig) -> Result<(Self, mpsc::Receiver<SwitchCommand>)> {
        Self::with_transcript_sink(config, Arc::new(LogTranscriptSink))
    }

    pub fn with_transcript_sink(
        config: EngineConfig,
        transcripts: Arc<dyn TranscriptSink>,
    ) -> Result<(Self, mpsc::Receiver<SwitchCommand>)> {
        let pool = PortPool::new(config.first_rtp_port, config.rtp_port_count)
            .map_err(|e| Error::Config(e.to_string()))?;
        let pool = Arc::new(pool);
        let registry = Arc::new(CallRegistry::new());
        let (command_tx, command_rx) = mpsc::channel(64);
        let (audit_shutdown, audit_shutdown_rx) = watch::channel(false);

        let audit_task = tokio::spawn(run_audit_sweep(
            pool.clone(),
            registry.clone(),
            config.audit_interval(),
            config.min_orphan_age(),
            config.audit_auto_release,
            audit_shutdown_rx,
        ));

        info!(
            first_port = config.first_rtp_port,
            ports = config.rtp_port_count,
            "bridge engine started"
        );

        Ok((
            Self {
                config,
                registry,
                pool,
                calls: DashMap::new(),
                command_tx,
                transcripts,
                audit_task: Mutex::new(Some(audit_task)),
                audit_shutdown,
            },
            command_rx,
        ))
    }

    /// Dispatch one switch control-plane event.
    pub async fn handle_switch_event(&self, event: SwitchEvent) -> Result<()> {
        match event {
            SwitchEvent::ChannelCreated {
                call_key,
                carrier_call_id,
            } => self.on_channel_created(call_key, carrier_call_id).await,
            SwitchEvent::StreamReady {
                call_key,
                media_addr,
            } => self.on_stream_ready(call_key, media_addr).await,
            SwitchEvent::ChannelDestroyed { call_key } => {
                self.teardown_call(&CallKey::from(call_key)).await
            }
        }
    }

    async fn on_channel_created(
        &self,
        call_key: String,
        carrier_call_id: Option<String>,
    ) -> Result<()> {
        let key = CallKey::from(call_key.as_str());
        self.registry.create(key.clone(), carrier_call_id.clone())?;

        // A full pool rejects the call outright rather than queueing it.
        let port = match self.pool.acquire(&call_key) {
            Ok(port) => port,
            Err(e) => {
                error!(call_key, error = %e, "call rejected: no RTP port available");
                let _ = self.registry.mark_failed(&key);
                self.send_command(SwitchCommand::Hangup {
                    call_key: call_key.clone(),
                })
                .await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.registry.set_port(&key, port) {
            self.fail_setup(&key, port).await;
            return Err(e.into());
        }

        match self.start_call_units(&key, port).await {
            Ok(()) => {
                if let Some(carrier) = carrier_call_id {
                    let _ = self.registry.update_handles(&key, |handles| {
                        handles.primary_channel = Some(carrier);
                    });
                }
                self.send_command(SwitchCommand::Answer {
                    call_key: call_key.clone(),
                })
                .await;
                let local_addr = (self.config.bind_ip, port).into();
                self.send_command(SwitchCommand::StartExternalMedia {
                    call_key,
                    local_addr,
                    payload_type: self.config.sender_config().payload_type,
                })
                .await;
                Ok(())
            }
            Err(e) => {
                error!(call_key = %key, error = %e, "call setup failed");
                self.fail_setup(&key, port).await;
                Err(e)
            }
        }
    }

    /// Bind the receiver, open the model session, and wire the pump.
    /// On success the call is `AwaitingMedia` with its inbound flag set.
    async fn start_call_units(&self, key: &CallKey, port: u16) -> Result<()> {
        let local = (self.config.bind_ip, port).into();
        let filter: Box<dyn AudioPreFilter> = if self.config.energy_gate {
            Box::new(EnergyGateFilter::new(EnergyGateConfig::default()))
        } else {
            Box::new(NoopFilter)
        };

        let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(64);
        let receiver = MediaReceiver::bind(
            key.as_str(),
            local,
            self.config.receiver_config(),
            filter,
            audio_tx,
        )
        .await?;
        let receiver = receiver.start();

        let ready = self
            .registry
            .acknowledge_channel(key)
            .and_then(|()| self.registry.mark_inbound_ready(key).map(|_| ()));
        if let Err(e) = ready {
            receiver.shutdown().await;
            return Err(e.into());
        }

        let (session, event_rx) =
            match ModelSession::connect(key.as_str(), self.config.session_config()).await {
                Ok(pair) => pair,
                Err(e) => {
                    receiver.shutdown().await;
                    return Err(e.into());
                }
            };
        let session = Arc::new(session);

        let (segments_tx, segments_rx) = mpsc::channel::<Bytes>(256);
        let pump = tokio::spawn(run_pump(
            key.clone(),
            self.registry.clone(),
            session.clone(),
            audio_rx,
            event_rx,
            segments_tx,
            self.transcripts.clone(),
            self.command_tx.clone(),
        ));

        self.calls.insert(
            key.clone(),
            CallRuntime {
                receiver,
                sender: None,
                segments_rx: Some(segments_rx),
                session,
                pump,
            },
        );
        Ok(())
    }

    async fn on_stream_ready(&self, call_key: String, media_addr: std::net::SocketAddr) -> Result<()> {
        let key = CallKey::from(call_key.as_str());

        {
            let mut runtime = self
                .calls
                .get_mut(&key)
                .ok_or_else(|| Error::NoRuntime(call_key.clone()))?;

            let Some(segments_rx) = runtime.segments_rx.take() else {
                debug!(call_key, "duplicate stream-ready ignored");
                return Ok(());
            };

            // Symmetric RTP: transmit from the same socket the receiver is
            // bound on, toward the switch's negotiated endpoint.
            let sender = MediaSender::new(
                key.as_str(),
                runtime.receiver.socket(),
                media_addr,
                self.config.sender_config(),
            );
            info!(
                call_key,
                remote = %media_addr,
                ssrc = format_args!("{:#010x}", sender.ssrc()),
                "outbound media started"
            );
            runtime.sender = Some(sender.start(segments_rx));
        }

        let phase = self.registry.mark_outbound_ready(&key)?;
        if phase == CallPhase::MediaActive {
            info!(call_key, "call is bridged");
        }
        Ok(())
    }

    /// Tear down one call end to end: stop media, close the model session,
    /// release the port, close and delete the record. Idempotent; a second
    /// hangup for the same call is a no-op.
    pub async fn teardown_call(&self, key: &CallKey) -> Result<()> {
        let fresh = self.registry.begin_teardown(key)?;

        // Stop any live runtime either way: a call that already failed
        // (fresh == false) may still have its units running.
        if let Some((_, runtime)) = self.calls.remove(key) {
            // Stop ingest first so nothing new enters the pipeline, then
            // the session, then the pacer. The pump exits on its own once
            // its channels close.
            runtime.receiver.shutdown().await;
            runtime.session.shutdown().await;
            if let Some(sender) = runtime.sender {
                sender.shutdown().await;
            }
            let _ = runtime.pump.await;
        }

        if self.registry.contains(key) {
            if let Some(port) = self.registry.clear_port(key)? {
                if let Err(e) = self.pool.release(port, key.as_str()) {
                    warn!(call_key = %key, port, error = %e, "port release failed");
                }
            }
        }

        if !fresh {
            // Duplicate hangup, or a call already in a terminal phase:
            // resources are gone, just drop any terminal record left over.
            let _ = self.registry.remove_terminal(key);
            debug!(call_key = %key, "teardown already handled");
            return Ok(());
        }

        self.registry.confirm_closed(key)?;
        let _ = self.registry.remove_terminal(key);
        info!(call_key = %key, "call torn down");
        Ok(())
    }

    /// Cleanup after a failed setup: stop whatever started, return the
    /// port, and leave a `Failed` record behind for diagnostics.
    async fn fail_setup(&self, key: &CallKey, port: u16) {
        if let Some((_, runtime)) = self.calls.remove(key) {
            runtime.receiver.shutdown().await;
            runtime.session.shutdown().await;
            if let Some(sender) = runtime.sender {
                sender.shutdown().await;
            }
            let _ = runtime.pump.await;
        }
        let _ = self.registry.clear_port(key);
        if let Err(e) = self.pool.release(port, key.as_str()) {
            warn!(call_key = %key, port, error = %e, "port release failed");
        }
        let _ = self.registry.mark_failed(key);
        self.send_command(SwitchCommand::Hangup {
            call_key: key.to_string(),
        })
        .await;
    }

    async fn send_command(&self, command: SwitchCommand) {
        if self.command_tx.send(command).await.is_err() {
            warn!("switch command channel closed");
        }
    }

    // --- diagnostic surface ---

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn active_calls(&self) -> usize {
        self.registry.len()
    }

    /// Full status of one call.
    pub fn call_status(&self, key: &CallKey) -> Result<CallStatus> {
        let record = self
            .registry
            .get(key)
            .ok_or_else(|| voicebridge_call_registry::Error::CallNotFound(key.to_string()))?;

        let runtime = self.calls.get(key);
        Ok(CallStatus {
            call_key: record.call_key.to_string(),
            carrier_call_id: record.carrier_call_id,
            phase: record.phase,
            rtp_port: record.rtp_port,
            inbound_ready: record.inbound_ready,
            outbound_ready: record.outbound_ready,
            uptime_ms: record.created_at.elapsed().as_millis() as u64,
            receiver: runtime.as_ref().map(|r| r.receiver.stats()),
            sender: runtime
                .as_ref()
                .and_then(|r| r.sender.as_ref().map(|s| s.stats())),
            session_state: runtime.as_ref().map(|r| r.session.state()),
            session: runtime.as_ref().map(|r| r.session.counters()),
        })
    }

    /// Status of every known call.
    pub fn list_calls(&self) -> Vec<CallStatus> {
        self.registry
            .snapshot_all()
            .into_iter()
            .filter_map(|record| self.call_status(&record.call_key).ok())
            .collect()
    }

    /// Report orphaned port leases without touching them.
    pub fn audit_orphans(&self) -> OrphanReport {
        let min_age = self.config.min_orphan_age();
        let orphans = self
            .pool
            .audit(|call_key| self.registry.is_absent_or_terminal(&CallKey::from(call_key)))
            .into_iter()
            .map(|lease| OrphanedLease {
                port: lease.port,
                call_key: lease.call_key,
                held_ms: lease.allocated_at.elapsed().as_millis() as u64,
                actionable: lease.allocated_at.elapsed() >= min_age,
            })
            .collect();
        OrphanReport {
            orphans,
            released: 0,
        }
    }

    /// Audit and, when `auto_release` is set, force-release every orphaned
    /// lease old enough to be actionable.
    pub fn cleanup(&self, auto_release: bool) -> OrphanReport {
        let mut report = self.audit_orphans();
        if !auto_release {
            return report;
        }
        for orphan in report.orphans.iter().filter(|o| o.actionable) {
            if self.pool.release(orphan.port, &orphan.call_key).is_ok() {
                report.released += 1;
            }
            self.registry.force_remove(&CallKey::from(orphan.call_key.as_str()));
        }
        if report.released > 0 {
            warn!(released = report.released, "orphaned ports force-released");
        }
        report
    }

    /// Reconnect one call's model session without touching its call record
    /// or port.
    pub async fn force_recovery(&self, key: &CallKey) -> Result<()> {
        let session = self.session_of(key)?;
        session.force_recovery().await?;
        Ok(())
    }

    /// Force end-of-utterance on one call's input buffer.
    pub async fn force_commit(&self, key: &CallKey) -> Result<()> {
        let session = self.session_of(key)?;
        session.commit().await?;
        Ok(())
    }

    /// Inject diagnostic text into one call's conversation.
    pub async fn send_text(&self, key: &CallKey, text: impl Into<String>) -> Result<()> {
        let session = self.session_of(key)?;
        session.inject_text(text).await?;
        Ok(())
    }

    fn session_of(&self, key: &CallKey) -> Result<Arc<ModelSession>> {
        // Clone the handle out so no map shard lock is held across awaits.
        self.calls
            .get(key)
            .map(|runtime| runtime.session.clone())
            .ok_or_else(|| Error::NoRuntime(key.to_string()))
    }

    /// Stop the audit sweep and tear down every live call.
    pub async fn shutdown(&self) {
        let _ = self.audit_shutdown.send(true);
        let task = self.audit_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let keys: Vec<CallKey> = self.calls.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Err(e) = self.teardown_call(&key).await {
                warn!(call_key = %key, error = %e, "teardown during shutdown failed");
            }
        }
        info!("bridge engine stopped");
    }
}

/// Moves audio between the receiver, the model session, and the sender,
/// and routes transcript fragments to the sink.
#[allow(clippy::too_many_arguments)]
async fn run_pump(
    key: CallKey,
    registry: Arc<CallRegistry>,
    session: Arc<ModelSession>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    segments_tx: mpsc::Sender<Bytes>,
    transcripts: Arc<dyn TranscriptSink>,
    command_tx: mpsc::Sender<SwitchCommand>,
) {
    loop {
        tokio::select! {
            chunk = audio_rx.recv() => {
                match chunk {
                    Some(chunk) => {
                        if session.send_audio(chunk).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            event = event_rx.recv() => {
                match event {
                    Some(SessionEvent::AudioDelta(audio)) => {
                        // Before StreamReady the segment channel has no
                        // consumer; dropping early model audio is better
                        // than stalling caller ingest behind it.
                        if let Err(mpsc::error::TrySendError::Full(_)) = segments_tx.try_send(audio) {
                            debug!(call_key = %key, "dropped model audio: outbound path not draining");
                        }
                    }
                    Some(SessionEvent::TranscriptDelta(delta)) => {
                        transcripts.model_transcript(key.as_str(), &delta).await;
                    }
                    Some(SessionEvent::CallerTranscript(text)) => {
                        transcripts.caller_transcript(key.as_str(), &text).await;
                    }
                    Some(SessionEvent::Degraded) => {
                        warn!(call_key = %key, "model session degraded");
                    }
                    Some(SessionEvent::Recovered) => {
                        info!(call_key = %key, "model session recovered");
                    }
                    Some(SessionEvent::ModelError(message)) => {
                        warn!(call_key = %key, message, "model error");
                    }
                    Some(SessionEvent::Closed) | None => {
                        // A session that dies outside teardown fails the
                        // call and asks the switch to hang up the leg.
                        let terminating = matches!(
                            registry.get(&key).map(|r| r.phase),
                            None | Some(CallPhase::Terminating | CallPhase::Closed | CallPhase::Failed)
                        );
                        if !terminating {
                            error!(call_key = %key, "model session lost; failing call");
                            let _ = registry.mark_failed(&key);
                            let _ = command_tx
                                .send(SwitchCommand::Hangup {
                                    call_key: key.to_string(),
                                })
                                .await;
                        }
                        break;
                    }
                    Some(SessionEvent::Ready | SessionEvent::SpeechStarted | SessionEvent::SpeechStopped) => {}
                }
            }
        }
    }
    debug!(call_key = %key, "audio pump exited");
}

/// Background pass over the port pool. Reports every orphan; acts only on
/// leases orphaned longer than the minimum age, and only when auto-release
/// is configured.
async fn run_audit_sweep(
    pool: Arc<PortPool>,
    registry: Arc<CallRegistry>,
    interval: Duration,
    min_orphan_age: Duration,
    auto_release: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let orphans =
                    pool.audit(|call_key| registry.is_absent_or_terminal(&CallKey::from(call_key)));
                for lease in orphans {
                    let age = lease.allocated_at.elapsed();
                    warn!(
                        port = lease.port,
                        call_key = %lease.call_key,
                        age_secs = age.as_secs(),
                        "orphaned port lease"
                    );
                    if auto_release && age >= min_orphan_age {
                        let _ = pool.release(lease.port, &lease.call_key);
                        registry.force_remove(&CallKey::from(lease.call_key.as_str()));
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
