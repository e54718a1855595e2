//! Per-call model session: connection lifecycle, audio relay, stall
//! detection, and recovery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::protocol::{ClientEvent, ConversationItem, ServerEvent, SessionUpdateParams};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the model session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

/// Events relayed from the model to the rest of the call.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session configured and accepting audio.
    Ready,
    /// Decoded model audio for the media sender.
    AudioDelta(Bytes),
    /// Incremental transcript of model speech.
    TranscriptDelta(String),
    /// Completed transcription of caller speech.
    CallerTranscript(String),
    SpeechStarted,
    SpeechStopped,
    /// Stall or broken connection detected; recovery in progress.
    Degraded,
    /// Activity resumed or a forced-recovery reconnect succeeded.
    Recovered,
    /// Error event relayed from the model.
    ModelError(String),
    /// Session is gone, either cleanly or after failed recovery.
    Closed,
}

enum Command {
    Audio(Bytes),
    Commit,
    InjectText(String),
    Recover,
    Shutdown,
}

/// Diagnostic counters, written by the session task, read by anyone.
#[derive(Debug)]
pub struct SessionCounters {
    chunks_sent: AtomicU64,
    chunks_received: AtomicU64,
    recoveries: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl SessionCounters {
    fn new() -> Self {
        Self {
            chunks_sent: AtomicU64::new(0),
            chunks_received: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn snapshot(&self) -> SessionCountersSnapshot {
        SessionCountersSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            idle_ms: self.idle().as_millis() as u64,
        }
    }
}

/// Point-in-time counters for the diagnostic surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionCountersSnapshot {
    pub chunks_sent: u64,
    pub chunks_received: u64,
    pub recoveries: u64,
    pub idle_ms: u64,
}

/// Handle to one call's model session.
///
/// Owned exclusively by the session layer; other components observe it
/// through [`SessionState`] and [`SessionCountersSnapshot`] only.
pub struct ModelSession {
    call_key: String,
    state: Arc<RwLock<SessionState>>,
    counters: Arc<SessionCounters>,
    cmd_tx: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ModelSession {
    /// Open the connection and spawn the session task. Fails fast when the
    /// initial connect fails; recovery applies only to established
    /// sessions.
    pub async fn connect(
        call_key: impl Into<String>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let call_key = call_key.into();
        let ws = open_socket(&config).await?;
        info!(call_key, url = %config.url, "model session connected");

        let state = Arc::new(RwLock::new(SessionState::Connecting));
        let counters = Arc::new(SessionCounters::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);

        let task = tokio::spawn(run_session(
            call_key.clone(),
            config,
            ws,
            state.clone(),
            counters.clone(),
            cmd_rx,
            event_tx,
        ));

        Ok((
            Self {
                call_key,
                state,
                counters,
                cmd_tx,
                task: Mutex::new(Some(task)),
            },
            event_rx,
        ))
    }

    pub fn call_key(&self) -> &str {
        &self.call_key
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn counters(&self) -> SessionCountersSnapshot {
        self.counters.snapshot()
    }

    /// Queue caller audio for append. Chunks are coalesced to respect the
    /// configured maximum message rate.
    pub async fn send_audio(&self, audio: Bytes) -> Result<()> {
        self.send_command(Command::Audio(audio)).await
    }

    /// Force end-of-utterance even absent detected silence.
    pub async fn commit(&self) -> Result<()> {
        self.send_command(Command::Commit).await
    }

    /// Inject a diagnostic text message and request a response.
    pub async fn inject_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_command(Command::InjectText(text.into())).await
    }

    /// Tear down and re-establish the connection without touching the call
    /// record. Used by the stall detector and the diagnostic surface.
    pub async fn force_recovery(&self) -> Result<()> {
        self.send_command(Command::Recover).await
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.cmd_tx.send(command).await.map_err(|_| Error::Closed)
    }

    /// Close the session and wait for the task to exit. Idempotent, and
    /// callable through a shared handle so owners holding the session in an
    /// `Arc` can still tear it down.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        debug!(call_key = %self.call_key, "model session shut down");
    }
}

async fn open_socket(config: &SessionConfig) -> Result<WsStream> {
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(key) = &config.api_key {
        let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|_| Error::Protocol("api key is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", bearer);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));
    }
    let (ws, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(ws)
}

/// Why one connection's serve loop ended.
enum ConnectionExit {
    Shutdown,
    Broken,
}

async fn run_session(
    call_key: String,
    config: SessionConfig,
    mut ws: WsStream,
    state: Arc<RwLock<SessionState>>,
    counters: Arc<SessionCounters>,
    mut cmd_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<SessionEvent>,
) {
    // Audio queued but not yet appended. Survives reconnects: it was never
    // accepted by the model, so sending it afterwards duplicates nothing.
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let exit = serve_connection(
            &call_key,
            &config,
            &mut ws,
            &state,
            &counters,
            &mut cmd_rx,
            &event_tx,
            &mut pending,
        )
        .await;

        match exit {
            ConnectionExit::Shutdown => {
                let _ = ws.close(None).await;
                *state.write() = SessionState::Closed;
                let _ = event_tx.send(SessionEvent::Closed).await;
                break;
            }
            ConnectionExit::Broken => {
                let _ = ws.close(None).await;
                match reconnect(&call_key, &config, &counters).await {
                    Ok(new_ws) => {
                        // The fresh connection re-enters ready via its own
                        // session.created; audio accepted before the break
                        // stays in the model's buffer and is not replayed.
                        ws = new_ws;
                    }
                    Err(e) => {
                        warn!(call_key, error = %e, "session recovery exhausted");
                        *state.write() = SessionState::Closed;
                        let _ = event_tx
                            .send(SessionEvent::ModelError(e.to_string()))
                            .await;
                        let _ = event_tx.send(SessionEvent::Closed).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn reconnect(
    call_key: &str,
    config: &SessionConfig,
    counters: &SessionCounters,
) -> Result<WsStream> {
    let attempts = config.max_recovery_attempts.max(1);
    for attempt in 1..=attempts {
        tokio::time::sleep(Duration::from_millis(250) * attempt).await;
        match open_socket(config).await {
            Ok(ws) => {
                counters.recoveries.fetch_add(1, Ordering::Relaxed);
                info!(call_key, attempt, "model session reconnected");
                return Ok(ws);
            }
            Err(e) => {
                warn!(call_key, attempt, error = %e, "reconnect attempt failed");
            }
        }
    }
    Err(Error::Unrecoverable { attempts })
}

#[allow(clippy::too_many_arguments)]
async fn serve_connection(
    call_key: &str,
    config: &SessionConfig,
    ws: &mut WsStream,
    state: &RwLock<SessionState>,
    counters: &SessionCounters,
    cmd_rx: &mut mpsc::Receiver<Command>,
    event_tx: &mpsc::Sender<SessionEvent>,
    pending: &mut Vec<u8>,
) -> ConnectionExit {
    let mut last_append = Instant::now() - config.append_min_interval;
    // One ticker drives both append coalescing and the stall check.
    let mut ticker = tokio::time::interval(config.append_min_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                match command {
                    Some(Command::Audio(audio)) => {
                        pending.extend_from_slice(&audio);
                        if last_append.elapsed() >= config.append_min_interval {
                            if flush_append(ws, pending, counters).await.is_err() {
                                return ConnectionExit::Broken;
                            }
                            last_append = Instant::now();
                        }
                    }
                    Some(Command::Commit) => {
                        if flush_append(ws, pending, counters).await.is_err()
                            || send_event(ws, &ClientEvent::InputAudioBufferCommit).await.is_err()
                        {
                            return ConnectionExit::Broken;
                        }
                        debug!(call_key, "forced input commit");
                    }
                    Some(Command::InjectText(text)) => {
                        let create = ClientEvent::ConversationItemCreate {
                            item: ConversationItem::user_text(text),
                        };
                        if send_event(ws, &create).await.is_err()
                            || send_event(ws, &ClientEvent::ResponseCreate).await.is_err()
                        {
                            return ConnectionExit::Broken;
                        }
                    }
                    Some(Command::Recover) => {
                        info!(call_key, "forced session recovery requested");
                        mark_degraded(state, event_tx).await;
                        return ConnectionExit::Broken;
                    }
                    Some(Command::Shutdown) | None => return ConnectionExit::Shutdown,
                }
            }
            message = ws.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        touch_activity(state, counters, event_tx).await;
                        handle_server_event(call_key, config, ws, state, counters, event_tx, &text)
                            .await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => {
                        touch_activity(state, counters, event_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        warn!(call_key, "model connection dropped");
                        mark_degraded(state, event_tx).await;
                        return ConnectionExit::Broken;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() && last_append.elapsed() >= config.append_min_interval {
                    if flush_append(ws, pending, counters).await.is_err() {
                        return ConnectionExit::Broken;
                    }
                    last_append = Instant::now();
                }

                // Stall detection: a ready session with no model activity
                // for the idle window degrades and forces a reconnect.
                if *state.read() == SessionState::Ready
                    && counters.idle() >= config.idle_timeout
                {
                    let stall = Error::Stall {
                        idle_secs: counters.idle().as_secs(),
                    };
                    warn!(call_key, error = %stall, "session stall detected");
                    mark_degraded(state, event_tx).await;
                    return ConnectionExit::Broken;
                }
            }
        }
    }
}

async fn handle_server_event(
    call_key: &str,
    config: &SessionConfig,
    ws: &mut WsStream,
    state: &RwLock<SessionState>,
    counters: &SessionCounters,
    event_tx: &mpsc::Sender<SessionEvent>,
    raw: &str,
) {
    let event = match serde_json::from_str::<ServerEvent>(raw) {
        Ok(event) => event,
        Err(e) => {
            debug!(call_key, error = %e, "unparseable model event ignored");
            return;
        }
    };

    match event {
        ServerEvent::SessionCreated { .. } => {
            // Configure before accepting audio: turn detection and formats
            // are fixed for the session's duration.
            let configure = ClientEvent::SessionUpdate {
                session: SessionUpdateParams::from_config(config),
            };
            if send_event(ws, &configure).await.is_err() {
                return;
            }
            let was = {
                let mut s = state.write();
                let was = *s;
                *s = SessionState::Ready;
                was
            };
            match was {
                SessionState::Connecting => {
                    info!(call_key, "model session ready");
                    let _ = event_tx.send(SessionEvent::Ready).await;
                }
                SessionState::Degraded => {
                    info!(call_key, "model session recovered");
                    let _ = event_tx.send(SessionEvent::Recovered).await;
                }
                _ => {}
            }
        }
        ServerEvent::SessionUpdated { .. } => {}
        ServerEvent::ResponseAudioDelta { delta } => match BASE64.decode(delta.as_bytes()) {
            Ok(audio) => {
                counters.chunks_received.fetch_add(1, Ordering::Relaxed);
                let _ = event_tx.send(SessionEvent::AudioDelta(Bytes::from(audio))).await;
            }
            Err(e) => {
                debug!(call_key, error = %e, "dropped undecodable audio delta");
            }
        },
        ServerEvent::ResponseAudioDone {} => {}
        ServerEvent::ResponseAudioTranscriptDelta { delta } => {
            let _ = event_tx.send(SessionEvent::TranscriptDelta(delta)).await;
        }
        ServerEvent::InputTranscriptionCompleted { transcript } => {
            let _ = event_tx.send(SessionEvent::CallerTranscript(transcript)).await;
        }
        ServerEvent::SpeechStarted {} => {
            let _ = event_tx.send(SessionEvent::SpeechStarted).await;
        }
        ServerEvent::SpeechStopped {} => {
            let _ = event_tx.send(SessionEvent::SpeechStopped).await;
        }
        ServerEvent::InputAudioBufferCommitted {} => {}
        ServerEvent::Error { error } => {
            warn!(call_key, message = %error.message, "model error event");
            let _ = event_tx.send(SessionEvent::ModelError(error.message)).await;
        }
        ServerEvent::Unknown => {}
    }
}

async fn mark_degraded(state: &RwLock<SessionState>, event_tx: &mpsc::Sender<SessionEvent>) {
    let changed = {
        let mut s = state.write();
        if *s == SessionState::Ready || *s == SessionState::Connecting {
            *s = SessionState::Degraded;
            true
        } else {
            false
        }
    };
    if changed {
        let _ = event_tx.send(SessionEvent::Degraded).await;
    }
}

async fn touch_activity(
    state: &RwLock<SessionState>,
    counters: &SessionCounters,
    event_tx: &mpsc::Sender<SessionEvent>,
) {
    counters.touch();
    // Resumed activity on a degraded-but-connected session restores it.
    let recovered = {
        let mut s = state.write();
        if *s == SessionState::Degraded {
            *s = SessionState::Ready;
            true
        } else {
            false
        }
    };
    if recovered {
        let _ = event_tx.send(SessionEvent::Recovered).await;
    }
}

async fn flush_append(
    ws: &mut WsStream,
    pending: &mut Vec<u8>,
    counters: &SessionCounters,
) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let audio = BASE64.encode(&pending);
    pending.clear();
    send_event(ws, &ClientEvent::InputAudioBufferAppend { audio }).await?;
    counters.chunks_sent.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

async fn send_event(ws: &mut WsStream, event: &ClientEvent) -> Result<()> {
    let json = serde_json::to_string(event)
        .map_err(|e| Error::Protocol(format!("failed to encode client event: {e}")))?;
    ws.send(Message::Text(json)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn test_config(port: u16) -> SessionConfig {
        SessionConfig {
            url: format!("ws://127.0.0.1:{port}"),
            api_key: None,
            idle_timeout: Duration::from_millis(400),
            append_min_interval: Duration::from_millis(20),
            max_recovery_attempts: 2,
            ..SessionConfig::default()
        }
    }

    async fn bind_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    const SESSION_CREATED: &str = r#"{"type":"session.created","session":{"id":"sess_1"}}"#;

    async fn recv_until<F>(event_rx: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn configures_session_and_reports_ready() {
        let (listener, port) = bind_listener().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(SESSION_CREATED.to_string()))
                .await
                .unwrap();
            // The first client message must be the session configure.
            let msg = ws.next().await.unwrap().unwrap();
            let json: serde_json::Value =
                serde_json::from_str(msg.to_text().unwrap()).unwrap();
            assert_eq!(json["type"], "session.update");
            assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
            ws
        });

        let (session, mut event_rx) = ModelSession::connect("call-ready", test_config(port))
            .await
            .unwrap();

        recv_until(&mut event_rx, |e| matches!(e, SessionEvent::Ready)).await;
        assert_eq!(session.state(), SessionState::Ready);

        let _ws = server.await.unwrap();
        session.shutdown().await;
    }

    #[tokio::test]
    async fn relays_audio_and_transcript_deltas() {
        let (listener, port) = bind_listener().await;

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(SESSION_CREATED.to_string()))
                .await
                .unwrap();
            // Consume the configure, then speak.
            let _ = ws.next().await;
            let delta = BASE64.encode(b"model audio frame");
            ws.send(Message::Text(format!(
                r#"{{"type":"response.audio.delta","delta":"{delta}"}}"#
            )))
            .await
            .unwrap();
            ws.send(Message::Text(
                r#"{"type":"response.audio_transcript.delta","delta":"hello"}"#.to_string(),
            ))
            .await
            .unwrap();
            // Keep the socket open until the client is done.
            while ws.next().await.is_some() {}
        });

        let (session, mut event_rx) = ModelSession::connect("call-delta", test_config(port))
            .await
            .unwrap();

        let audio = recv_until(&mut event_rx, |e| matches!(e, SessionEvent::AudioDelta(_))).await;
        match audio {
            SessionEvent::AudioDelta(bytes) => assert_eq!(&bytes[..], b"model audio frame"),
            other => panic!("unexpected event: {other:?}"),
        }

        let transcript =
            recv_until(&mut event_rx, |e| matches!(e, SessionEvent::TranscriptDelta(_))).await;
        match transcript {
            SessionEvent::TranscriptDelta(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(session.counters().chunks_received, 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn coalesced_appends_carry_all_audio() {
        let (listener, port) = bind_listener().await;
        let (bytes_tx, mut bytes_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(SESSION_CREATED.to_string()))
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
                    if json["type"] == "input_audio_buffer.append" {
                        let audio = BASE64
                            .decode(json["audio"].as_str().unwrap().as_bytes())
                            .unwrap();
                        let _ = bytes_tx.send(audio);
                    }
                }
            }
        });

        let (session, mut event_rx) = ModelSession::connect("call-append", test_config(port))
            .await
            .unwrap();
        recv_until(&mut event_rx, |e| matches!(e, SessionEvent::Ready)).await;

        // Bursts faster than the append interval must coalesce without loss.
        for chunk in [&b"aaaa"[..], b"bbbb", b"cccc", b"dddd"] {
            session.send_audio(Bytes::from_static(chunk)).await.unwrap();
        }
        session.commit().await.unwrap();

        let mut received = Vec::new();
        while received.len() < 16 {
            let chunk = tokio::time::timeout(Duration::from_secs(5), bytes_rx.recv())
                .await
                .expect("timed out waiting for appended audio")
                .expect("server task gone");
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"aaaabbbbccccdddd");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn stall_degrades_then_reconnect_recovers() {
        let (listener, port) = bind_listener().await;

        tokio::spawn(async move {
            // First connection: create the session, then go silent so the
            // idle window elapses.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(SESSION_CREATED.to_string()))
                .await
                .unwrap();
            let _ = ws.next().await;

            // Second connection: the recovery reconnect.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws2 = accept_async(stream).await.unwrap();
            ws2.send(Message::Text(SESSION_CREATED.to_string()))
                .await
                .unwrap();
            while ws2.next().await.is_some() {}
        });

        let (session, mut event_rx) = ModelSession::connect("call-stall", test_config(port))
            .await
            .unwrap();

        recv_until(&mut event_rx, |e| matches!(e, SessionEvent::Ready)).await;
        recv_until(&mut event_rx, |e| matches!(e, SessionEvent::Degraded)).await;
        recv_until(&mut event_rx, |e| matches!(e, SessionEvent::Recovered)).await;

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.counters().recoveries, 1);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_recovery_closes_session() {
        let (listener, port) = bind_listener().await;

        tokio::spawn(async move {
            // Accept once, then drop the socket and stop listening so every
            // reconnect attempt fails.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::Text(SESSION_CREATED.to_string()))
                .await
                .unwrap();
            let _ = ws.next().await;
            drop(ws);
            drop(listener);
        });

        let (session, mut event_rx) = ModelSession::connect("call-dead", test_config(port))
            .await
            .unwrap();

        recv_until(&mut event_rx, |e| matches!(e, SessionEvent::Ready)).await;
        session.force_recovery().await.unwrap();
        recv_until(&mut event_rx, |e| matches!(e, SessionEvent::Closed)).await;
        assert_eq!(session.state(), SessionState::Closed);
        session.shutdown().await;
    }
}
