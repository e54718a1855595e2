//! Per-call outbound media path.
//!
//! Audio segments produced by the speech model are sliced into fixed-size
//! frames, stamped with monotonic sequence/timestamp counters and a stable
//! stream identifier, and written over UDP at a fixed pacing interval equal
//! to the frame duration. Pacing — not send-as-fast-as-possible — keeps the
//! far-end playout buffer from overrunning.
//!
//! An adaptive depth buffer sits ahead of the pacer: its target depth grows
//! within a bounded range when delivery has shown gaps or the source has
//! been bursty, and shrinks back toward the minimum after a steady
//! cooldown. A little latency is traded away only when instability has
//! actually been observed.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::packet::{RtpHeader, RtpPacket};
use crate::{RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// What to do with queued frames when the call tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Keep pacing until the queue is empty, then stop.
    Drain,
    /// Drop whatever is queued and stop immediately.
    Discard,
}

/// Sender tuning. Defaults suit 20 ms G.711 frames at 8 kHz.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Bytes per RTP payload frame.
    pub frame_bytes: usize,
    /// Wall-clock interval between frames; also the pacing period.
    pub frame_duration: Duration,
    /// Timestamp advance per frame, in samples.
    pub samples_per_frame: u32,
    /// RTP payload type for outbound frames.
    pub payload_type: u8,
    /// Byte used to pad a trailing partial frame (μ-law silence).
    pub pad_byte: u8,
    /// Minimum adaptive buffer depth, in frames.
    pub min_depth: usize,
    /// Maximum adaptive buffer depth, in frames.
    pub max_depth: usize,
    /// Steady delivery for this long shrinks the target depth one step.
    pub steady_cooldown: Duration,
    /// Teardown behavior for queued frames.
    pub drain_policy: DrainPolicy,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            frame_bytes: 160,
            frame_duration: Duration::from_millis(20),
            samples_per_frame: 160,
            payload_type: 0,
            pad_byte: 0xFF,
            min_depth: 2,
            max_depth: 12,
            steady_cooldown: Duration::from_secs(2),
            drain_policy: DrainPolicy::Discard,
        }
    }
}

/// Outbound counters.
#[derive(Debug, Default)]
pub struct SenderStats {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    segments_received: AtomicU64,
    underruns: AtomicU64,
    frames_discarded: AtomicU64,
}

/// Point-in-time copy of [`SenderStats`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SenderStatsSnapshot {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub segments_received: u64,
    pub underruns: u64,
    pub frames_discarded: u64,
}

impl SenderStats {
    pub fn snapshot(&self) -> SenderStatsSnapshot {
        SenderStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            segments_received: self.segments_received.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Bounded target-depth controller for the output buffer.
///
/// Grows on evidence of instability (underrun or bursty arrival), shrinks
/// one step at a time once delivery has been steady for the cooldown.
#[derive(Debug)]
pub(crate) struct AdaptiveDepth {
    target: usize,
    min: usize,
    max: usize,
    cooldown: Duration,
    last_instability: Option<Instant>,
    last_shrink: Instant,
}

impl AdaptiveDepth {
    pub(crate) fn new(min: usize, max: usize, cooldown: Duration) -> Self {
        Self {
            target: min,
            min,
            max,
            cooldown,
            last_instability: None,
            last_shrink: Instant::now(),
        }
    }

    pub(crate) fn target(&self) -> usize {
        self.target
    }

    pub(crate) fn on_instability(&mut self, now: Instant) {
        self.target = (self.target + 1).min(self.max);
        self.last_instability = Some(now);
    }

    /// Called on each steadily delivered frame.
    pub(crate) fn on_steady(&mut self, now: Instant) {
        if self.target == self.min {
            return;
        }
        let since_instability = self
            .last_instability
            .map(|t| now.duration_since(t))
            .unwrap_or(self.cooldown);
        if since_instability >= self.cooldown && now.duration_since(self.last_shrink) >= self.cooldown
        {
            self.target -= 1;
            self.last_shrink = now;
        }
    }
}

/// Builds and spawns the paced send loop for one call.
pub struct MediaSender {
    call_key: String,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    config: SenderConfig,
    ssrc: RtpSsrc,
}

impl MediaSender {
    /// `socket` is normally the receiver's socket (symmetric RTP);
    /// `remote` is the switch's negotiated media endpoint for this call.
    pub fn new(
        call_key: impl Into<String>,
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        config: SenderConfig,
    ) -> Self {
        Self {
            call_key: call_key.into(),
            socket,
            remote,
            config,
            // Stream identifier is chosen once per call and never changes.
            ssrc: rand::random(),
        }
    }

    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// Spawn the pacer. `segments_rx` carries whole audio segments from the
    /// session manager; they are sliced into frames here.
    pub fn start(self, segments_rx: mpsc::Receiver<Bytes>) -> MediaSenderHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(SenderStats::default());
        let call_key = self.call_key.clone();

        let task = tokio::spawn(run_pacer(self, segments_rx, shutdown_rx, stats.clone()));

        MediaSenderHandle {
            call_key,
            stats,
            shutdown_tx,
            task,
        }
    }
}

/// Control handle for a running sender.
pub struct MediaSenderHandle {
    call_key: String,
    stats: Arc<SenderStats>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MediaSenderHandle {
    pub fn stats(&self) -> SenderStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the pacer, draining or discarding queued frames per the
    /// configured [`DrainPolicy`]. Resolves once the loop has exited.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        debug!(call_key = %self.call_key, "media sender stopped");
    }
}

struct PacerState {
    queue: VecDeque<Bytes>,
    sequence: RtpSequenceNumber,
    timestamp: RtpTimestamp,
    /// True while we are inside a talkspurt (frames flowing). Cleared on
    /// underrun so the next talkspurt re-primes and sets the marker bit.
    in_talkspurt: bool,
    /// False while refilling up to the adaptive target after a gap.
    primed: bool,
    /// Set when the queue ran dry mid-spurt. If more audio arrives within
    /// the grace window the dry spell was a real gap (underrun); if not,
    /// the model had simply finished talking.
    gap_since: Option<Instant>,
    depth: AdaptiveDepth,
}

async fn run_pacer(
    sender: MediaSender,
    mut segments_rx: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<SenderStats>,
) {
    let config = &sender.config;
    let mut ticker = tokio::time::interval(config.frame_duration);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut state = PacerState {
        queue: VecDeque::new(),
        sequence: rand::random(),
        timestamp: rand::random(),
        in_talkspurt: false,
        primed: false,
        gap_since: None,
        depth: AdaptiveDepth::new(config.min_depth, config.max_depth, config.steady_cooldown),
    };

    loop {
        tokio::select! {
            segment = segments_rx.recv() => {
                match segment {
                    Some(segment) => {
                        stats.segments_received.fetch_add(1, Ordering::Relaxed);
                        enqueue_segment(&mut state, config, &segment);
                    }
                    // Session is gone; finish what is queued and stop.
                    None => break,
                }
            }
            _ = ticker.tick() => {
                pace_one_frame(&sender, &mut state, &stats).await;
            }
            _ = shutdown.changed() => break,
        }
    }

    match config.drain_policy {
        DrainPolicy::Drain => {
            state.primed = true;
            while !state.queue.is_empty() {
                ticker.tick().await;
                pace_one_frame(&sender, &mut state, &stats).await;
            }
        }
        DrainPolicy::Discard => {
            let discarded = state.queue.len() as u64;
            if discarded > 0 {
                stats.frames_discarded.fetch_add(discarded, Ordering::Relaxed);
                trace!(call_key = %sender.call_key, discarded, "discarded queued frames on teardown");
            }
        }
    }
}

fn enqueue_segment(state: &mut PacerState, config: &SenderConfig, segment: &[u8]) {
    // More audio after a dry spell: if the spell was short it was a real
    // delivery gap, so grow the buffer target before resuming.
    if let Some(gap) = state.gap_since.take() {
        if gap.elapsed() <= config.frame_duration * 2 {
            state.depth.on_instability(Instant::now());
        }
    }

    let frames_before = state.queue.len();

    for chunk in segment.chunks(config.frame_bytes) {
        if chunk.len() == config.frame_bytes {
            state.queue.push_back(Bytes::copy_from_slice(chunk));
        } else {
            // Trailing partial frame: pad to the fixed size so the
            // timestamp cadence stays uniform.
            let mut padded = Vec::with_capacity(config.frame_bytes);
            padded.extend_from_slice(chunk);
            padded.resize(config.frame_bytes, config.pad_byte);
            state.queue.push_back(Bytes::from(padded));
        }
    }

    // A single arrival larger than the whole target window is a burst:
    // bump the target so the pacer rides it out without a later gap.
    if state.queue.len() - frames_before > config.max_depth {
        state.depth.on_instability(Instant::now());
    }

    if !state.primed && state.queue.len() >= state.depth.target() {
        state.primed = true;
    }
}

async fn pace_one_frame(sender: &MediaSender, state: &mut PacerState, stats: &SenderStats) {
    if !state.primed {
        // Still refilling toward the target depth after a gap.
        if state.queue.len() >= state.depth.target() {
            state.primed = true;
        } else {
            return;
        }
    }

    let Some(payload) = state.queue.pop_front() else {
        if state.in_talkspurt {
            // Queue ran dry mid-spurt. Whether this is an audible underrun
            // or simply the end of the response is decided when (or if)
            // the next segment arrives; see `enqueue_segment`.
            stats.underruns.fetch_add(1, Ordering::Relaxed);
            state.gap_since = Some(Instant::now());
            state.in_talkspurt = false;
            state.primed = false;
            trace!(call_key = %sender.call_key, target = state.depth.target(), "output queue dry");
        }
        return;
    };

    let mut header = RtpHeader::new(
        sender.config.payload_type,
        state.sequence,
        state.timestamp,
        sender.ssrc,
    );
    // Marker flags the first frame of each talkspurt.
    header.marker = !state.in_talkspurt;
    state.in_talkspurt = true;

    state.sequence = state.sequence.wrapping_add(1);
    state.timestamp = state.timestamp.wrapping_add(sender.config.samples_per_frame);

    let wire = RtpPacket::new(header, payload).serialize();
    match sender.socket.send_to(&wire, sender.remote).await {
        Ok(sent) => {
            stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
            state.depth.on_steady(Instant::now());
        }
        Err(e) => {
            warn!(call_key = %sender.call_key, error = %e, "frame send failed");
        }
    }
}

/// Convenience used by the engine: open a dedicated outbound socket when
/// symmetric RTP is not in use.
pub async fn ephemeral_socket() -> Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    Ok(Arc::new(socket))
}
