//! Per-call inbound media path.
//!
//! One receiver per call, bound to the call's leased port. Each datagram is
//! parsed as minimal-profile RTP, validated against the call's learned
//! stream binding, optionally pre-filtered, and appended to an accumulation
//! buffer. The buffer is flushed downstream when it reaches a minimum byte
//! threshold or when the flush interval elapses, whichever comes first —
//! bounding both per-chunk latency and per-chunk overhead.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::filter::AudioPreFilter;
use crate::packet::RtpPacket;
use crate::RtpSsrc;

/// Receiver tuning. Defaults suit 8 kHz G.711: flush at 200 ms of audio or
/// on the 200 ms timer.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Flush the accumulation buffer once it holds at least this many bytes.
    pub flush_min_bytes: usize,
    /// Flush whatever has accumulated after this long, even if below the
    /// byte threshold.
    pub flush_interval: Duration,
    /// Largest datagram accepted from the socket.
    pub max_datagram_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            flush_min_bytes: 1600,
            flush_interval: Duration::from_millis(200),
            max_datagram_size: 2048,
        }
    }
}

/// The expected inbound source, learned from the first accepted packet.
///
/// All subsequent packets must match both the transport address and the
/// stream identifier. A change mid-call is an anomaly: logged, dropped,
/// never re-bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBinding {
    pub source: SocketAddr,
    pub ssrc: RtpSsrc,
}

/// Live ingest counters.
#[derive(Debug, Default)]
pub struct ReceiverStats {
    packets_accepted: AtomicU64,
    packets_malformed: AtomicU64,
    packets_mismatched: AtomicU64,
    bytes_forwarded: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time copy of [`ReceiverStats`] for the diagnostic surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReceiverStatsSnapshot {
    pub packets_accepted: u64,
    pub packets_malformed: u64,
    pub packets_mismatched: u64,
    pub bytes_forwarded: u64,
    pub flushes: u64,
}

impl ReceiverStats {
    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            packets_accepted: self.packets_accepted.load(Ordering::Relaxed),
            packets_malformed: self.packets_malformed.load(Ordering::Relaxed),
            packets_mismatched: self.packets_mismatched.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// A bound-but-not-yet-started receiver.
///
/// Binding is separate from starting so the caller can confirm the inbound
/// transport is usable (and mark the call inbound-ready) before the ingest
/// loop runs.
pub struct MediaReceiver {
    call_key: String,
    socket: Arc<UdpSocket>,
    config: ReceiverConfig,
    filter: Box<dyn AudioPreFilter>,
    audio_tx: mpsc::Sender<Bytes>,
    stats: Arc<ReceiverStats>,
    binding: Arc<RwLock<Option<StreamBinding>>>,
}

impl MediaReceiver {
    /// Bind a UDP socket on `local` (normally the call's leased port).
    pub async fn bind(
        call_key: impl Into<String>,
        local: SocketAddr,
        config: ReceiverConfig,
        filter: Box<dyn AudioPreFilter>,
        audio_tx: mpsc::Sender<Bytes>,
    ) -> Result<Self> {
        let call_key = call_key.into();
        let socket = UdpSocket::bind(local).await?;
        debug!(call_key, local = %socket.local_addr()?, "media receiver bound");
        Ok(Self {
            call_key,
            socket: Arc::new(socket),
            config,
            filter,
            audio_tx,
            stats: Arc::new(ReceiverStats::default()),
            binding: Arc::new(RwLock::new(None)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// The bound socket, shared so a [`crate::MediaSender`] can transmit
    /// from the same port (symmetric RTP).
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Spawn the ingest loop and return its handle.
    pub fn start(self) -> MediaReceiverHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let socket = self.socket.clone();
        let stats = self.stats.clone();
        let binding = self.binding.clone();
        let call_key = self.call_key.clone();

        let task = tokio::spawn(run_ingest(self, shutdown_rx));

        MediaReceiverHandle {
            call_key,
            socket,
            stats,
            binding,
            shutdown_tx,
            task,
        }
    }
}

/// Control handle for a running receiver.
pub struct MediaReceiverHandle {
    call_key: String,
    socket: Arc<UdpSocket>,
    stats: Arc<ReceiverStats>,
    binding: Arc<RwLock<Option<StreamBinding>>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MediaReceiverHandle {
    pub fn stats(&self) -> ReceiverStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn binding(&self) -> Option<StreamBinding> {
        *self.binding.read()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Forget the learned stream binding so the next accepted packet
    /// re-establishes it. Operator tooling only; the engine never calls
    /// this during a normal call.
    pub fn rebind(&self) {
        let old = self.binding.write().take();
        if let Some(old) = old {
            info!(call_key = %self.call_key, old_ssrc = old.ssrc, "stream binding cleared for re-bind");
        }
    }

    /// Flush any partial buffer, stop the ingest loop, and drop the socket
    /// reference. Resolves once the loop has exited, so the caller may then
    /// safely release the port.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
        debug!(call_key = %self.call_key, "media receiver stopped");
    }
}

async fn run_ingest(mut rx: MediaReceiver, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; rx.config.max_datagram_size];
    let mut acc: Vec<u8> = Vec::with_capacity(rx.config.flush_min_bytes * 2);
    let mut flush_timer = tokio::time::interval(rx.config.flush_interval);
    flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately.
    flush_timer.tick().await;

    loop {
        tokio::select! {
            received = rx.socket.recv_from(&mut buf) => {
                let (len, source) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(call_key = %rx.call_key, error = %e, "socket receive failed");
                        break;
                    }
                };

                match ingest_datagram(&mut rx, &buf[..len], source, &mut acc) {
                    Ok(()) => {}
                    Err(Error::ChannelClosed) => break,
                    Err(_) => {} // dropped and counted inside
                }

                if acc.len() >= rx.config.flush_min_bytes
                    && flush(&rx, &mut acc).await.is_err()
                {
                    break;
                }
            }
            _ = flush_timer.tick() => {
                if !acc.is_empty() && flush(&rx, &mut acc).await.is_err() {
                    break;
                }
            }
            _ = shutdown.changed() => {
                if !acc.is_empty() {
                    let _ = flush(&rx, &mut acc).await;
                }
                break;
            }
        }
    }

    trace!(call_key = %rx.call_key, "ingest loop exited");
}

fn ingest_datagram(
    rx: &mut MediaReceiver,
    datagram: &[u8],
    source: SocketAddr,
    acc: &mut Vec<u8>,
) -> Result<()> {
    let packet = match RtpPacket::parse(datagram) {
        Ok(p) => p,
        Err(e) => {
            rx.stats.packets_malformed.fetch_add(1, Ordering::Relaxed);
            trace!(call_key = %rx.call_key, error = %e, "dropped malformed packet");
            return Err(e);
        }
    };

    // Bind to the first accepted source; everything after must match.
    let bound = *rx.binding.read();
    match bound {
        None => {
            let binding = StreamBinding {
                source,
                ssrc: packet.header.ssrc,
            };
            *rx.binding.write() = Some(binding);
            info!(
                call_key = %rx.call_key,
                source = %source,
                ssrc = format_args!("{:#010x}", packet.header.ssrc),
                "inbound stream bound"
            );
        }
        Some(b) if b.source != source || b.ssrc != packet.header.ssrc => {
            rx.stats.packets_mismatched.fetch_add(1, Ordering::Relaxed);
            debug!(
                call_key = %rx.call_key,
                expected_ssrc = format_args!("{:#010x}", b.ssrc),
                got_ssrc = format_args!("{:#010x}", packet.header.ssrc),
                source = %source,
                "dropped packet from unbound source"
            );
            return Err(Error::StreamBindingMismatch {
                source_addr: source,
                ssrc: packet.header.ssrc,
            });
        }
        Some(_) => {}
    }

    rx.stats.packets_accepted.fetch_add(1, Ordering::Relaxed);

    // The pre-filter may rewrite payload content in place but never its
    // size, so downstream framing sees the same cadence either way.
    let mut payload = packet.payload.to_vec();
    rx.filter.process(&mut payload);
    acc.extend_from_slice(&payload);
    Ok(())
}

async fn flush(rx: &MediaReceiver, acc: &mut Vec<u8>) -> Result<()> {
    let chunk = Bytes::from(std::mem::take(acc));
    rx.stats
        .bytes_forwarded
        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
    rx.stats.flushes.fetch_add(1, Ordering::Relaxed);
    rx.audio_tx
        .send(chunk)
        .await
        .map_err(|_| Error::ChannelClosed)
}
