//! Fixed-range UDP port pool.
//!
//! One exclusive port per active call. Acquisition is atomic: a port is
//! either on the free queue or present in the lease table, never both.
//! Release is idempotent so duplicate teardown signals from the switch are
//! harmless. The pool never inspects call state itself; `audit` and
//! `reclaim` take a predicate supplied by the owner of the call registry.

use std::collections::VecDeque;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One (port, call-key) binding.
#[derive(Debug, Clone)]
pub struct PortLease {
    pub port: u16,
    pub call_key: String,
    pub allocated_at: Instant,
}

/// Pool occupancy counters for the diagnostic surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub free: usize,
    pub leased: usize,
}

/// Fixed contiguous range of UDP ports, leased one per call.
pub struct PortPool {
    size: usize,
    /// Ports currently available. Short critical section only; lease state
    /// lives in the per-port table.
    free: Mutex<VecDeque<u16>>,
    leases: DashMap<u16, PortLease>,
}

impl PortPool {
    /// Create a pool covering `[first_port, first_port + size)`.
    ///
    /// The range must be non-empty and must fit inside the 16-bit port
    /// space; a range that would run past 65535 is a configuration error,
    /// not something to truncate silently.
    pub fn new(first_port: u16, size: u16) -> Result<Self> {
        if size == 0 || u32::from(first_port) + u32::from(size) - 1 > u32::from(u16::MAX) {
            return Err(Error::InvalidPortRange { first_port, size });
        }
        let free = (0..size).map(|i| first_port + i).collect();
        Ok(Self {
            size: size as usize,
            free: Mutex::new(free),
            leases: DashMap::new(),
        })
    }

    /// Lease one port for `call_key`.
    ///
    /// Fails with [`Error::PoolExhausted`] when no port is free; the caller
    /// must reject the call rather than wait.
    pub fn acquire(&self, call_key: &str) -> Result<u16> {
        let port = {
            let mut free = self.free.lock();
            free.pop_front()
        };

        let port = port.ok_or(Error::PoolExhausted {
            size: self.size,
            leased: self.leases.len(),
        })?;

        self.leases.insert(
            port,
            PortLease {
                port,
                call_key: call_key.to_string(),
                allocated_at: Instant::now(),
            },
        );
        debug!(port, call_key, "leased RTP port");
        Ok(port)
    }

    /// Release a port held by `call_key`.
    ///
    /// Releasing a port that is already free is a no-op: duplicate teardown
    /// signals must not corrupt the free count. Releasing a port held by a
    /// different call fails with [`Error::PortNotOwned`] and leaves the
    /// lease intact.
    pub fn release(&self, port: u16, call_key: &str) -> Result<()> {
        let removed = self
            .leases
            .remove_if(&port, |_, lease| lease.call_key == call_key);

        match removed {
            Some(_) => {
                self.free.lock().push_back(port);
                debug!(port, call_key, "released RTP port");
                Ok(())
            }
            None if self.leases.contains_key(&port) => Err(Error::PortNotOwned {
                port,
                call_key: call_key.to_string(),
            }),
            None => {
                debug!(port, call_key, "release of already-free port ignored");
                Ok(())
            }
        }
    }

    /// Report leases whose call is gone, without mutating state.
    ///
    /// `is_orphaned` is queried with each lease's call key; it should
    /// return true when the call record is absent or in a terminal phase.
    pub fn audit<F>(&self, is_orphaned: F) -> Vec<PortLease>
    where
        F: Fn(&str) -> bool,
    {
        self.leases
            .iter()
            .filter(|entry| is_orphaned(&entry.call_key))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Audit and, when `auto_release` is set, force-release every orphaned
    /// lease. Returns the orphans found either way; the two-step design
    /// lets sweeps report continuously without acting on false positives.
    pub fn reclaim<F>(&self, auto_release: bool, is_orphaned: F) -> Vec<PortLease>
    where
        F: Fn(&str) -> bool,
    {
        let orphans = self.audit(is_orphaned);
        if !auto_release {
            return orphans;
        }

        for lease in &orphans {
            // Whoever removes the lease returns the port to the free queue;
            // a concurrent legitimate release cannot double-free it.
            if self.leases.remove(&lease.port).is_some() {
                self.free.lock().push_back(lease.port);
                warn!(
                    port = lease.port,
                    call_key = %lease.call_key,
                    held_secs = lease.allocated_at.elapsed().as_secs(),
                    "force-released orphaned port lease"
                );
            }
        }
        if !orphans.is_empty() {
            info!(count = orphans.len(), "orphaned port reclaim complete");
        }
        orphans
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn leased_count(&self) -> usize {
        self.leases.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            free: self.free_count(),
            leased: self.leased_count(),
        }
    }
}
