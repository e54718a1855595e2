//! Concurrency-safe call registry.
//!
//! Backed by a sharded concurrent map: read-modify-write on one call key is
//! atomic (the entry lock serializes writers per key), different keys never
//! contend, and reads return cloned snapshots so status lookups never block
//! writers.

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::{CallKey, CallPhase, CallRecord, SwitchHandles};

/// The single authoritative map of active calls. Only this type may delete
/// a call record, and only from a terminal phase (or via a forced audit
/// reclaim).
pub struct CallRegistry {
    calls: DashMap<CallKey, CallRecord>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Create a record in `Initiated` for a newly signaled call.
    pub fn create(&self, call_key: CallKey, carrier_call_id: Option<String>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.calls.entry(call_key.clone()) {
            Entry::Occupied(_) => Err(Error::CallExists(call_key.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(CallRecord::new(call_key.clone(), carrier_call_id));
                info!(call_key = %call_key, "call record created");
                Ok(())
            }
        }
    }

    /// Snapshot of one record. Never blocks writers on other keys.
    pub fn get(&self, call_key: &CallKey) -> Option<CallRecord> {
        self.calls.get(call_key).map(|r| r.clone())
    }

    /// Snapshot of all records, for diagnostics.
    pub fn snapshot_all(&self) -> Vec<CallRecord> {
        self.calls.iter().map(|r| r.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn contains(&self, call_key: &CallKey) -> bool {
        self.calls.contains_key(call_key)
    }

    /// True when the record is missing or in a terminal phase — the orphan
    /// predicate used by port audits.
    pub fn is_absent_or_terminal(&self, call_key: &CallKey) -> bool {
        match self.calls.get(call_key) {
            None => true,
            Some(record) => record.phase.is_terminal(),
        }
    }

    /// Apply a guarded phase transition.
    pub fn transition(&self, call_key: &CallKey, to: CallPhase) -> Result<CallPhase> {
        let mut record = self
            .calls
            .get_mut(call_key)
            .ok_or_else(|| Error::CallNotFound(call_key.to_string()))?;
        let from = record.phase;
        if !from.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                call_key: call_key.to_string(),
                from,
                to,
            });
        }
        record.phase = to;
        debug!(call_key = %call_key, ?from, ?to, "call phase transition");
        Ok(to)
    }

    /// Switch acknowledged channel creation: `Initiated -> AwaitingMedia`.
    pub fn acknowledge_channel(&self, call_key: &CallKey) -> Result<()> {
        self.transition(call_key, CallPhase::AwaitingMedia)?;
        Ok(())
    }

    /// Record the leased RTP port. A record holds at most one port.
    pub fn set_port(&self, call_key: &CallKey, port: u16) -> Result<()> {
        let mut record = self
            .calls
            .get_mut(call_key)
            .ok_or_else(|| Error::CallNotFound(call_key.to_string()))?;
        match record.rtp_port {
            Some(held) if held != port => Err(Error::PortConflict {
                call_key: call_key.to_string(),
                held,
                requested: port,
            }),
            _ => {
                record.rtp_port = Some(port);
                Ok(())
            }
        }
    }

    /// Clear the port after the allocator has confirmed release.
    pub fn clear_port(&self, call_key: &CallKey) -> Result<Option<u16>> {
        let mut record = self
            .calls
            .get_mut(call_key)
            .ok_or_else(|| Error::CallNotFound(call_key.to_string()))?;
        Ok(record.rtp_port.take())
    }

    /// Update switch-side resource handles.
    pub fn update_handles<F>(&self, call_key: &CallKey, update: F) -> Result<()>
    where
        F: FnOnce(&mut SwitchHandles),
    {
        let mut record = self
            .calls
            .get_mut(call_key)
            .ok_or_else(|| Error::CallNotFound(call_key.to_string()))?;
        update(&mut record.handles);
        Ok(())
    }

    /// Media receiver confirms its transport is usable.
    ///
    /// The readiness flags are a two-writer join: receiver and sender each
    /// set their own flag in either order, and the registry — inside the
    /// same entry lock — computes the derived `MediaActive` transition once
    /// both are set. Neither writer attempts the transition itself.
    pub fn mark_inbound_ready(&self, call_key: &CallKey) -> Result<CallPhase> {
        self.mark_ready(call_key, |r| r.inbound_ready = true)
    }

    /// Media sender confirms its transport is usable.
    pub fn mark_outbound_ready(&self, call_key: &CallKey) -> Result<CallPhase> {
        self.mark_ready(call_key, |r| r.outbound_ready = true)
    }

    fn mark_ready<F>(&self, call_key: &CallKey, set_flag: F) -> Result<CallPhase>
    where
        F: FnOnce(&mut CallRecord),
    {
        let mut record = self
            .calls
            .get_mut(call_key)
            .ok_or_else(|| Error::CallNotFound(call_key.to_string()))?;
        set_flag(&mut *record);

        if record.inbound_ready
            && record.outbound_ready
            && record.phase == CallPhase::AwaitingMedia
        {
            record.phase = CallPhase::MediaActive;
            info!(call_key = %call_key, "both media paths ready, call active");
        }
        Ok(record.phase)
    }

    /// Enter `Terminating` from any live phase. Idempotent: returns
    /// `Ok(false)` when the call is already terminating, terminal, or
    /// absent, so duplicate hangup signals are harmless.
    pub fn begin_teardown(&self, call_key: &CallKey) -> Result<bool> {
        let Some(mut record) = self.calls.get_mut(call_key) else {
            return Ok(false);
        };
        match record.phase {
            CallPhase::Terminating | CallPhase::Closed | CallPhase::Failed => Ok(false),
            from => {
                record.phase = CallPhase::Terminating;
                debug!(call_key = %call_key, ?from, "call teardown started");
                Ok(true)
            }
        }
    }

    /// `Terminating -> Closed`, called once the port release and AI session
    /// close have both been confirmed.
    pub fn confirm_closed(&self, call_key: &CallKey) -> Result<()> {
        self.transition(call_key, CallPhase::Closed)?;
        Ok(())
    }

    /// Mark a call failed from any phase.
    pub fn mark_failed(&self, call_key: &CallKey) -> Result<()> {
        self.transition(call_key, CallPhase::Failed)?;
        Ok(())
    }

    /// Delete a record. Allowed only from a terminal phase.
    pub fn remove_terminal(&self, call_key: &CallKey) -> Result<CallRecord> {
        let removed = self.calls.remove_if(call_key, |_, record| {
            record.phase.is_terminal()
        });
        match removed {
            Some((_, record)) => {
                info!(call_key = %call_key, phase = ?record.phase, "call record deleted");
                Ok(record)
            }
            None => match self.get(call_key) {
                Some(record) => Err(Error::NotDeletable {
                    call_key: call_key.to_string(),
                    phase: record.phase,
                }),
                None => Err(Error::CallNotFound(call_key.to_string())),
            },
        }
    }

    /// Forced deletion used by the audit sweep: removes the record
    /// regardless of phase after its port lease was reclaimed. Logged
    /// loudly because it indicates a missed teardown.
    pub fn force_remove(&self, call_key: &CallKey) -> Option<CallRecord> {
        let removed = self.calls.remove(call_key).map(|(_, r)| r);
        if let Some(record) = &removed {
            warn!(call_key = %call_key, phase = ?record.phase, "call record force-removed by audit");
        }
        removed
    }
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
