//! Call registry
//!
//! Single owner of every [`CallRecord`]. Call ids come from a process-wide
//! counter and are never reused. All reads copy records out, so the lock is
//! never held by a caller across an `.await`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tracing::debug;

use crate::admission::policy;
use crate::error::{CallManagerError, CallManagerResult};
use crate::types::{CallId, CallRecord, CallState};

/// Table of live calls keyed by [`CallId`]
#[derive(Debug)]
pub struct CallRegistry {
    calls: RwLock<HashMap<CallId, CallRecord>>,
    next_id: AtomicU32,
    total_created: AtomicUsize,
    total_removed: AtomicUsize,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordering class used to pick the foreground call
fn foreground_rank(state: CallState) -> Option<u8> {
    match state {
        CallState::Active => Some(0),
        CallState::Alerting | CallState::Dialing => Some(1),
        CallState::Incoming | CallState::Waiting => Some(2),
        CallState::Holding => Some(3),
        CallState::Idle | CallState::Disconnecting | CallState::Disconnected => None,
    }
}

/// Foreground call among `calls`
///
/// Active first, then connecting, ringing and holding; lowest id wins
/// within a class.
pub fn foreground_of<'a>(calls: impl IntoIterator<Item = &'a CallRecord>) -> Option<&'a CallRecord> {
    calls
        .into_iter()
        .filter_map(|call| foreground_rank(call.state).map(|rank| (rank, call)))
        .min_by_key(|(rank, call)| (*rank, call.call_id))
        .map(|(_, call)| call)
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            total_created: AtomicUsize::new(0),
            total_removed: AtomicUsize::new(0),
        }
    }

    /// Reserve a fresh call id
    pub fn allocate_id(&self) -> CallId {
        CallId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Register a call
    pub fn insert(&self, record: CallRecord) -> CallManagerResult<()> {
        let mut calls = self.calls.write();
        if calls.contains_key(&record.call_id) {
            return Err(CallManagerError::internal(format!(
                "call {} is already registered",
                record.call_id
            )));
        }
        debug!("registered call {} ({}, {})", record.call_id, record.call_type, record.state);
        calls.insert(record.call_id, record);
        self.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, call_id: CallId) -> Option<CallRecord> {
        self.calls.read().get(&call_id).cloned()
    }

    /// Like [`get`](Self::get) but fails with `CallNotFound`
    pub fn require(&self, call_id: CallId) -> CallManagerResult<CallRecord> {
        self.get(call_id)
            .ok_or(CallManagerError::CallNotFound { call_id })
    }

    /// Set a call's state, returning the previous one
    pub fn update_state(&self, call_id: CallId, state: CallState) -> CallManagerResult<CallState> {
        self.update_with(call_id, |call| std::mem::replace(&mut call.state, state))
    }

    /// Apply `f` to a call under the write lock
    pub fn update_with<R>(
        &self,
        call_id: CallId,
        f: impl FnOnce(&mut CallRecord) -> R,
    ) -> CallManagerResult<R> {
        let mut calls = self.calls.write();
        let call = calls
            .get_mut(&call_id)
            .ok_or(CallManagerError::CallNotFound { call_id })?;
        Ok(f(call))
    }

    pub fn remove(&self, call_id: CallId) -> Option<CallRecord> {
        let removed = self.calls.write().remove(&call_id);
        if removed.is_some() {
            self.total_removed.fetch_add(1, Ordering::Relaxed);
            debug!("unregistered call {}", call_id);
        }
        removed
    }

    /// Copy of every call, ordered by id
    pub fn snapshot(&self) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self.calls.read().values().cloned().collect();
        calls.sort_by_key(|call| call.call_id);
        calls
    }

    pub fn find_by_state(&self, state: CallState) -> Vec<CallRecord> {
        let mut calls: Vec<CallRecord> = self
            .calls
            .read()
            .values()
            .filter(|call| call.state == state)
            .cloned()
            .collect();
        calls.sort_by_key(|call| call.call_id);
        calls
    }

    pub fn count_by_state(&self, state: CallState) -> usize {
        self.calls.read().values().filter(|call| call.state == state).count()
    }

    /// Calls that are neither idle nor on their way out
    pub fn live_count(&self) -> usize {
        self.calls
            .read()
            .values()
            .filter(|call| !call.state.is_terminal())
            .count()
    }

    pub fn len(&self) -> usize {
        self.calls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.read().is_empty()
    }

    pub fn contains(&self, call_id: CallId) -> bool {
        self.calls.read().contains_key(&call_id)
    }

    pub fn foreground(&self) -> Option<CallRecord> {
        let calls = self.calls.read();
        foreground_of(calls.values()).cloned()
    }

    pub fn has_active_call(&self) -> bool {
        policy::has_active_call(self.calls.read().values())
    }

    pub fn has_dialing_call(&self) -> bool {
        policy::has_dialing_call(self.calls.read().values())
    }

    pub fn has_connecting_call(&self) -> bool {
        policy::has_connecting_call(self.calls.read().values())
    }

    pub fn has_activated_call(&self) -> bool {
        policy::has_activated_call(self.calls.read().values())
    }

    pub fn has_ringing_call(&self) -> bool {
        policy::has_ringing_call(self.calls.read().values())
    }

    pub fn has_emergency_call(&self) -> bool {
        policy::has_emergency_call(self.calls.read().values())
    }

    /// (created, removed) since construction
    pub fn stats(&self) -> (usize, usize) {
        (
            self.total_created.load(Ordering::Relaxed),
            self.total_removed.load(Ordering::Relaxed),
        )
    }
}
