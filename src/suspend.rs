//! Suspend Register for Long-Polling Harvesters
//!
//! Turns "no new data yet" into an efficiently resumed long-poll: a
//! harvester that found nothing registers here and blocks; store mutations
//! signal the register, which wakes every waiter whose prefix/sets mask
//! intersects the change. Waking carries no payload; the caller re-runs
//! its select.
//!
//! Two modes:
//! - **Immediate** (default): every change signal wakes matching waiters
//!   synchronously.
//! - **Batch**: between `start_batch` and the outermost `stop_batch`
//!   (re-entrant), signals accumulate into a `prefix -> touched sets` map
//!   which is flushed through the same matching logic on exit, so a bulk
//!   load wakes each client once instead of once per record.
//!
//! The register is constructed with its store and torn down with it; it is
//! never a process-wide singleton, and waiters do not survive a restart.
//! The suspension handle is a oneshot channel: the transport layer awaits
//! `SuspendedRequest::resumed` and maps `ForcedResume` to its own retry or
//! abort policy. A disconnecting client must be `abort`ed so its slot is
//! freed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::stamp::Stamp;

/// Control-flow signal delivered to a suspended waiter that will not get
/// data: not a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedResume {
    /// A newer request arrived under the same client identifier
    Superseded,
    /// Evicted to keep the register under its capacity bound
    Evicted,
    /// The register itself was dropped
    RegisterClosed,
}

impl std::fmt::Display for ForcedResume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForcedResume::Superseded => {
                write!(f, "suspended request aborted by a newer request for the same client")
            }
            ForcedResume::Evicted => write!(f, "suspended connection has been forcefully resumed"),
            ForcedResume::RegisterClosed => write!(f, "suspend register closed"),
        }
    }
}

impl std::error::Error for ForcedResume {}

/// Handle held by a blocked caller until woken or force-resumed.
#[derive(Debug)]
pub struct SuspendedRequest {
    rx: oneshot::Receiver<Result<(), ForcedResume>>,
}

impl SuspendedRequest {
    /// Block until woken (`Ok`) or pre-empted (`Err`).
    pub async fn resumed(self) -> Result<(), ForcedResume> {
        self.rx.await.unwrap_or(Err(ForcedResume::RegisterClosed))
    }

    /// Non-blocking probe, for synchronous callers and tests.
    pub fn try_result(&mut self) -> Option<Result<(), ForcedResume>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ForcedResume::RegisterClosed)),
        }
    }
}

struct Waiter {
    prefix: String,
    sets: Vec<String>,
    tx: oneshot::Sender<Result<(), ForcedResume>>,
}

impl Waiter {
    /// An empty sets mask matches any set.
    fn matches(&self, prefix: &str, sets: &BTreeSet<String>) -> bool {
        self.prefix == prefix && (self.sets.is_empty() || self.sets.iter().any(|s| sets.contains(s)))
    }
}

#[derive(Default)]
struct RegisterState {
    waiters: HashMap<String, Waiter>,
    batch_depth: u32,
    newest_stamp: Stamp,
    stamp_at_batch_start: Stamp,
    pending: BTreeMap<String, BTreeSet<String>>,
}

pub struct SuspendRegister {
    max_suspended: usize,
    state: Mutex<RegisterState>,
}

impl SuspendRegister {
    pub fn new(max_suspended: usize) -> Self {
        SuspendRegister {
            max_suspended,
            state: Mutex::new(RegisterState::default()),
        }
    }

    /// Register a waiter after a select came back empty. Always suspends.
    pub fn suspend_after_no_result(
        &self,
        client_identifier: &str,
        prefix: &str,
        sets: &[String],
    ) -> SuspendedRequest {
        let mut state = self.state.lock();
        self.register_waiter(&mut state, client_identifier, prefix, sets)
    }

    /// Suspend before running a select when the cursor could be stale
    /// relative to an in-flight batch: the client already has everything
    /// up to the batch start, so anything newer is not yet guaranteed
    /// visible. Returns `None` when the select can proceed.
    pub fn suspend_before_select(
        &self,
        client_identifier: &str,
        continue_after: Stamp,
        prefix: &str,
        sets: &[String],
    ) -> Option<SuspendedRequest> {
        let mut state = self.state.lock();
        if state.batch_depth == 0 || continue_after < state.stamp_at_batch_start {
            return None;
        }
        Some(self.register_waiter(&mut state, client_identifier, prefix, sets))
    }

    /// Store change notification: wake matching waiters, or accumulate
    /// while a batch is active.
    pub fn signal_oai_update(
        &self,
        prefixes: &BTreeSet<String>,
        sets: &BTreeSet<String>,
        stamp: Stamp,
    ) {
        let mut state = self.state.lock();
        if stamp > state.newest_stamp {
            state.newest_stamp = stamp;
        }
        if state.batch_depth > 0 {
            for prefix in prefixes {
                state
                    .pending
                    .entry(prefix.clone())
                    .or_default()
                    .extend(sets.iter().cloned());
            }
            return;
        }
        for prefix in prefixes {
            wake_matching(&mut state.waiters, prefix, sets);
        }
    }

    /// Enter batch mode (re-entrant). `current_stamp` is the store's
    /// newest stamp, the staleness boundary for `suspend_before_select`.
    pub fn start_batch(&self, current_stamp: Stamp) {
        let mut state = self.state.lock();
        if current_stamp > state.newest_stamp {
            state.newest_stamp = current_stamp;
        }
        if state.batch_depth == 0 {
            state.stamp_at_batch_start = state.newest_stamp;
            state.pending.clear();
        }
        state.batch_depth += 1;
    }

    /// Leave batch mode; the outermost stop flushes accumulated changes.
    pub fn stop_batch(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.batch_depth > 0, "stop_batch without start_batch");
        state.batch_depth = state.batch_depth.saturating_sub(1);
        if state.batch_depth > 0 {
            return;
        }
        let pending = std::mem::take(&mut state.pending);
        debug!("flushing {} batched change signals", pending.len());
        for (prefix, sets) in pending {
            wake_matching(&mut state.waiters, &prefix, &sets);
        }
    }

    /// Drop a waiter whose client went away; nothing is delivered.
    pub fn abort(&self, client_identifier: &str) {
        self.state.lock().waiters.remove(client_identifier);
    }

    pub fn len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, client_identifier: &str) -> bool {
        self.state.lock().waiters.contains_key(client_identifier)
    }

    fn register_waiter(
        &self,
        state: &mut RegisterState,
        client_identifier: &str,
        prefix: &str,
        sets: &[String],
    ) -> SuspendedRequest {
        // Newest request wins: abort an outstanding waiter for this client.
        if let Some(previous) = state.waiters.remove(client_identifier) {
            let _ = previous.tx.send(Err(ForcedResume::Superseded));
        }
        if state.waiters.len() >= self.max_suspended {
            let victim = state
                .waiters
                .keys()
                .choose(&mut rand::thread_rng())
                .cloned();
            if let Some(victim) = victim {
                warn!(
                    "too many suspended connections in SuspendRegister, resuming {}",
                    victim
                );
                if let Some(evicted) = state.waiters.remove(&victim) {
                    let _ = evicted.tx.send(Err(ForcedResume::Evicted));
                }
            }
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(
            client_identifier.to_string(),
            Waiter {
                prefix: prefix.to_string(),
                sets: sets.to_vec(),
                tx,
            },
        );
        SuspendedRequest { rx }
    }
}

fn wake_matching(waiters: &mut HashMap<String, Waiter>, prefix: &str, sets: &BTreeSet<String>) {
    let matched: Vec<String> = waiters
        .iter()
        .filter(|(_, waiter)| waiter.matches(prefix, sets))
        .map(|(client, _)| client.clone())
        .collect();
    for client in matched {
        if let Some(waiter) = waiters.remove(&client) {
            let _ = waiter.tx.send(Ok(()));
        }
    }
}
