use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver};
use log::debug;
use parking_lot::Mutex;

use crate::task::{AsyncResult, CancelToken, Spawner, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Supersede,
    Suppress,
}

// Application-level identity of a guarded operation.
// `scope` names the UI element or window the operation belongs to, so two
// windows looking at the same blog never share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlightKey {
    scope: String,
    action: String,
}

impl FlightKey {
    pub fn new(scope: impl fmt::Display, action: impl Into<String>) -> Self {
        Self {
            scope: scope.to_string(),
            action: action.into(),
        }
    }

    pub fn load_more(scope: impl fmt::Display) -> Self {
        Self::new(scope, "load-more")
    }

    pub fn avatar(scope: impl fmt::Display, blog: &str, size: u32) -> Self {
        Self::new(scope, format!("avatar:{blog}:{size}"))
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn action(&self) -> &str {
        &self.action
    }
}

impl fmt::Display for FlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.action, self.scope)
    }
}

struct Flight {
    id: u64,
    cancel: CancelToken,
}

struct Inner {
    policy: Policy,
    flights: Mutex<HashMap<FlightKey, Flight>>,
    next_id: AtomicU64,
}

impl Inner {
    // Clears the entry for `key` if it still belongs to flight `id`, then
    // hands `deliver` whether the flight is still live. `deliver` runs under
    // the lock `submit` takes, so a successor cannot complete ahead of it.
    fn finish<R>(
        &self,
        key: &FlightKey,
        id: u64,
        cancel: &CancelToken,
        deliver: impl FnOnce(bool) -> R,
    ) -> R {
        let mut flights = self.flights.lock();
        if flights.get(key).map(|flight| flight.id) == Some(id) {
            flights.remove(key);
        }
        deliver(!cancel.is_cancelled())
    }
}

pub enum Submission {
    Started(FlightHandle),
    Suppressed,
    Rejected,
}

impl Submission {
    pub fn is_started(&self) -> bool {
        matches!(self, Submission::Started(_))
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, Submission::Suppressed)
    }

    pub fn handle(self) -> Option<FlightHandle> {
        match self {
            Submission::Started(handle) => Some(handle),
            _ => None,
        }
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Submission::Started(handle) => write!(f, "Started({})", handle.key),
            Submission::Suppressed => f.write_str("Suppressed"),
            Submission::Rejected => f.write_str("Rejected"),
        }
    }
}

pub struct FlightHandle {
    key: FlightKey,
    cancel: CancelToken,
    done: Receiver<AsyncResult<()>>,
}

impl FlightHandle {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // Blocks until the operation has finished and reports how it ended.
    // A flight whose task never ran (pool shut down) reads as cancelled.
    pub fn wait(self) -> AsyncResult<()> {
        self.done.recv().unwrap_or(AsyncResult::Cancelled)
    }
}

#[derive(Clone)]
pub struct SingleFlight {
    inner: Arc<Inner>,
}

impl SingleFlight {
    pub fn new(policy: Policy) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                flights: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    pub fn is_in_flight(&self, key: &FlightKey) -> bool {
        self.inner.flights.lock().contains_key(key)
    }

    pub fn cancel_scope(&self, scope: &str) -> usize {
        let mut flights = self.inner.flights.lock();
        let before = flights.len();
        flights.retain(|key, flight| {
            if key.scope == scope {
                flight.cancel.cancel();
                false
            } else {
                true
            }
        });
        before - flights.len()
    }

    // Runs `op` on the pool under `key`, handing its result to
    // `on_complete` unless the flight was cancelled first. `on_complete`
    // runs with the guard locked and must not submit to the same guard.
    pub fn submit<T, F, C>(
        &self,
        spawner: &Spawner,
        key: FlightKey,
        kind: TaskKind,
        op: F,
        on_complete: C,
    ) -> Submission
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> AsyncResult<T> + Send + 'static,
        C: FnOnce(AsyncResult<T>) + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancelToken::new();
        {
            let mut flights = self.inner.flights.lock();
            if let Some(previous) = flights.get(&key) {
                match self.inner.policy {
                    Policy::Suppress => {
                        debug!("singleflight: {key} already in flight, suppressing");
                        return Submission::Suppressed;
                    }
                    Policy::Supersede => {
                        debug!("singleflight: {key} superseding flight {}", previous.id);
                        previous.cancel.cancel();
                    }
                }
            }
            flights.insert(
                key.clone(),
                Flight {
                    id,
                    cancel: cancel.clone(),
                },
            );
        }

        let (done_tx, done_rx) = bounded(1);
        let inner = self.inner.clone();
        let token = cancel.clone();
        let task_key = key.clone();
        let spawned = spawner.spawn(kind, move || {
            let result = if token.is_cancelled() {
                AsyncResult::Cancelled
            } else {
                op(&token)
            };
            let outcome = inner.finish(&task_key, id, &token, |live| {
                if live && !result.is_cancelled() {
                    let outcome = result.outcome();
                    on_complete(result);
                    outcome
                } else {
                    debug!("singleflight: discarding result of cancelled {task_key}");
                    AsyncResult::Cancelled
                }
            });
            let _ = done_tx.send(outcome);
        });

        if !spawned {
            self.inner.finish(&key, id, &cancel, |_| ());
            return Submission::Rejected;
        }

        Submission::Started(FlightHandle {
            key,
            cancel,
            done: done_rx,
        })
    }
}
