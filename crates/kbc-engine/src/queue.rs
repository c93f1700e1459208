//! The pending-request FIFO and the per-request completion gate.
//!
//! The queue mutex/condvar pair is the engine's central rendezvous: the
//! processor thread sleeps on it between requests, and submitters, the
//! interrupt path and power requests all signal it. It is deliberately a
//! different lock from the command-byte mutex so a driver waiting to mutate
//! the configuration byte never contends with queue admission.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::power::PowerState;
use crate::request::Request;

/// Everything guarded by the queue mutex.
pub(crate) struct QueueState {
    /// Requests awaiting the bus, in submission order.
    pub(crate) pending: VecDeque<Request>,
    /// Whether the processor is currently executing a request. At most one
    /// request is ever active.
    pub(crate) active: bool,
    /// Current engine power state; `Sleep` rejects new submissions.
    pub(crate) power: PowerState,
    /// A requested transition the processor has not applied yet.
    pub(crate) pending_power: Option<PowerState>,
    pub(crate) shutdown: bool,
}

impl QueueState {
    pub(crate) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            active: false,
            power: PowerState::Normal,
            pending_power: None,
            shutdown: false,
        }
    }
}

/// Parks one blocking submitter until its specific request completes.
///
/// Only the submitter ever waits here; the processor thread posts the
/// finished request and moves on.
pub(crate) struct CompletionGate {
    slot: Mutex<Option<Request>>,
    ready: Condvar,
}

impl CompletionGate {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, request: Request) {
        *self.slot.lock().unwrap() = Some(request);
        self.ready.notify_one();
    }

    pub(crate) fn wait(&self) -> Request {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(request) = slot.take() {
                return request;
            }
            slot = self.ready.wait(slot).unwrap();
        }
    }
}
