//! Channel store.
//!
//! Channels are bounded FIFO queues identified by id in a per-run store;
//! a channel value carries only the id, so duplicating the value shares
//! the channel. Send blocks while the buffer is full, receive blocks
//! while it is empty and open. A closed channel rejects sends and lets
//! receivers drain the buffer before yielding void.
//!
//! Blocking is cooperative: operations loop over a state check and an
//! await on a `Notify`. Evaluation is single-threaded, so no other task
//! can run between the check and the first poll of the notified future,
//! which is what makes the check-then-wait sequence lossless.
//!
//! The four declared kinds share this implementation; `broadcast`
//! additionally fans each send out to every attached receiver. Receivers
//! of a broadcast channel attach a private tap on their first receive;
//! a send with no attached taps buffers into the base queue, which the
//! first attaching receiver inherits.

use indexmap::IndexMap;
use spiral_core::{ChannelKind, ErrorCode};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tokio::sync::Notify;

use crate::value::{ChannelId, TaskId, Value};

/// Buffer size used when a `channel` expression gives no capacity.
pub const DEFAULT_CAPACITY: usize = 16;

struct ChanState {
    queue: VecDeque<Value>,
    closed: bool,
    /// Per-receiver queues, broadcast channels only.
    taps: IndexMap<TaskId, VecDeque<Value>>,
}

/// One channel: bounded queue plus wakeup bells for each direction.
pub struct Chan {
    pub kind: ChannelKind,
    pub capacity: usize,
    state: RefCell<ChanState>,
    not_full: Notify,
    not_empty: Notify,
}

impl Chan {
    fn new(kind: ChannelKind, capacity: usize) -> Self {
        Chan {
            kind,
            // A zero-capacity buffer could never accept a send; clamp.
            capacity: capacity.max(1),
            state: RefCell::new(ChanState {
                queue: VecDeque::new(),
                closed: false,
                taps: IndexMap::new(),
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
        }
    }

    /// Push a value, waiting for space. Errors once the channel is closed.
    pub async fn send(&self, value: Value) -> Result<(), Value> {
        loop {
            {
                let mut state = self.state.borrow_mut();
                if state.closed {
                    return Err(Value::error(
                        ErrorCode::DomainError,
                        "send on closed channel",
                    ));
                }
                if self.kind == ChannelKind::Broadcast && !state.taps.is_empty() {
                    if state.taps.values().all(|tap| tap.len() < self.capacity) {
                        for tap in state.taps.values_mut() {
                            tap.push_back(value.clone());
                        }
                        drop(state);
                        self.not_empty.notify_waiters();
                        return Ok(());
                    }
                } else if state.queue.len() < self.capacity {
                    state.queue.push_back(value);
                    drop(state);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Pop the head, waiting while the channel is empty and open. Yields
    /// void once the channel is closed and drained.
    pub async fn recv(&self, task: TaskId) -> Value {
        loop {
            {
                let mut state = self.state.borrow_mut();
                let popped = self.pop(&mut state, task);
                if let Some(value) = popped {
                    drop(state);
                    self.not_full.notify_waiters();
                    return value;
                }
                if state.closed {
                    return Value::Void;
                }
            }
            self.not_empty.notified().await;
        }
    }

    /// Non-blocking send. `Ok(false)` when the buffer is full.
    pub fn try_send(&self, value: Value) -> Result<bool, Value> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(Value::error(
                ErrorCode::DomainError,
                "send on closed channel",
            ));
        }
        if self.kind == ChannelKind::Broadcast && !state.taps.is_empty() {
            if state.taps.values().any(|tap| tap.len() >= self.capacity) {
                return Ok(false);
            }
            for tap in state.taps.values_mut() {
                tap.push_back(value.clone());
            }
        } else {
            if state.queue.len() >= self.capacity {
                return Ok(false);
            }
            state.queue.push_back(value);
        }
        drop(state);
        self.not_empty.notify_waiters();
        Ok(true)
    }

    /// Non-blocking receive. `None` while empty and open; void once
    /// closed and drained.
    pub fn try_recv(&self, task: TaskId) -> Option<Value> {
        let mut state = self.state.borrow_mut();
        if let Some(value) = self.pop(&mut state, task) {
            drop(state);
            self.not_full.notify_waiters();
            return Some(value);
        }
        if state.closed { Some(Value::Void) } else { None }
    }

    /// Reject further sends; buffered values remain receivable.
    pub fn close(&self) {
        self.state.borrow_mut().closed = true;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Buffered item count, taps included.
    pub fn size(&self) -> usize {
        let state = self.state.borrow();
        state.queue.len() + state.taps.values().map(VecDeque::len).sum::<usize>()
    }

    fn pop(&self, state: &mut ChanState, task: TaskId) -> Option<Value> {
        if self.kind == ChannelKind::Broadcast {
            if !state.taps.contains_key(&task) {
                // First receive attaches the tap; it inherits whatever the
                // base queue buffered before any receiver existed.
                let inherited = std::mem::take(&mut state.queue);
                state.taps.insert(task, inherited);
            }
            state.taps.get_mut(&task).and_then(VecDeque::pop_front)
        } else {
            state.queue.pop_front()
        }
    }
}

/// Per-run collection of channels.
#[derive(Default)]
pub struct ChannelStore {
    next: Cell<ChannelId>,
    chans: RefCell<HashMap<ChannelId, Rc<Chan>>>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a channel, returning its id.
    pub fn create(&self, kind: ChannelKind, capacity: usize) -> ChannelId {
        let id = self.next.get() + 1;
        self.next.set(id);
        self.chans
            .borrow_mut()
            .insert(id, Rc::new(Chan::new(kind, capacity)));
        tracing::trace!(target: "spiral::channel", id, %kind, capacity, "channel created");
        id
    }

    pub fn get(&self, id: ChannelId) -> Option<Rc<Chan>> {
        self.chans.borrow().get(&id).cloned()
    }
}
