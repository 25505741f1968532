//! Task scheduler.
//!
//! Tasks are futures spawned onto the evaluation's `LocalSet`; the
//! scheduler tracks one slot per task holding its status, eventual value,
//! and the effect history it accumulated. Everything runs on one thread,
//! so interleaving happens only where a task awaits.
//!
//! A task's effects are not visible while it runs: they sit in its slot
//! until the first `wait` drains them into the awaiting task. That keeps
//! the recorded history deterministic regardless of how sends and
//! receives interleave.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use spiral_core::ErrorCode;

use crate::effects::EffectRecord;
use crate::value::{TaskId, Value};

/// Where a task is in its lifecycle. Transitions are monotonic:
/// pending to ready or error, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Ready,
    Error,
}

struct TaskSlot {
    status: TaskStatus,
    value: Value,
    effects: Vec<EffectRecord>,
}

struct TaskEntry {
    slot: RefCell<TaskSlot>,
    done: Notify,
    abort: RefCell<Option<AbortHandle>>,
}

/// Per-run task table.
#[derive(Default)]
pub struct Scheduler {
    next: Cell<TaskId>,
    tasks: RefCell<HashMap<TaskId, Rc<TaskEntry>>>,
    any_done: Notify,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a task id with a pending slot.
    pub fn allocate(&self) -> TaskId {
        let id = self.next.get() + 1;
        self.next.set(id);
        self.tasks.borrow_mut().insert(
            id,
            Rc::new(TaskEntry {
                slot: RefCell::new(TaskSlot {
                    status: TaskStatus::Pending,
                    value: Value::Void,
                    effects: Vec::new(),
                }),
                done: Notify::new(),
                abort: RefCell::new(None),
            }),
        );
        tracing::trace!(target: "spiral::sched", task = id, "task allocated");
        id
    }

    /// Remember the spawned future's abort handle for cancellation.
    pub fn attach_abort(&self, id: TaskId, handle: AbortHandle) {
        if let Some(entry) = self.entry(id) {
            *entry.abort.borrow_mut() = Some(handle);
        }
    }

    /// Publish a task's result and recorded effects. A task that already
    /// resolved (a cancelled loser) keeps its first resolution.
    pub fn complete(&self, id: TaskId, value: Value, effects: Vec<EffectRecord>) {
        let Some(entry) = self.entry(id) else { return };
        {
            let mut slot = entry.slot.borrow_mut();
            if slot.status != TaskStatus::Pending {
                return;
            }
            slot.status = if value.is_error() {
                TaskStatus::Error
            } else {
                TaskStatus::Ready
            };
            slot.value = value;
            slot.effects = effects;
        }
        tracing::trace!(target: "spiral::sched", task = id, "task completed");
        entry.done.notify_waiters();
        self.any_done.notify_waiters();
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.entry(id).map(|e| e.slot.borrow().status)
    }

    /// The task's value if it resolved, without draining its effects.
    pub fn try_finished(&self, id: TaskId) -> Option<Value> {
        let entry = self.entry(id)?;
        let slot = entry.slot.borrow();
        match slot.status {
            TaskStatus::Pending => None,
            TaskStatus::Ready | TaskStatus::Error => Some(slot.value.clone()),
        }
    }

    /// Block the current task until `id` resolves; returns the value and
    /// drains the resolved task's effect history into the caller's hands.
    pub async fn wait(&self, id: TaskId) -> (Value, Vec<EffectRecord>) {
        let Some(entry) = self.entry(id) else {
            return (
                Value::error(ErrorCode::DomainError, format!("unknown task {}", id)),
                Vec::new(),
            );
        };
        loop {
            {
                let mut slot = entry.slot.borrow_mut();
                if slot.status != TaskStatus::Pending {
                    let effects = std::mem::take(&mut slot.effects);
                    return (slot.value.clone(), effects);
                }
            }
            entry.done.notified().await;
        }
    }

    /// Abort a pending task and poison its future.
    pub fn cancel(&self, id: TaskId) {
        let Some(entry) = self.entry(id) else { return };
        if let Some(handle) = entry.abort.borrow_mut().take() {
            handle.abort();
        }
        {
            let mut slot = entry.slot.borrow_mut();
            if slot.status != TaskStatus::Pending {
                return;
            }
            slot.status = TaskStatus::Error;
            slot.value = Value::error(ErrorCode::DomainError, "task cancelled");
        }
        tracing::trace!(target: "spiral::sched", task = id, "task cancelled");
        entry.done.notify_waiters();
        self.any_done.notify_waiters();
    }

    /// Wait until some task, any task, resolves.
    pub async fn wait_any(&self) {
        self.any_done.notified().await;
    }

    fn entry(&self, id: TaskId) -> Option<Rc<TaskEntry>> {
        self.tasks.borrow().get(&id).cloned()
    }
}
