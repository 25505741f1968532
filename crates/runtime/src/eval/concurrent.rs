//! Concurrent tier: tasks, futures, channels, select and race.
//!
//! Tasks are futures on the evaluation's `LocalSet`; suspension happens
//! only at the await points in this module (future await, send on a full
//! channel, receive on an empty channel, select, race). A spawned task
//! gets a child evaluation state: a snapshot of the spawning
//! environment, a fresh effect history, and the shared ref-cell heap.
//! Child effects surface in the awaiting task's history at the await
//! point, not at channel operations.

use spiral_core::{ChannelKind, ErrorCode};
use std::rc::Rc;
use tokio::time::{Duration, Instant};

use super::{Interp, TaskCtx, propagate};
use crate::channel::{Chan, DEFAULT_CAPACITY};
use crate::doc::Operand;
use crate::value::{TaskId, Value};

impl Interp {
    /// Child interpreter for a freshly allocated task.
    fn child(&self, id: TaskId) -> Interp {
        Interp {
            run: self.run.clone(),
            task: Rc::new(TaskCtx {
                id,
                env: std::cell::RefCell::new(self.env()),
                cells: self.task.cells.clone(),
                effects: std::cell::RefCell::new(Vec::new()),
            }),
        }
    }

    /// Schedule an operand as a task; its value resolves the returned id.
    pub(crate) fn spawn_operand(&self, operand: &Operand) -> TaskId {
        let id = self.run.sched.allocate();
        let child = self.child(id);
        let operand = operand.clone();
        let run = self.run.clone();
        let handle = tokio::task::spawn_local(async move {
            let value = child.resolve_operand(&operand).await;
            let effects = child.task.effects.take();
            run.sched.complete(id, value, effects);
        });
        self.run.sched.attach_abort(id, handle.abort_handle());
        id
    }

    /// Schedule a CFG task starting at `entry` with seeded locals
    /// (the `spawn` instruction and the `fork` terminator).
    pub(crate) fn spawn_cfg(
        &self,
        node_id: &str,
        entry: &str,
        locals: std::collections::HashMap<String, Value>,
    ) -> TaskId {
        let id = self.run.sched.allocate();
        let child = self.child(id);
        let node_id = node_id.to_string();
        let entry = entry.to_string();
        let run = self.run.clone();
        let handle = tokio::task::spawn_local(async move {
            let value = child.run_cfg(&node_id, &entry, locals).await;
            let effects = child.task.effects.take();
            run.sched.complete(id, value, effects);
        });
        self.run.sched.attach_abort(id, handle.abort_handle());
        id
    }

    /// Await a task: suspend until it resolves, splice its effect
    /// history into the current task's, and return its value.
    pub(crate) async fn wait_task(&self, id: TaskId) -> Value {
        let (value, effects) = self.run.sched.wait(id).await;
        self.task.effects.borrow_mut().extend(effects);
        value
    }

    pub(crate) fn eval_spawn(&self, body: &Operand) -> Value {
        let task = self.spawn_operand(body);
        Value::Future { task }
    }

    pub(crate) async fn eval_await(&self, future: &Operand) -> Value {
        let future = propagate!(self.resolve_operand(future).await);
        match future {
            Value::Future { task } | Value::Task { id: task, .. } => self.wait_task(task).await,
            other => Value::error(
                ErrorCode::TypeError,
                format!("await expects a future, got {}", other.type_name()),
            ),
        }
    }

    /// Run every branch as a task and collect results in input order.
    /// All branches run to completion; the first branch that errored
    /// supplies the result.
    pub(crate) async fn eval_par(&self, branches: &[Operand]) -> Value {
        let tasks: Vec<TaskId> = branches
            .iter()
            .map(|branch| self.spawn_operand(branch))
            .collect();
        let mut results = Vec::with_capacity(tasks.len());
        let mut first_error: Option<Value> = None;
        for task in tasks {
            let value = self.wait_task(task).await;
            if value.is_error() && first_error.is_none() {
                first_error = Some(value.clone());
            }
            results.push(value);
        }
        match first_error {
            Some(error) => error,
            None => Value::List(Rc::new(results)),
        }
    }

    pub(crate) fn eval_channel(&self, kind: ChannelKind, capacity: Option<usize>) -> Value {
        let id = self
            .run
            .channels
            .create(kind, capacity.unwrap_or(DEFAULT_CAPACITY));
        Value::Channel { id, kind }
    }

    pub(crate) async fn eval_send(&self, channel: &Operand, value: &Operand) -> Value {
        let chan = match self.channel_operand(channel).await {
            Ok(chan) => chan,
            Err(e) => return e,
        };
        let value = propagate!(self.resolve_operand(value).await);
        match chan.send(value).await {
            Ok(()) => Value::Void,
            Err(error) => error,
        }
    }

    pub(crate) async fn eval_recv(&self, channel: &Operand) -> Value {
        let chan = match self.channel_operand(channel).await {
            Ok(chan) => chan,
            Err(e) => return e,
        };
        chan.recv(self.task.id).await
    }

    /// First-ready among the given futures, optionally bounded by a
    /// timeout in milliseconds. The timeout elapsing yields index -1.
    pub(crate) async fn eval_select(&self, futures: &[Operand], timeout: Option<u64>) -> Value {
        let mut tasks = Vec::with_capacity(futures.len());
        for future in futures {
            let value = propagate!(self.resolve_operand(future).await);
            match value {
                Value::Future { task } | Value::Task { id: task, .. } => tasks.push(task),
                other => {
                    return Value::error(
                        ErrorCode::TypeError,
                        format!("select expects futures, got {}", other.type_name()),
                    );
                }
            }
        }
        if tasks.is_empty() && timeout.is_none() {
            return Value::error(
                ErrorCode::DomainError,
                "select over no futures and no timeout cannot resolve",
            );
        }
        let deadline = timeout.map(|ms| Instant::now() + Duration::from_millis(ms));
        loop {
            for (index, task) in tasks.iter().enumerate() {
                if let Some(value) = self.run.sched.try_finished(*task) {
                    return Value::SelectResult {
                        index: index as i64,
                        value: Box::new(value),
                    };
                }
            }
            match deadline {
                Some(deadline) => {
                    let timed_out =
                        tokio::time::timeout_at(deadline, self.run.sched.wait_any()).await;
                    if timed_out.is_err() {
                        return Value::SelectResult {
                            index: -1,
                            value: Box::new(Value::Void),
                        };
                    }
                }
                None => self.run.sched.wait_any().await,
            }
        }
    }

    /// First-finishing among the given tasks; losers are cancelled and
    /// their futures poisoned. The winner's value is the result.
    pub(crate) async fn eval_race(&self, operands: &[Operand]) -> Value {
        let mut tasks = Vec::with_capacity(operands.len());
        for operand in operands {
            let value = propagate!(self.resolve_operand(operand).await);
            match value {
                Value::Future { task } | Value::Task { id: task, .. } => tasks.push(task),
                other => {
                    return Value::error(
                        ErrorCode::TypeError,
                        format!("race expects tasks, got {}", other.type_name()),
                    );
                }
            }
        }
        if tasks.is_empty() {
            return Value::error(ErrorCode::DomainError, "race over no tasks cannot resolve");
        }
        loop {
            let winner = tasks
                .iter()
                .position(|task| self.run.sched.try_finished(*task).is_some());
            if let Some(winner) = winner {
                for (index, task) in tasks.iter().enumerate() {
                    if index != winner {
                        self.run.sched.cancel(*task);
                    }
                }
                // The winner already resolved, so this returns at once
                // and splices its effects.
                return self.wait_task(tasks[winner]).await;
            }
            self.run.sched.wait_any().await;
        }
    }

    async fn channel_operand(&self, operand: &Operand) -> Result<Rc<Chan>, Value> {
        let value = self.resolve_operand(operand).await;
        if value.is_error() {
            return Err(value);
        }
        let Value::Channel { id, .. } = value else {
            return Err(Value::error(
                ErrorCode::TypeError,
                format!("expected a channel, got {}", value.type_name()),
            ));
        };
        self.run.channels.get(id).ok_or_else(|| {
            Value::error(ErrorCode::DomainError, format!("unknown channel {}", id))
        })
    }
}
