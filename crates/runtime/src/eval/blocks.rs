//! Block/CFG tier.
//!
//! A block node executes as a loop over basic blocks: run the current
//! block's instructions in order, then follow the terminator. Locals
//! live in a per-execution map alongside the inherited environment. The
//! step counter advances once per block entry; instructions inside ride
//! on that bound together with the block size.
//!
//! The concurrent instructions (`spawn`, `channelOp`, `await`) and
//! terminators (`fork`, `join`, `suspend`) execute here too; `call`,
//! `effect`, and `assignRef` are declared by the format but unsupported
//! at every tier and abort with `DomainError`.

use spiral_core::{ErrorCode, Type};
use std::collections::HashMap;

use super::Interp;
use crate::doc::{Block, ChanOp, Expr, Instruction, Node, PhiSource, Terminator};
use crate::value::Value;

/// Outcome of one block: fall through to another block or finish with a
/// value.
enum Flow {
    Goto(String),
    Done(Value),
}

impl Interp {
    /// Entry point for a block node.
    pub(crate) async fn eval_cfg_node(&self, node: &Node) -> Value {
        let Some(entry) = node.entry.as_deref() else {
            return Value::error(
                ErrorCode::DomainError,
                format!("block node '{}' has no entry", node.id),
            );
        };
        self.run_cfg(&node.id, entry, HashMap::new()).await
    }

    /// Execute a node's CFG from `entry` with seeded locals. Forked and
    /// spawned branches re-enter here with their own seed.
    pub(crate) async fn run_cfg(
        &self,
        node_id: &str,
        entry: &str,
        mut locals: HashMap<String, Value>,
    ) -> Value {
        let Some(node) = self.node(node_id) else {
            return Value::error(
                ErrorCode::DomainError,
                format!("unknown node '{}'", node_id),
            );
        };
        let Some(blocks) = node.blocks.as_deref() else {
            return Value::error(
                ErrorCode::DomainError,
                format!("node '{}' has no blocks", node_id),
            );
        };
        let index: HashMap<&str, &Block> =
            blocks.iter().map(|b| (b.id.as_str(), b)).collect();
        let mut current = entry.to_string();
        let mut prev: Option<String> = None;
        loop {
            if let Err(e) = self.tick() {
                return e;
            }
            let Some(block) = index.get(current.as_str()) else {
                return Value::error(
                    ErrorCode::DomainError,
                    format!("node '{}': unknown block '{}'", node_id, current),
                );
            };
            for instruction in &block.instructions {
                if let Err(abort) = self
                    .exec_instruction(node_id, instruction, &mut locals, prev.as_deref())
                    .await
                {
                    return abort;
                }
            }
            match self.exec_terminator(node_id, &block.terminator, &mut locals).await {
                Ok(Flow::Goto(next)) => {
                    prev = Some(std::mem::replace(&mut current, next));
                }
                Ok(Flow::Done(value)) => return value,
                Err(abort) => return abort,
            }
        }
    }

    /// A local, or a cached node value. Block operands never reach the
    /// environment directly; `var` goes through `assign`.
    fn block_operand(&self, locals: &HashMap<String, Value>, name: &str) -> Option<Value> {
        locals
            .get(name)
            .cloned()
            .or_else(|| self.run.cache.borrow().get(name).cloned())
    }

    async fn exec_instruction(
        &self,
        node_id: &str,
        instruction: &Instruction,
        locals: &mut HashMap<String, Value>,
        prev: Option<&str>,
    ) -> Result<(), Value> {
        match instruction {
            Instruction::Assign { target, expr } => {
                let value = match expr {
                    Expr::Lit { .. } => self.eval_expr(expr).await,
                    Expr::Var { name } => match locals.get(name) {
                        Some(v) => v.clone(),
                        None => match self.task.env.borrow().lookup(name) {
                            Some(v) => v.clone(),
                            None => Value::error(
                                ErrorCode::UnboundIdentifier,
                                format!("unbound identifier '{}'", name),
                            ),
                        },
                    },
                    Expr::Ref { id } => self.eval_ref(id).await,
                    other => Value::error(
                        ErrorCode::DomainError,
                        format!(
                            "block assignment supports lit/var/ref, got '{}'",
                            other.kind_name()
                        ),
                    ),
                };
                if value.is_error() {
                    return Err(value);
                }
                locals.insert(target.clone(), value);
                Ok(())
            }
            Instruction::Op { target, ns, name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    match self.block_operand(locals, arg) {
                        Some(value) => {
                            if value.is_error() {
                                locals.insert(target.clone(), value.clone());
                                return Err(value);
                            }
                            values.push(value);
                        }
                        None => {
                            return Err(Value::error(
                                ErrorCode::DomainError,
                                format!("operand '{}' is not bound", arg),
                            ));
                        }
                    }
                }
                let result = self.dispatch_operator(ns, name, values).await;
                locals.insert(target.clone(), result.clone());
                if result.is_error() {
                    return Err(result);
                }
                Ok(())
            }
            Instruction::Phi { target, sources } => {
                match self.select_phi(sources, locals, prev) {
                    Some(value) => {
                        locals.insert(target.clone(), value);
                        Ok(())
                    }
                    None => Err(Value::error(
                        ErrorCode::DomainError,
                        format!("phi '{}' has no bound non-error source", target),
                    )),
                }
            }
            Instruction::Call {} | Instruction::Effect {} | Instruction::AssignRef {} => {
                Err(Value::error(
                    ErrorCode::DomainError,
                    "call/effect/assignRef instructions are not supported",
                ))
            }
            Instruction::Spawn { target, entry, args } => {
                let mut seed = HashMap::new();
                for arg in args {
                    match locals.get(arg) {
                        Some(value) => {
                            seed.insert(arg.clone(), value.clone());
                        }
                        None => {
                            return Err(Value::error(
                                ErrorCode::DomainError,
                                format!("spawn argument '{}' is not bound", arg),
                            ));
                        }
                    }
                }
                let task = self.spawn_cfg(node_id, entry, seed);
                locals.insert(target.clone(), Value::Future { task });
                Ok(())
            }
            Instruction::ChannelOp { op, channel, value, target } => {
                self.exec_channel_op(*op, channel, value.as_deref(), target.as_deref(), locals)
                    .await
            }
            Instruction::Await { target, future } => {
                let task = match locals.get(future) {
                    Some(Value::Future { task }) => *task,
                    Some(Value::Task { id, .. }) => *id,
                    Some(other) => {
                        return Err(Value::error(
                            ErrorCode::TypeError,
                            format!("await expects a future, got {}", other.type_name()),
                        ));
                    }
                    None => {
                        return Err(Value::error(
                            ErrorCode::DomainError,
                            format!("future '{}' is not bound", future),
                        ));
                    }
                };
                let value = self.wait_task(task).await;
                if value.is_error() {
                    return Err(value);
                }
                locals.insert(target.clone(), value);
                Ok(())
            }
        }
    }

    /// Pick a phi source: the one matching the block we arrived from
    /// when it is bound and non-error, otherwise the first bound
    /// non-error source.
    fn select_phi(
        &self,
        sources: &[PhiSource],
        locals: &HashMap<String, Value>,
        prev: Option<&str>,
    ) -> Option<Value> {
        let usable = |source: &PhiSource| {
            locals
                .get(&source.value)
                .filter(|value| !value.is_error())
                .cloned()
        };
        if let Some(prev) = prev {
            if let Some(value) = sources
                .iter()
                .filter(|s| s.block == prev)
                .find_map(&usable)
            {
                return Some(value);
            }
        }
        sources.iter().find_map(&usable)
    }

    async fn exec_channel_op(
        &self,
        op: ChanOp,
        channel: &str,
        value: Option<&str>,
        target: Option<&str>,
        locals: &mut HashMap<String, Value>,
    ) -> Result<(), Value> {
        let chan_id = match locals.get(channel) {
            Some(Value::Channel { id, .. }) => *id,
            Some(other) => {
                return Err(Value::error(
                    ErrorCode::TypeError,
                    format!("'{}' is not a channel, got {}", channel, other.type_name()),
                ));
            }
            None => {
                return Err(Value::error(
                    ErrorCode::DomainError,
                    format!("channel '{}' is not bound", channel),
                ));
            }
        };
        let Some(chan) = self.run.channels.get(chan_id) else {
            return Err(Value::error(
                ErrorCode::DomainError,
                format!("unknown channel {}", chan_id),
            ));
        };
        let payload = |locals: &HashMap<String, Value>| -> Result<Value, Value> {
            let name = value.ok_or_else(|| {
                Value::error(ErrorCode::DomainError, "send requires a value operand")
            })?;
            locals.get(name).cloned().ok_or_else(|| {
                Value::error(
                    ErrorCode::DomainError,
                    format!("send value '{}' is not bound", name),
                )
            })
        };
        match op {
            ChanOp::Send => {
                let value = payload(locals)?;
                chan.send(value).await?;
            }
            ChanOp::Recv => {
                let received = chan.recv(self.task.id).await;
                if let Some(target) = target {
                    locals.insert(target.to_string(), received);
                }
            }
            ChanOp::TrySend => {
                let value = payload(locals)?;
                let sent = chan.try_send(value)?;
                if let Some(target) = target {
                    locals.insert(target.to_string(), Value::Bool(sent));
                }
            }
            ChanOp::TryRecv => {
                let received = match chan.try_recv(self.task.id) {
                    Some(value) => Value::some(value),
                    None => Value::none(),
                };
                if let Some(target) = target {
                    locals.insert(target.to_string(), received);
                }
            }
        }
        Ok(())
    }

    async fn exec_terminator(
        &self,
        node_id: &str,
        terminator: &Terminator,
        locals: &mut HashMap<String, Value>,
    ) -> Result<Flow, Value> {
        match terminator {
            Terminator::Jump { to } => Ok(Flow::Goto(to.clone())),
            Terminator::Branch { cond, then, otherwise } => {
                match self.block_operand(locals, cond) {
                    Some(Value::Bool(true)) => Ok(Flow::Goto(then.clone())),
                    Some(Value::Bool(false)) => Ok(Flow::Goto(otherwise.clone())),
                    Some(other) => Err(Value::error(
                        ErrorCode::TypeError,
                        format!("branch condition must be bool, got {}", other.type_name()),
                    )),
                    None => Err(Value::error(
                        ErrorCode::DomainError,
                        format!("branch condition '{}' is not bound", cond),
                    )),
                }
            }
            Terminator::Return { value } => match value {
                Some(name) => {
                    let value = match locals.get(name) {
                        Some(value) => value.clone(),
                        None => self.resolve_id(name).await,
                    };
                    Ok(Flow::Done(value))
                }
                None => Ok(Flow::Done(Value::Void)),
            },
            // Exit codes are carried by the format but not acted on here.
            Terminator::Exit { .. } => Ok(Flow::Done(Value::Void)),
            Terminator::Fork { branches, continuation } => {
                for branch in branches {
                    let task = self.spawn_cfg(node_id, &branch.block, locals.clone());
                    if let Some(bind) = &branch.bind {
                        locals.insert(
                            bind.clone(),
                            Value::Task {
                                id: task,
                                returns: Type::Void,
                            },
                        );
                    }
                }
                Ok(Flow::Goto(continuation.clone()))
            }
            Terminator::Join { tasks, results, to } => {
                for (index, name) in tasks.iter().enumerate() {
                    let task = match locals.get(name) {
                        Some(Value::Future { task }) => *task,
                        Some(Value::Task { id, .. }) => *id,
                        Some(other) => {
                            return Err(Value::error(
                                ErrorCode::TypeError,
                                format!("join expects tasks, got {}", other.type_name()),
                            ));
                        }
                        None => {
                            return Err(Value::error(
                                ErrorCode::DomainError,
                                format!("join task '{}' is not bound", name),
                            ));
                        }
                    };
                    let value = self.wait_task(task).await;
                    if value.is_error() {
                        return Err(value);
                    }
                    if let Some(results) = results {
                        if let Some(result_name) = results.get(index) {
                            locals.insert(result_name.clone(), value);
                        }
                    }
                }
                Ok(Flow::Goto(to.clone()))
            }
            Terminator::Suspend { future, resume } => {
                let task = match locals.get(future) {
                    Some(Value::Future { task }) => *task,
                    Some(Value::Task { id, .. }) => *id,
                    Some(other) => {
                        return Err(Value::error(
                            ErrorCode::TypeError,
                            format!("suspend expects a future, got {}", other.type_name()),
                        ));
                    }
                    None => {
                        return Err(Value::error(
                            ErrorCode::DomainError,
                            format!("suspend future '{}' is not bound", future),
                        ));
                    }
                };
                let value = self.wait_task(task).await;
                if value.is_error() {
                    return Err(value);
                }
                // The resolved value replaces the future under its name.
                locals.insert(future.clone(), value);
                Ok(Flow::Goto(resume.clone()))
            }
        }
    }
}
