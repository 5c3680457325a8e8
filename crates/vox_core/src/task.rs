//! Composable multi-tick task programs.
//!
//! A task is a node in a program tree: `Command` submits one unit command
//! and awaits its completion signal, `Sequence` runs children in order,
//! `Branch` evaluates a boolean expression once and runs exactly one of
//! two children, `Repeat` loops while its expression holds, and the flow
//! primitives `Break`/`Continue`/`Return` unwind to the nearest enclosing
//! `Repeat` or the procedure boundary.
//!
//! Every suspension - awaiting a command, an expression dependency, or a
//! client preprocessing round trip - is explicit node state, never a
//! blocked thread, so the whole engine is snapshot-able at tick
//! boundaries.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandStatus, TaskStateChange, Tick};
use crate::error::{Result, SimError};
use crate::expr::{self, EvalPoll, Expr, Fetch, QueryContext, Value};
use crate::world::VoxelId;

/// Ticks a client-side preprocessing request may stay unanswered
/// (about one minute at the reference tick rate).
pub const CLIENT_REQUEST_TIMEOUT: Tick = 1200;

/// How often, in ticks, the pending-request table is swept for timeouts.
/// Coarse on purpose: a late timeout is harmless, a per-tick sweep is not
/// free.
pub const PENDING_SWEEP_INTERVAL: Tick = 64;

/// Task identifier. Assigned by the engine on submission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TaskId(pub u64);

/// Memory namespace for a task tree's outputs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ScopeId(pub u64);

/// What a task node does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    /// Submit one command and await its completion signal.
    Command,
    /// Run children in order; the first non-completed terminal state
    /// propagates.
    Sequence,
    /// Evaluate a boolean expression once, then run exactly one child.
    Branch,
    /// Loop: evaluate the expression; while true, run the body.
    Repeat,
    /// Unwind to the nearest enclosing repeat, completing it.
    Break,
    /// Unwind to the nearest enclosing repeat, re-evaluating it.
    Continue,
    /// Unwind to the procedure boundary, completing the root.
    Return,
}

/// Lifecycle state of a task node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskState {
    /// Created, not yet run.
    #[default]
    Idle,
    /// Running or suspended.
    Active,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully.
    Failed,
    /// Aborted from outside.
    Terminated,
}

impl TaskState {
    /// Whether this state ends the node's lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

/// A task tree as built by the submitter (player UI or AI script).
///
/// The engine flattens it on submission and assigns identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Node kind.
    pub kind: TaskKind,
    /// Expression for `Branch`/`Repeat` nodes.
    pub expr: Option<Expr>,
    /// Command payload for `Command` nodes.
    pub command: Option<Command>,
    /// Whether the command needs client-side precomputation (for example
    /// a path search against locally cached world state) before the
    /// server accepts it.
    pub needs_preprocessing: bool,
    /// Number of declared output slots.
    pub outputs: u8,
    /// Child nodes.
    pub children: Vec<TaskInfo>,
}

impl TaskInfo {
    /// A command leaf.
    #[must_use]
    pub fn command(command: Command) -> Self {
        Self {
            kind: TaskKind::Command,
            expr: None,
            command: Some(command),
            needs_preprocessing: false,
            outputs: 0,
            children: Vec::new(),
        }
    }

    /// Mark the command as requiring client-side preprocessing.
    #[must_use]
    pub const fn preprocessed(mut self) -> Self {
        self.needs_preprocessing = true;
        self
    }

    /// Declare output slots on this node.
    #[must_use]
    pub const fn with_outputs(mut self, outputs: u8) -> Self {
        self.outputs = outputs;
        self
    }

    /// A sequence of children.
    #[must_use]
    pub fn sequence(children: Vec<Self>) -> Self {
        Self {
            kind: TaskKind::Sequence,
            expr: None,
            command: None,
            needs_preprocessing: false,
            outputs: 0,
            children,
        }
    }

    /// A two-way branch.
    #[must_use]
    pub fn branch(expr: Expr, then_child: Self, else_child: Self) -> Self {
        Self {
            kind: TaskKind::Branch,
            expr: Some(expr),
            command: None,
            needs_preprocessing: false,
            outputs: 0,
            children: vec![then_child, else_child],
        }
    }

    /// A repeat loop.
    #[must_use]
    pub fn repeat(expr: Expr, body: Self) -> Self {
        Self {
            kind: TaskKind::Repeat,
            expr: Some(expr),
            command: None,
            needs_preprocessing: false,
            outputs: 0,
            children: vec![body],
        }
    }

    /// A flow primitive with no payload.
    #[must_use]
    pub fn flow(kind: TaskKind) -> Self {
        Self {
            kind,
            expr: None,
            command: None,
            needs_preprocessing: false,
            outputs: 0,
            children: Vec::new(),
        }
    }
}

/// Scoped output memory.
///
/// Buffers are keyed strictly by `(scope, node)`, so concurrently active
/// sibling task instances can never observe each other's slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeMemory {
    slots: BTreeMap<(ScopeId, TaskId), Vec<Option<Value>>>,
}

impl ScopeMemory {
    /// Allocate a fresh buffer for a node entering its first run.
    pub fn alloc(&mut self, scope: ScopeId, node: TaskId, outputs: u8) {
        if outputs > 0 {
            self.slots
                .insert((scope, node), vec![None; outputs as usize]);
        }
    }

    /// Free a node's buffer. Idempotent.
    pub fn free(&mut self, scope: ScopeId, node: TaskId) {
        self.slots.remove(&(scope, node));
    }

    /// Publish a value into a slot. Ignored if the buffer or slot does
    /// not exist.
    pub fn write(&mut self, scope: ScopeId, node: TaskId, slot: u8, value: Value) {
        if let Some(buffer) = self.slots.get_mut(&(scope, node)) {
            if let Some(entry) = buffer.get_mut(slot as usize) {
                *entry = Some(value);
            }
        }
    }

    /// Read a published value.
    #[must_use]
    pub fn read(&self, scope: ScopeId, node: TaskId, slot: u8) -> Option<Value> {
        self.slots
            .get(&(scope, node))
            .and_then(|buffer| buffer.get(slot as usize).copied().flatten())
    }

    /// Number of live buffers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no buffers are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// A preprocessing request emitted to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// The task awaiting the response.
    pub task: TaskId,
    /// The raw command to preprocess.
    pub command: Command,
}

/// The client's answer to a [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    /// The task that requested preprocessing.
    pub task: TaskId,
    /// The preprocessed command, substituted into the task. A command
    /// marked failed fails the task.
    pub command: Command,
}

/// One outstanding preprocessing round trip. Exactly one per task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingClientRequest {
    /// The task awaiting the response.
    pub task: TaskId,
    /// Tick after which the request times out and the task fails.
    pub timeout_tick: Tick,
}

/// Events the engine surfaces to its embedder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskEvent {
    /// A task entered a new lifecycle state.
    StateChanged(TaskStateChange),
    /// A task needs client-side preprocessing.
    ClientRequest(ClientRequest),
}

/// Preprocessing progress of a command node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Preprocess {
    NotRequired,
    Unsent,
    Waiting,
    Resolved,
}

/// Flattened runtime node.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskNode {
    scope: ScopeId,
    kind: TaskKind,
    state: TaskState,
    expr: Option<Expr>,
    command: Option<Command>,
    preprocess: Preprocess,
    outputs: u8,
    children: Vec<TaskId>,
    /// Sequence progress.
    cursor: usize,
    /// Chosen child index for a branch.
    branch_taken: Option<usize>,
    /// Repeat phase: true while the body runs.
    in_body: bool,
    /// The node's expression is mid-evaluation; ticking it again polls
    /// the same evaluation. Starting a fresh one instead is a
    /// programming error.
    evaluating: bool,
    /// A submitted command awaits its completion signal.
    awaiting_command: bool,
}

/// How a node's advancement affected control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Suspended; tick again later.
    Pending,
    /// Reached a terminal state.
    Done(TaskState),
    /// Unwinding toward the nearest repeat (completing it).
    Break,
    /// Unwinding toward the nearest repeat (next iteration).
    Continue,
    /// Unwinding toward the procedure boundary.
    Return,
}

/// The task engine: schedules every submitted task tree across ticks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskEngine {
    nodes: BTreeMap<TaskId, TaskNode>,
    /// Root ids in submission order.
    roots: Vec<TaskId>,
    memory: ScopeMemory,
    pending: BTreeMap<TaskId, PendingClientRequest>,
    events: Vec<TaskEvent>,
    /// Commands ready for hand-off to unit controllers.
    submissions: Vec<Command>,
    next_id: u64,
    next_scope: u64,
}

impl TaskEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a task tree. Identifiers are assigned depth-first in
    /// preorder; the whole tree shares one fresh scope.
    pub fn submit_task(&mut self, info: TaskInfo) -> Result<TaskId> {
        Self::validate(&info)?;
        let scope = ScopeId(self.next_scope);
        self.next_scope += 1;
        let root = self.flatten(&info, scope);
        self.roots.push(root);
        Ok(root)
    }

    /// Externally override a task's state. Used for server-validated
    /// transitions and client-side termination.
    pub fn set_task_state(&mut self, id: TaskId, state: TaskState) -> Result<()> {
        let Some(node) = self.nodes.get(&id) else {
            return Err(SimError::InvalidState(format!("unknown task {}", id.0)));
        };
        if node.evaluating && state == TaskState::Active {
            return Err(SimError::InvalidState(format!(
                "task {} is mid-evaluation",
                id.0
            )));
        }
        if state == TaskState::Terminated {
            self.terminate_subtree(id);
        } else {
            self.transition(id, state);
        }
        Ok(())
    }

    /// Answer an outstanding preprocessing request.
    pub fn submit_response(&mut self, response: ClientResponse) -> Result<()> {
        if self.pending.remove(&response.task).is_none() {
            return Err(SimError::InvalidState(format!(
                "no outstanding request for task {}",
                response.task.0
            )));
        }
        if response.command.status.is_failure() {
            self.finish(response.task, TaskState::Failed);
            return Ok(());
        }
        if let Some(node) = self.nodes.get_mut(&response.task) {
            node.command = Some(response.command);
            node.preprocess = Preprocess::Resolved;
        }
        Ok(())
    }

    /// Resolve command tasks awaiting this unit's completion signal.
    ///
    /// Resolves the first (lowest-id) matching node only: a unit executes
    /// one command at a time, so at most one task is legitimately waiting.
    pub fn notify_command_complete(&mut self, unit: VoxelId, status: CommandStatus) {
        let matching = self.nodes.iter().find_map(|(id, node)| {
            let waiting = node.state == TaskState::Active
                && node.awaiting_command
                && node.command.as_ref().is_some_and(|c| c.unit == unit);
            waiting.then_some(*id)
        });
        let Some(id) = matching else {
            return;
        };
        {
            let node = self.nodes.get_mut(&id).expect("found above");
            node.awaiting_command = false;
            if let Some(command) = node.command.as_mut() {
                command.status = status;
            }
        }
        if status.is_failure() {
            self.finish(id, TaskState::Failed);
        } else {
            let (scope, outputs) = {
                let node = &self.nodes[&id];
                (node.scope, node.outputs)
            };
            if outputs > 0 {
                self.memory.write(scope, id, 0, Value::Bool(true));
            }
            self.finish(id, TaskState::Completed);
        }
    }

    /// Advance every task tree one tick.
    pub fn tick<Q: QueryContext>(&mut self, now: Tick, ctx: &Q) {
        if now % PENDING_SWEEP_INTERVAL == 0 {
            self.sweep_pending(now);
        }
        let roots = self.roots.clone();
        for root in roots {
            if !self
                .nodes
                .get(&root)
                .is_some_and(|n| !n.state.is_terminal())
            {
                continue;
            }
            match self.advance(root, now, ctx) {
                Flow::Pending | Flow::Done(_) => {}
                // Break/Continue with no enclosing repeat is flow-control
                // misuse; Return at the boundary completes the procedure.
                Flow::Break | Flow::Continue => self.fail_root_misuse(root),
                Flow::Return => {
                    if !self.nodes[&root].state.is_terminal() {
                        self.finish(root, TaskState::Completed);
                    }
                }
            }
        }
        self.prune_finished();
    }

    /// Drain surfaced events (state changes, client requests).
    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drain commands ready for unit submission.
    pub fn drain_submissions(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.submissions)
    }

    /// Current state of a live task.
    #[must_use]
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        self.nodes.get(&id).map(|n| n.state)
    }

    /// Number of outstanding preprocessing requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Read a published output slot.
    #[must_use]
    pub fn read_output(&self, scope: ScopeId, node: TaskId, slot: u8) -> Option<Value> {
        self.memory.read(scope, node, slot)
    }

    /// The scope a live task belongs to.
    #[must_use]
    pub fn task_scope(&self, id: TaskId) -> Option<ScopeId> {
        self.nodes.get(&id).map(|n| n.scope)
    }

    /// Number of live output buffers, for leak checks.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.memory.len()
    }

    // ------------------------------------------------------------------
    // Submission plumbing
    // ------------------------------------------------------------------

    fn validate(info: &TaskInfo) -> Result<()> {
        let ok = match info.kind {
            TaskKind::Command => info.command.is_some() && info.children.is_empty(),
            TaskKind::Sequence => !info.children.is_empty(),
            TaskKind::Branch => info.expr.is_some() && info.children.len() == 2,
            TaskKind::Repeat => info.expr.is_some() && info.children.len() == 1,
            TaskKind::Break | TaskKind::Continue | TaskKind::Return => {
                info.children.is_empty() && info.command.is_none()
            }
        };
        if !ok {
            return Err(SimError::InvalidState(format!(
                "malformed {:?} task node",
                info.kind
            )));
        }
        for child in &info.children {
            Self::validate(child)?;
        }
        Ok(())
    }

    fn flatten(&mut self, info: &TaskInfo, scope: ScopeId) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        let node = TaskNode {
            scope,
            kind: info.kind,
            state: TaskState::Idle,
            expr: info.expr.clone(),
            command: info.command.clone(),
            preprocess: if info.needs_preprocessing {
                Preprocess::Unsent
            } else {
                Preprocess::NotRequired
            },
            outputs: info.outputs,
            children: Vec::new(),
            cursor: 0,
            branch_taken: None,
            in_body: false,
            evaluating: false,
            awaiting_command: false,
        };
        self.nodes.insert(id, node);
        let children: Vec<TaskId> = info
            .children
            .iter()
            .map(|child| self.flatten(child, scope))
            .collect();
        self.nodes.get_mut(&id).expect("just inserted").children = children;
        id
    }

    // ------------------------------------------------------------------
    // Advancement
    // ------------------------------------------------------------------

    fn advance<Q: QueryContext>(&mut self, id: TaskId, now: Tick, ctx: &Q) -> Flow {
        let state = self.nodes[&id].state;
        match state {
            TaskState::Completed | TaskState::Failed | TaskState::Terminated => Flow::Done(state),
            TaskState::Idle => {
                self.activate(id);
                self.run(id, now, ctx)
            }
            TaskState::Active => self.run(id, now, ctx),
        }
    }

    fn activate(&mut self, id: TaskId) {
        let (scope, outputs) = {
            let node = &self.nodes[&id];
            (node.scope, node.outputs)
        };
        self.memory.alloc(scope, id, outputs);
        self.transition(id, TaskState::Active);
    }

    fn run<Q: QueryContext>(&mut self, id: TaskId, now: Tick, ctx: &Q) -> Flow {
        match self.nodes[&id].kind {
            TaskKind::Command => self.run_command(id, now, ctx),
            TaskKind::Sequence => self.run_sequence(id, now, ctx),
            TaskKind::Branch => self.run_branch(id, now, ctx),
            TaskKind::Repeat => self.run_repeat(id, now, ctx),
            TaskKind::Break => {
                self.finish(id, TaskState::Completed);
                Flow::Break
            }
            TaskKind::Continue => {
                self.finish(id, TaskState::Completed);
                Flow::Continue
            }
            TaskKind::Return => {
                self.finish(id, TaskState::Completed);
                Flow::Return
            }
        }
    }

    fn run_command<Q: QueryContext>(&mut self, id: TaskId, now: Tick, ctx: &Q) -> Flow {
        match self.nodes[&id].preprocess {
            Preprocess::Unsent => {
                let command = self.nodes[&id].command.clone().expect("validated");
                self.nodes.get_mut(&id).expect("exists").preprocess = Preprocess::Waiting;
                self.pending.insert(
                    id,
                    PendingClientRequest {
                        task: id,
                        timeout_tick: now + CLIENT_REQUEST_TIMEOUT,
                    },
                );
                self.events
                    .push(TaskEvent::ClientRequest(ClientRequest { task: id, command }));
                return Flow::Pending;
            }
            Preprocess::Waiting => return Flow::Pending,
            Preprocess::NotRequired | Preprocess::Resolved => {}
        }

        if self.nodes[&id].awaiting_command {
            return Flow::Pending;
        }

        let unit = self.nodes[&id].command.as_ref().expect("validated").unit;
        match ctx.unit_health(unit) {
            Fetch::Pending => Flow::Pending,
            Fetch::Ready(None) => {
                // The target is already gone: fail without submitting.
                if let Some(command) = self
                    .nodes
                    .get_mut(&id)
                    .and_then(|n| n.command.as_mut())
                {
                    command.status = CommandStatus::NoUnit;
                }
                self.finish(id, TaskState::Failed);
                Flow::Done(TaskState::Failed)
            }
            Fetch::Ready(Some(_)) => {
                let command = self.nodes[&id].command.clone().expect("validated");
                self.submissions.push(command);
                self.nodes.get_mut(&id).expect("exists").awaiting_command = true;
                Flow::Pending
            }
        }
    }

    fn run_sequence<Q: QueryContext>(&mut self, id: TaskId, now: Tick, ctx: &Q) -> Flow {
        loop {
            let (cursor, child) = {
                let node = &self.nodes[&id];
                let Some(&child) = node.children.get(node.cursor) else {
                    self.finish(id, TaskState::Completed);
                    return Flow::Done(TaskState::Completed);
                };
                (node.cursor, child)
            };
            match self.advance(child, now, ctx) {
                Flow::Pending => return Flow::Pending,
                Flow::Done(TaskState::Completed) => {
                    self.nodes.get_mut(&id).expect("exists").cursor = cursor + 1;
                }
                Flow::Done(state) => {
                    self.finish(id, state);
                    return Flow::Done(state);
                }
                // Flow primitives pass through; the sequence stays put and
                // is finalized by whatever catches the unwind.
                flow => return flow,
            }
        }
    }

    fn run_branch<Q: QueryContext>(&mut self, id: TaskId, now: Tick, ctx: &Q) -> Flow {
        if self.nodes[&id].branch_taken.is_none() {
            let expr = self.nodes[&id].expr.clone().expect("validated");
            match expr::poll(&expr, ctx, &self.memory) {
                EvalPoll::Pending => {
                    self.nodes.get_mut(&id).expect("exists").evaluating = true;
                    return Flow::Pending;
                }
                EvalPoll::Failed(_) => {
                    self.nodes.get_mut(&id).expect("exists").evaluating = false;
                    self.finish(id, TaskState::Failed);
                    return Flow::Done(TaskState::Failed);
                }
                EvalPoll::Ready(value) => {
                    self.nodes.get_mut(&id).expect("exists").evaluating = false;
                    let Some(condition) = value.as_bool() else {
                        self.finish(id, TaskState::Failed);
                        return Flow::Done(TaskState::Failed);
                    };
                    self.nodes.get_mut(&id).expect("exists").branch_taken =
                        Some(usize::from(!condition));
                }
            }
        }

        let chosen = {
            let node = &self.nodes[&id];
            node.children[node.branch_taken.expect("set above")]
        };
        match self.advance(chosen, now, ctx) {
            Flow::Pending => Flow::Pending,
            Flow::Done(state) => {
                self.finish(id, state);
                Flow::Done(state)
            }
            flow => flow,
        }
    }

    fn run_repeat<Q: QueryContext>(&mut self, id: TaskId, now: Tick, ctx: &Q) -> Flow {
        if self.nodes[&id].in_body {
            let body = self.nodes[&id].children[0];
            return match self.advance(body, now, ctx) {
                Flow::Pending => Flow::Pending,
                Flow::Done(TaskState::Completed) | Flow::Continue => {
                    // Next iteration re-evaluates on the next tick; an
                    // always-true expression with an instant body must not
                    // spin inside one tick.
                    self.nodes.get_mut(&id).expect("exists").in_body = false;
                    self.reset_subtree(body);
                    Flow::Pending
                }
                Flow::Done(state) => {
                    self.finish(id, state);
                    Flow::Done(state)
                }
                Flow::Break => {
                    self.finish(id, TaskState::Completed);
                    Flow::Done(TaskState::Completed)
                }
                Flow::Return => {
                    self.finish(id, TaskState::Completed);
                    Flow::Return
                }
            };
        }

        let expr = self.nodes[&id].expr.clone().expect("validated");
        match expr::poll(&expr, ctx, &self.memory) {
            EvalPoll::Pending => {
                self.nodes.get_mut(&id).expect("exists").evaluating = true;
                Flow::Pending
            }
            EvalPoll::Failed(_) => {
                self.nodes.get_mut(&id).expect("exists").evaluating = false;
                self.finish(id, TaskState::Failed);
                Flow::Done(TaskState::Failed)
            }
            EvalPoll::Ready(value) => {
                self.nodes.get_mut(&id).expect("exists").evaluating = false;
                match value.as_bool() {
                    None => {
                        self.finish(id, TaskState::Failed);
                        Flow::Done(TaskState::Failed)
                    }
                    Some(false) => {
                        self.finish(id, TaskState::Completed);
                        Flow::Done(TaskState::Completed)
                    }
                    Some(true) => {
                        self.nodes.get_mut(&id).expect("exists").in_body = true;
                        let body = self.nodes[&id].children[0];
                        match self.advance(body, now, ctx) {
                            Flow::Pending => Flow::Pending,
                            Flow::Done(TaskState::Completed) | Flow::Continue => {
                                self.nodes.get_mut(&id).expect("exists").in_body = false;
                                self.reset_subtree(body);
                                Flow::Pending
                            }
                            Flow::Done(state) => {
                                self.finish(id, state);
                                Flow::Done(state)
                            }
                            Flow::Break => {
                                self.finish(id, TaskState::Completed);
                                Flow::Done(TaskState::Completed)
                            }
                            Flow::Return => {
                                self.finish(id, TaskState::Completed);
                                Flow::Return
                            }
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Transitions and cleanup
    // ------------------------------------------------------------------

    /// Enter a new lifecycle state, emit the event, and free the output
    /// buffer the moment the node leaves `Active`.
    fn transition(&mut self, id: TaskId, state: TaskState) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.state == state {
            return;
        }
        let leaving_active = node.state == TaskState::Active;
        node.state = state;
        let scope = node.scope;
        if leaving_active && state != TaskState::Active {
            self.memory.free(scope, id);
        }
        self.events
            .push(TaskEvent::StateChanged(TaskStateChange { task: id, state }));
    }

    /// Terminal transition plus bookkeeping shared by every finish path.
    fn finish(&mut self, id: TaskId, state: TaskState) {
        self.pending.remove(&id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.awaiting_command = false;
            node.evaluating = false;
        }
        self.transition(id, state);
    }

    /// Flow-control misuse: a break/continue reached the procedure
    /// boundary with no enclosing repeat.
    fn fail_root_misuse(&mut self, root: TaskId) {
        if let Some(node) = self.nodes.get_mut(&root) {
            // The unwinding may already have completed the node (a bare
            // flow primitive as root); misuse overrides that verdict.
            if node.state == TaskState::Completed {
                node.state = TaskState::Active;
            }
        }
        self.finish(root, TaskState::Failed);
    }

    /// Terminate a node and every descendant.
    fn terminate_subtree(&mut self, id: TaskId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let children = node.children.clone();
        for child in children {
            self.terminate_subtree(child);
        }
        if !self.nodes[&id].state.is_terminal() {
            self.finish(id, TaskState::Terminated);
        }
    }

    /// Put a subtree back to idle for the next repeat iteration.
    fn reset_subtree(&mut self, id: TaskId) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let children = node.children.clone();
        for child in children {
            self.reset_subtree(child);
        }
        self.pending.remove(&id);
        let node = self.nodes.get_mut(&id).expect("exists");
        let scope = node.scope;
        node.cursor = 0;
        node.branch_taken = None;
        node.in_body = false;
        node.evaluating = false;
        node.awaiting_command = false;
        if node.preprocess != Preprocess::NotRequired {
            node.preprocess = Preprocess::Unsent;
        }
        if let Some(command) = node.command.as_mut() {
            command.status = CommandStatus::Pending;
        }
        if node.state != TaskState::Idle {
            node.state = TaskState::Idle;
            self.memory.free(scope, id);
            self.events.push(TaskEvent::StateChanged(TaskStateChange {
                task: id,
                state: TaskState::Idle,
            }));
        }
    }

    /// Sweep expired preprocessing requests: fail the task and evict the
    /// entry, exactly once per request.
    fn sweep_pending(&mut self, now: Tick) {
        let expired: Vec<TaskId> = self
            .pending
            .values()
            .filter(|request| request.timeout_tick <= now)
            .map(|request| request.task)
            .collect();
        for task in expired {
            tracing::debug!(task = task.0, "client request timed out");
            self.pending.remove(&task);
            self.finish(task, TaskState::Failed);
        }
    }

    /// Drop finished trees. Their memory was freed at transition time;
    /// this reclaims the node records themselves.
    fn prune_finished(&mut self) {
        let finished: Vec<TaskId> = self
            .roots
            .iter()
            .copied()
            .filter(|root| {
                self.nodes
                    .get(root)
                    .map_or(true, |node| node.state.is_terminal())
            })
            .collect();
        for root in finished {
            self.roots.retain(|r| *r != root);
            self.drop_subtree(root);
        }
    }

    fn drop_subtree(&mut self, id: TaskId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        self.memory.free(node.scope, id);
        self.pending.remove(&id);
        for child in node.children {
            self.drop_subtree(child);
        }
    }
}
