//! The reversible stepper: evaluation state, breakpoint set, and the
//! Continue/Next/Step/StepOut/Restart control surface, in both directions.
//!
//! The core reduces every stepping op to one primitive — advance to the
//! next `StopNode` in depth-first evaluation order, descending into
//! resolvable user-defined calls — filtered by an op-specific frame-depth
//! predicate. A bounded history of full cursor-stack snapshots makes
//! reverse stepping an exact inverse of forward stepping rather than a
//! best-effort replay.

use std::collections::VecDeque;

use crate::ast::{Kind, Node, NodeRef};
use crate::Error;

const HISTORY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeLevel {
    Builtin,
    Module,
    Args,
    Block,
}

#[derive(Debug, Clone)]
pub struct ScopeObject {
    pub name: String,
    pub kind: Kind,
    /// The declaration or bind site this object traces back to, if any.
    pub node: Option<NodeRef>,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub level: ScopeLevel,
    pub objects: Vec<ScopeObject>,
}

impl Scope {
    fn new(level: ScopeLevel) -> Self {
        Self {
            level,
            objects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Entry,
    Step,
    Breakpoint,
    Exception,
    Pause,
    Restart,
}

#[derive(Debug, Clone)]
pub struct State {
    pub scope: Scope,
    pub stop_reason: StopReason,
    pub at_node: NodeRef,
    /// Call-frame depth of the frame holding `at_node`, the quantity every
    /// step-mode predicate is evaluated against.
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub node: NodeRef,
    pub index: usize,
    pub source_defined: bool,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub node: NodeRef,
    pub name: String,
}

#[derive(Debug, Clone)]
struct FrameCursor {
    function: NodeRef,
    block: NodeRef,
    stmt_index: usize,
    args_scope: Scope,
    block_scope: Scope,
}

impl FrameCursor {
    fn new(function: NodeRef, block: NodeRef) -> Self {
        let args_scope = function
            .as_function()
            .map(|f| {
                let mut scope = Scope::new(ScopeLevel::Args);
                scope.objects = f
                    .params
                    .iter()
                    .map(|p| ScopeObject {
                        name: p.name.clone(),
                        kind: p.kind.clone(),
                        node: None,
                    })
                    .collect();
                scope
            })
            .unwrap_or_else(|| Scope::new(ScopeLevel::Args));
        Self {
            function,
            block,
            stmt_index: 0,
            args_scope,
            block_scope: Scope::new(ScopeLevel::Block),
        }
    }

    fn frame(&self) -> Frame {
        let name = self
            .function
            .as_function()
            .and_then(|f| f.name.as_ref())
            .and_then(|n| n.as_ident())
            .map(|i| i.name.clone())
            .unwrap_or_default();
        Frame {
            node: self.function.clone(),
            name,
        }
    }
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    cursor: Vec<FrameCursor>,
    state: State,
}

pub struct Debugger {
    module: NodeRef,
    breakpoints: Vec<Breakpoint>,
    next_index: usize,
    cursor: Option<Vec<FrameCursor>>,
    history: VecDeque<HistoryEntry>,
    current_state: Option<State>,
    terminated: bool,
}

impl Debugger {
    pub fn new(module: NodeRef) -> Self {
        Self {
            module,
            breakpoints: Vec::new(),
            next_index: 0,
            cursor: None,
            history: VecDeque::new(),
            current_state: None,
            terminated: false,
        }
    }

    pub fn get_state(&self) -> Result<State, Error> {
        self.current_state.clone().ok_or(Error::Terminated)
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn create_breakpoint(&mut self, node: NodeRef) -> Result<Breakpoint, Error> {
        if !node.is_stop_node() {
            return Err(Error::InvalidArgument(
                "breakpoint target is not a stop node".into(),
            ));
        }
        let pos = node.position();
        if self.breakpoints.iter().any(|b| b.node.position() == pos) {
            return Err(Error::Conflict("duplicate breakpoint at position".into()));
        }
        let source_defined = node
            .as_call()
            .map(|c| c.name() == "breakpoint")
            .unwrap_or(false);
        self.next_index += 1;
        let bp = Breakpoint {
            node,
            index: self.next_index,
            source_defined,
        };
        self.breakpoints.push(bp.clone());
        log::debug!("installed breakpoint #{} at {}", bp.index, bp.node.position());
        Ok(bp)
    }

    pub fn clear_breakpoint(&mut self, node: &NodeRef) -> Result<(), Error> {
        let idx = self
            .breakpoints
            .iter()
            .position(|b| b.node.position() == node.position())
            .ok_or_else(|| Error::NotFound("no breakpoint at that position".into()))?;
        if self.breakpoints[idx].source_defined {
            return Err(Error::Conflict(
                "source-defined breakpoints cannot be cleared".into(),
            ));
        }
        self.breakpoints.remove(idx);
        Ok(())
    }

    pub fn restart(&mut self) -> Result<State, Error> {
        let entry = self
            .entry_function()
            .ok_or_else(|| Error::NotFound("module has no functions".into()))?;
        let body = entry
            .as_function()
            .expect("entry_function always returns a Function node")
            .body
            .clone();
        self.cursor = Some(vec![FrameCursor::new(entry.clone(), body)]);
        self.history.clear();
        self.terminated = false;
        let subject = entry.subject().unwrap_or_else(|| entry.clone());
        let state = State {
            scope: Scope::new(ScopeLevel::Args),
            stop_reason: StopReason::Restart,
            at_node: subject,
            depth: 1,
        };
        self.current_state = Some(state.clone());
        log::info!("debugger restarted at entry function");
        Ok(state)
    }

    fn entry_function(&self) -> Option<NodeRef> {
        let decls = &self.module.as_module()?.decls;
        decls
            .iter()
            .find(|d| {
                d.as_function()
                    .and_then(|f| f.name.as_ref())
                    .and_then(|n| n.as_ident())
                    .map(|i| i.name == "default")
                    .unwrap_or(false)
            })
            .or_else(|| decls.iter().find(|d| d.as_function().is_some()))
            .cloned()
    }

    pub fn continue_(&mut self, dir: Direction) -> Result<State, Error> {
        self.run(dir, StopReason::Breakpoint, true, |_| false)
    }

    pub fn next(&mut self, dir: Direction) -> Result<State, Error> {
        let start_depth = self.current_call_depth();
        self.run(dir, StopReason::Step, false, move |d| d <= start_depth)
    }

    pub fn step(&mut self, dir: Direction) -> Result<State, Error> {
        self.run(dir, StopReason::Step, false, |_| true)
    }

    pub fn step_out(&mut self, dir: Direction) -> Result<State, Error> {
        let start_depth = self.current_call_depth();
        self.run(dir, StopReason::Step, false, move |d| d < start_depth)
    }

    pub fn terminate(&mut self) {
        self.cursor = None;
        self.current_state = None;
        self.terminated = true;
        log::info!("debugger terminated");
    }

    pub fn backtrace(&self) -> Vec<Frame> {
        self.cursor
            .as_ref()
            .map(|stack| stack.iter().map(FrameCursor::frame).collect())
            .unwrap_or_default()
    }

    /// Scope entries visible at `level` for the current stop. `Args`
    /// returns the innermost frame's parameters plus any effect bindings
    /// introduced so far in its block.
    pub fn scope_at(&self, level: ScopeLevel) -> Vec<ScopeObject> {
        match level {
            ScopeLevel::Builtin => Vec::new(),
            ScopeLevel::Module => self
                .module
                .as_module()
                .map(|m| {
                    m.decls
                        .iter()
                        .filter_map(|d| d.as_function())
                        .filter_map(|f| f.name.as_ref())
                        .filter_map(|n| n.as_ident())
                        .map(|i| ScopeObject {
                            name: i.name.clone(),
                            kind: Kind::Fs,
                            node: None,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            ScopeLevel::Args | ScopeLevel::Block => self
                .cursor
                .as_ref()
                .and_then(|s| s.last())
                .map(|f| {
                    let mut objs = f.args_scope.objects.clone();
                    objs.extend(f.block_scope.objects.clone());
                    objs
                })
                .unwrap_or_default(),
        }
    }

    /// The frame depth the step predicates compare against: the depth
    /// recorded on the currently reported state, which is the depth of the
    /// call site rather than of any callee frame already pushed for it.
    fn current_call_depth(&self) -> usize {
        self.current_state
            .as_ref()
            .map(|s| s.depth)
            .unwrap_or_else(|| self.cursor.as_ref().map(|c| c.len()).unwrap_or(0))
    }

    fn is_source_defined(&self, node: &NodeRef) -> bool {
        node.as_call().map(|c| c.name() == "breakpoint").unwrap_or(false)
    }

    fn matches_installed_breakpoint(&self, node: &NodeRef) -> bool {
        let pos = node.position();
        self.breakpoints.iter().any(|b| b.node.position() == pos)
    }

    fn run<F>(
        &mut self,
        dir: Direction,
        reason: StopReason,
        honor_breakpoints: bool,
        predicate: F,
    ) -> Result<State, Error>
    where
        F: Fn(usize) -> bool,
    {
        if self.terminated {
            return Err(Error::Terminated);
        }
        match dir {
            Direction::Forward => self.advance(reason, honor_breakpoints, predicate),
            Direction::Backward => self.retreat(reason, honor_breakpoints, predicate),
        }
    }

    /// Advance through one or more primitive stops until `predicate` (or a
    /// forced breakpoint stop) accepts one. Every primitive stop along the
    /// way — including ones skipped over — is pushed to history paired with
    /// the state that was current immediately before it, so that reverse
    /// stepping can walk back through exactly the same granularity later,
    /// regardless of which op (`Next`, `StepOut`, ...) produced the skips.
    fn advance<F>(&mut self, reason: StopReason, honor_breakpoints: bool, predicate: F) -> Result<State, Error>
    where
        F: Fn(usize) -> bool,
    {
        let mut pending_state = self.current_state.clone();
        loop {
            let cursor_before = self.cursor.clone();
            match self.primitive_advance() {
                None => {
                    self.terminated = true;
                    self.current_state = None;
                    return Err(Error::Terminated);
                }
                Some((node, depth)) => {
                    if let (Some(state), Some(cursor)) = (pending_state.clone(), cursor_before) {
                        self.push_history(cursor, state);
                    }
                    let forced = self.is_source_defined(&node)
                        || (honor_breakpoints && self.matches_installed_breakpoint(&node));
                    if forced || predicate(depth) {
                        let state = State {
                            scope: self.current_scope_snapshot(),
                            stop_reason: reason,
                            at_node: node,
                            depth,
                        };
                        self.current_state = Some(state.clone());
                        return Ok(state);
                    }
                    pending_state = Some(State {
                        scope: self.current_scope_snapshot(),
                        stop_reason: StopReason::Step,
                        at_node: node,
                        depth,
                    });
                }
            }
        }
    }

    /// Mirror of `advance`: pop history entries (each already the exact
    /// state to revert to) until one satisfies `predicate` or a forced
    /// breakpoint stop, or history is exhausted.
    fn retreat<F>(&mut self, reason: StopReason, honor_breakpoints: bool, predicate: F) -> Result<State, Error>
    where
        F: Fn(usize) -> bool,
    {
        loop {
            let entry = self
                .history
                .pop_back()
                .ok_or_else(|| Error::NotFound("no further history".into()))?;
            let forced = self.is_source_defined(&entry.state.at_node)
                || (honor_breakpoints && self.matches_installed_breakpoint(&entry.state.at_node));
            if forced || predicate(entry.state.depth) {
                self.cursor = Some(entry.cursor);
                let mut state = entry.state;
                state.stop_reason = reason;
                self.current_state = Some(state.clone());
                return Ok(state);
            }
        }
    }

    fn current_scope_snapshot(&self) -> Scope {
        self.cursor
            .as_ref()
            .and_then(|s| s.last())
            .map(|f| {
                let mut scope = Scope::new(ScopeLevel::Block);
                scope.objects = f.args_scope.objects.clone();
                scope.objects.extend(f.block_scope.objects.clone());
                scope
            })
            .unwrap_or_else(|| Scope::new(ScopeLevel::Block))
    }

    fn push_history(&mut self, cursor: Vec<FrameCursor>, state: State) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(HistoryEntry { cursor, state });
    }

    /// One step of the underlying depth-first evaluation: consumes the next
    /// statement in the innermost active frame, descending into resolvable
    /// user-defined calls, and returns the `StopNode` reached together with
    /// the frame depth *before* any resulting push — the depth step-mode
    /// predicates are evaluated against.
    fn primitive_advance(&mut self) -> Option<(NodeRef, usize)> {
        loop {
            let stack = self.cursor.as_mut()?;
            if stack.is_empty() {
                self.cursor = None;
                return None;
            }
            let top_idx = stack.len() - 1;
            let stmt = stack[top_idx]
                .block
                .as_block()
                .expect("frame block is always Node::Block")
                .stmts
                .get(stack[top_idx].stmt_index)
                .cloned();
            let stmt = match stmt {
                Some(s) => s,
                None => {
                    stack.pop();
                    if stack.is_empty() {
                        self.cursor = None;
                        return None;
                    }
                    continue;
                }
            };
            stack[top_idx].stmt_index += 1;
            if let Node::Call(call) = &*stmt {
                let depth = stack.len();
                bind_effects(&mut stack[top_idx].block_scope, call);
                if call.module.is_none() {
                    if let Some(callee) = resolve_function(&self.module, call.name()) {
                        let body = callee
                            .as_function()
                            .expect("resolve_function always returns a Function node")
                            .body
                            .clone();
                        stack.push(FrameCursor::new(callee, body));
                    }
                }
                return Some((stmt.clone(), depth));
            }
        }
    }

}

fn resolve_function(module: &NodeRef, name: &str) -> Option<NodeRef> {
    module.as_module()?.decls.iter().find_map(|d| {
        let f = d.as_function()?;
        let ident = f.name.as_ref()?.as_ident()?;
        (ident.name == name).then(|| d.clone())
    })
}

fn bind_effects(scope: &mut Scope, call: &crate::ast::Call) {
    let names = match &call.as_bind {
        Some(names) => names,
        None => return,
    };
    let signature = call.signature();
    for (i, name) in names.iter().enumerate() {
        let kind = signature
            .as_ref()
            .and_then(|s| s.get(i))
            .cloned()
            .unwrap_or(Kind::Fs);
        scope.objects.push(ScopeObject {
            name: name.clone(),
            kind,
            node: None,
        });
    }
}
