//! The protocol session: DAP request dispatch, capability negotiation,
//! handle tables, and source/breakpoint translation.
//!
//! A session owns one outbound queue and three handle tables (sources,
//! variables, frames are addressed by stack index rather than a table).
//! Each request is processed synchronously against the debugger, which
//! serializes its own state behind a mutex; the ordering guarantee spec
//! requires — a handler's response precedes any `stopped`/`terminated`
//! event it triggers — falls out of enqueueing the response before running
//! the op that produces the event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use serde_json::{json, Value};

use crate::ast::NodeRef;
use crate::debugger::{Debugger, Direction, ScopeLevel, ScopeObject, StopReason};
use crate::linespec::{self, Cursor, ModuleTable};
use crate::position::SourceRegistry;
use crate::walk::find;
use crate::Error;

/// One outbound protocol message (response or event), already shaped as
/// the JSON value the server shell will frame and write.
#[derive(Debug, Clone)]
pub struct OutMessage(pub Value);

/// A monotone `handle -> T` map starting at 1000, with a secondary
/// `alias -> handle` map so the same logical value (e.g. a filename) never
/// yields two handles within one session.
struct HandleTable<T> {
    next: i64,
    values: HashMap<i64, T>,
    aliases: HashMap<String, i64>,
}

impl<T: Clone> HandleTable<T> {
    fn new() -> Self {
        Self {
            next: 1000,
            values: HashMap::new(),
            aliases: HashMap::new(),
        }
    }

    fn insert(&mut self, value: T) -> i64 {
        let handle = self.next;
        self.next += 1;
        self.values.insert(handle, value);
        handle
    }

    fn insert_aliased(&mut self, alias: &str, value: T) -> i64 {
        if let Some(&handle) = self.aliases.get(alias) {
            return handle;
        }
        let handle = self.insert(value);
        self.aliases.insert(alias.to_string(), handle);
        handle
    }

    fn get(&self, handle: i64) -> Option<&T> {
        self.values.get(&handle)
    }
}

/// Everything the session needs to translate a DAP `source` object into a
/// known buffer, and back.
struct Sessionized<T> {
    table: Mutex<HandleTable<T>>,
}

impl<T: Clone> Sessionized<T> {
    fn new() -> Self {
        Self {
            table: Mutex::new(HandleTable::new()),
        }
    }
}

/// A cheap, thread-safe handle for emitting events onto a session's
/// outbound queue without touching any of the session's `Rc`-based tree
/// state — the server shell's output tee runs on its own thread and holds
/// one of these rather than the `Session` itself, which is not `Send`.
#[derive(Clone)]
pub struct OutputSink {
    out_tx: mpsc::Sender<OutMessage>,
    seq: Arc<AtomicI64>,
}

impl OutputSink {
    pub fn emit(&self, event: &str, body: Option<Value>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let _ = self.out_tx.send(OutMessage(event_message(seq, event, body)));
    }
}

fn event_message(seq: i64, event: &str, body: Option<Value>) -> Value {
    json!({
        "seq": seq,
        "type": "event",
        "event": event,
        "body": body,
    })
}

/// A single DAP session: one client connection, one debugger instance, one
/// module table, one source registry.
pub struct Session {
    out_tx: mpsc::Sender<OutMessage>,
    seq: Arc<AtomicI64>,
    debugger: Mutex<Debugger>,
    module_table: ModuleTable,
    registry: Arc<SourceRegistry>,
    sources: Sessionized<String>,
    variables: Sessionized<Vec<ScopeObject>>,
    client_supports_variable_type: AtomicBool,
    client_supports_progress: AtomicBool,
    initialized: AtomicBool,
}

impl Session {
    pub fn new(
        out_tx: mpsc::Sender<OutMessage>,
        module_table: ModuleTable,
        registry: Arc<SourceRegistry>,
    ) -> Self {
        let entry_module = module_table
            .default_module()
            .cloned()
            .expect("a session requires at least one loaded module");
        Self {
            out_tx,
            seq: Arc::new(AtomicI64::new(1)),
            debugger: Mutex::new(Debugger::new(entry_module)),
            module_table,
            registry,
            sources: Sessionized::new(),
            variables: Sessionized::new(),
            client_supports_variable_type: AtomicBool::new(false),
            client_supports_progress: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    /// A cross-thread handle for emitting events without sharing the
    /// session itself.
    pub fn output_sink(&self) -> OutputSink {
        OutputSink {
            out_tx: self.out_tx.clone(),
            seq: self.seq.clone(),
        }
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn send(&self, message: Value) {
        // The read loop never enqueues; only handlers do, so this never
        // contends with the reader for the channel itself. A closed
        // receiver means the send thread has already shut down, which is
        // only possible once the session is terminating.
        let _ = self.out_tx.send(OutMessage(message));
    }

    fn response(
        &self,
        request_seq: i64,
        command: &str,
        success: bool,
        body: Option<Value>,
        message: Option<String>,
    ) -> Value {
        json!({
            "seq": self.next_seq(),
            "type": "response",
            "request_seq": request_seq,
            "success": success,
            "command": command,
            "body": body,
            "message": message,
        })
    }

    fn event(&self, event: &str, body: Option<Value>) -> Value {
        event_message(self.next_seq(), event, body)
    }

    fn send_ok(&self, request_seq: i64, command: &str, body: Option<Value>) {
        self.send(self.response(request_seq, command, true, body, None));
    }

    fn send_err(&self, request_seq: i64, command: &str, err: &Error) {
        self.send(self.response(request_seq, command, false, None, Some(err.dap_message())));
    }

    fn capabilities() -> Value {
        json!({
            "supportsConfigurationDoneRequest": true,
            "supportsStepBack": true,
            "supportsRestartRequest": true,
            "supportsLoadedSourcesRequest": true,
            "supportsTerminateRequest": true,
            "supportsBreakpointLocationsRequest": true,
        })
    }

    /// Dispatch one inbound request. `initialize` must be first; every
    /// other verb is rejected with `Unsupported` until it has responded.
    pub fn handle_request(&self, request_seq: i64, command: &str, arguments: Option<Value>) {
        log::debug!("dispatch {} (seq={})", command, request_seq);
        if command != "initialize" && !self.initialized.load(Ordering::SeqCst) {
            self.send_err(
                request_seq,
                command,
                &Error::InvalidArgument("initialize must be the first request".into()),
            );
            return;
        }
        match command {
            "initialize" => self.handle_initialize(request_seq, arguments),
            "launch" | "attach" => self.send_ok(request_seq, command, None),
            "setBreakpoints" => self.handle_set_breakpoints(request_seq, arguments),
            "setExceptionBreakpoints" => self.send_ok(request_seq, command, None),
            "setFunctionBreakpoints" | "setDataBreakpoints" | "setInstructionBreakpoints" => {
                self.send_err(
                    request_seq,
                    command,
                    &Error::Unsupported(format!("{} is not supported", command)),
                )
            }
            "configurationDone" => self.handle_configuration_done(request_seq),
            "continue" => self.handle_step(request_seq, command, Direction::Forward, StepKind::Continue),
            "next" => self.handle_step(request_seq, command, Direction::Forward, StepKind::Next),
            "stepIn" => self.handle_step(request_seq, command, Direction::Forward, StepKind::Step),
            "stepOut" => self.handle_step(request_seq, command, Direction::Forward, StepKind::StepOut),
            "stepBack" => self.handle_step(request_seq, command, Direction::Backward, StepKind::Step),
            "reverseContinue" => {
                self.handle_step(request_seq, command, Direction::Backward, StepKind::Continue)
            }
            "restart" => self.handle_restart(request_seq),
            "stackTrace" => self.handle_stack_trace(request_seq, arguments),
            "scopes" => self.handle_scopes(request_seq, arguments),
            "variables" => self.handle_variables(request_seq, arguments),
            "source" => self.handle_source(request_seq, arguments),
            "threads" => self.send_ok(
                request_seq,
                command,
                Some(json!({"threads": [{"id": 1, "name": "main"}]})),
            ),
            "loadedSources" => self.handle_loaded_sources(request_seq),
            "breakpointLocations" => self.handle_breakpoint_locations(request_seq, arguments),
            "evaluate" => self.handle_evaluate(request_seq, arguments),
            "terminate" | "disconnect" => self.handle_terminate(request_seq, command),
            other => self.send_err(
                request_seq,
                command,
                &Error::Unsupported(format!("unrecognized request: {}", other)),
            ),
        }
    }

    fn handle_initialize(&self, request_seq: i64, arguments: Option<Value>) {
        let supports_variable_type = arguments
            .as_ref()
            .and_then(|a| a.get("supportsVariableType"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let supports_progress = arguments
            .as_ref()
            .and_then(|a| a.get("supportsProgressReporting"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.client_supports_variable_type
            .store(supports_variable_type, Ordering::SeqCst);
        self.client_supports_progress
            .store(supports_progress, Ordering::SeqCst);
        self.send_ok(request_seq, "initialize", Some(Self::capabilities()));
        self.send(self.event("initialized", None));
        self.initialized.store(true, Ordering::SeqCst);
    }

    fn handle_set_breakpoints(&self, request_seq: i64, arguments: Option<Value>) {
        let arguments = match arguments {
            Some(a) => a,
            None => {
                return self.send_err(
                    request_seq,
                    "setBreakpoints",
                    &Error::InvalidArgument("missing arguments".into()),
                )
            }
        };
        let path = arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let path = match path {
            Some(p) => p,
            None => {
                return self.send_err(
                    request_seq,
                    "setBreakpoints",
                    &Error::InvalidArgument("source.path is required".into()),
                )
            }
        };
        let module = match self.module_table.get(&path) {
            Some(m) => m.clone(),
            None => return self.send_err(request_seq, "setBreakpoints", &Error::NotFound(path)),
        };
        let requested: Vec<Value> = arguments
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut dbg = self.debugger.lock().unwrap();
        let stale: Vec<NodeRef> = dbg
            .breakpoints()
            .iter()
            .filter(|b| !b.source_defined && b.node.position().filename == path)
            .map(|b| b.node.clone())
            .collect();
        for node in stale {
            // source-defined breakpoints never reach here (filtered above);
            // clearing a plain installed one cannot fail.
            let _ = dbg.clear_breakpoint(&node);
        }

        let mut results = Vec::with_capacity(requested.len());
        for spec in &requested {
            let line = spec.get("line").and_then(Value::as_u64).unwrap_or(0) as usize;
            let column = spec.get("column").and_then(Value::as_u64).unwrap_or(0) as usize;
            match find(&module, line, column, |n| n.is_stop_node()) {
                None => results.push(json!({
                    "verified": false,
                    "message": format!("no stop-node at {}:{}", line, column),
                })),
                Some(node) => match dbg.create_breakpoint(node.clone()) {
                    Ok(bp) => {
                        let pos = bp.node.position();
                        results.push(json!({
                            "verified": true,
                            "line": pos.line,
                            "column": pos.column,
                        }));
                    }
                    Err(err) => results.push(json!({
                        "verified": false,
                        "message": err.dap_message(),
                    })),
                },
            }
        }
        drop(dbg);
        self.send_ok(
            request_seq,
            "setBreakpoints",
            Some(json!({ "breakpoints": results })),
        );
    }

    fn handle_configuration_done(&self, request_seq: i64) {
        self.send_ok(request_seq, "configurationDone", None);
        let state = self.debugger.lock().unwrap().restart();
        match state {
            Ok(_) => self.send(self.event("stopped", Some(stopped_body("entry", 1)))),
            Err(err) => self.send_err(request_seq, "configurationDone", &err),
        }
    }

    fn handle_step(&self, request_seq: i64, command: &str, dir: Direction, kind: StepKind) {
        self.send_ok(request_seq, command, None);
        let progress = self.client_supports_progress.load(Ordering::SeqCst);
        let progress_id = format!("step-{}", request_seq);
        if progress {
            self.send(self.event(
                "progressStart",
                Some(json!({"progressId": progress_id, "title": command})),
            ));
        }
        let result = {
            let mut dbg = self.debugger.lock().unwrap();
            match kind {
                StepKind::Continue => dbg.continue_(dir),
                StepKind::Next => dbg.next(dir),
                StepKind::Step => dbg.step(dir),
                StepKind::StepOut => dbg.step_out(dir),
            }
        };
        if progress {
            self.send(self.event(
                "progressEnd",
                Some(json!({"progressId": progress_id})),
            ));
        }
        match result {
            Ok(state) => {
                let reason = stop_reason_name(state.stop_reason);
                self.send(self.event("stopped", Some(stopped_body(reason, 1))));
            }
            Err(Error::Terminated) => {
                self.send(self.event("terminated", None));
            }
            Err(err) => self.send_err(request_seq, command, &err),
        }
    }

    fn handle_restart(&self, request_seq: i64) {
        self.send_ok(request_seq, "restart", None);
        match self.debugger.lock().unwrap().restart() {
            Ok(_) => self.send(self.event("stopped", Some(stopped_body("restart", 1)))),
            Err(err) => self.send_err(request_seq, "restart", &err),
        }
    }

    fn handle_stack_trace(&self, request_seq: i64, arguments: Option<Value>) {
        let start_frame = arguments
            .as_ref()
            .and_then(|a| a.get("startFrame"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let levels = arguments
            .as_ref()
            .and_then(|a| a.get("levels"))
            .and_then(Value::as_u64)
            .map(|n| n as usize);
        let dbg = self.debugger.lock().unwrap();
        let mut frames = dbg.backtrace();
        frames.reverse(); // innermost first, as stackTrace expects.
        let end = match levels {
            Some(n) if n > 0 => (start_frame + n).min(frames.len()),
            _ => frames.len(),
        };
        let slice = if start_frame < frames.len() {
            &frames[start_frame..end]
        } else {
            &[]
        };
        let body: Vec<Value> = slice
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let pos = f.node.position();
                json!({
                    "id": start_frame + i,
                    "name": f.name,
                    "line": pos.line,
                    "column": pos.column,
                    "source": { "path": pos.filename },
                })
            })
            .collect();
        let total = frames.len();
        drop(dbg);
        self.send_ok(
            request_seq,
            "stackTrace",
            Some(json!({ "stackFrames": body, "totalFrames": total })),
        );
    }

    fn handle_scopes(&self, request_seq: i64, _arguments: Option<Value>) {
        let dbg = self.debugger.lock().unwrap();
        let levels = [("Arguments", ScopeLevel::Args), ("Module", ScopeLevel::Module)];
        let entries: Vec<Value> = levels
            .iter()
            .map(|(name, level)| {
                let objects = dbg.scope_at(*level);
                let handle = self.variables.table.lock().unwrap().insert(objects);
                json!({
                    "name": name,
                    "variablesReference": handle,
                    "expensive": false,
                })
            })
            .collect();
        drop(dbg);
        self.send_ok(request_seq, "scopes", Some(json!({ "scopes": entries })));
    }

    fn handle_variables(&self, request_seq: i64, arguments: Option<Value>) {
        let handle = arguments
            .as_ref()
            .and_then(|a| a.get("variablesReference"))
            .and_then(Value::as_i64);
        let handle = match handle {
            Some(h) => h,
            None => {
                return self.send_err(
                    request_seq,
                    "variables",
                    &Error::InvalidArgument("variablesReference is required".into()),
                )
            }
        };
        let table = self.variables.table.lock().unwrap();
        let objects = match table.get(handle) {
            Some(objs) => objs.clone(),
            None => {
                return self.send_err(
                    request_seq,
                    "variables",
                    &Error::NotFound(format!("unknown variables handle {}", handle)),
                )
            }
        };
        drop(table);
        let include_type = self.client_supports_variable_type.load(Ordering::SeqCst);
        let body: Vec<Value> = objects
            .iter()
            .map(|o| {
                let mut v = json!({
                    "name": o.name,
                    "value": format!("{}", o.kind),
                    "variablesReference": 0,
                });
                if include_type {
                    v["type"] = json!(o.kind.to_string());
                }
                v
            })
            .collect();
        self.send_ok(request_seq, "variables", Some(json!({ "variables": body })));
    }

    fn handle_source(&self, request_seq: i64, arguments: Option<Value>) {
        let handle = arguments
            .as_ref()
            .and_then(|a| a.get("sourceReference"))
            .and_then(Value::as_i64);
        let path = arguments
            .as_ref()
            .and_then(|a| a.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let filename = match (handle, path) {
            (Some(h), _) if h > 0 => {
                let table = self.sources.table.lock().unwrap();
                match table.get(h) {
                    Some(f) => f.clone(),
                    None => {
                        return self.send_err(
                            request_seq,
                            "source",
                            &Error::NotFound(format!("unknown source handle {}", h)),
                        )
                    }
                }
            }
            (_, Some(p)) => p,
            _ => {
                return self.send_err(
                    request_seq,
                    "source",
                    &Error::InvalidArgument("source or path is required".into()),
                )
            }
        };
        let buffer = match self.registry.get(&filename) {
            Some(b) => b,
            None => return self.send_err(request_seq, "source", &Error::NotFound(filename)),
        };
        let buffer = buffer.lock().unwrap();
        let content = String::from_utf8_lossy(buffer.bytes()).into_owned();
        self.send_ok(request_seq, "source", Some(json!({ "content": content })));
    }

    fn handle_loaded_sources(&self, request_seq: i64) {
        let filenames = self.registry.filenames();
        let mut sources = Vec::with_capacity(filenames.len());
        for filename in filenames {
            let on_disk = self
                .registry
                .get(&filename)
                .map(|b| b.lock().unwrap().on_disk())
                .unwrap_or(false);
            let entry = if on_disk {
                json!({ "name": filename, "path": filename })
            } else {
                let handle = self
                    .sources
                    .table
                    .lock()
                    .unwrap()
                    .insert_aliased(&filename, filename.clone());
                json!({ "name": filename, "sourceReference": handle })
            };
            sources.push(entry);
        }
        self.send_ok(
            request_seq,
            "loadedSources",
            Some(json!({ "sources": sources })),
        );
    }

    fn handle_breakpoint_locations(&self, request_seq: i64, arguments: Option<Value>) {
        let arguments = arguments.unwrap_or_default();
        let path = arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let line = arguments.get("line").and_then(Value::as_u64).unwrap_or(0) as usize;
        let end_line = arguments
            .get("endLine")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(line);
        let dbg = self.debugger.lock().unwrap();
        let hits: Vec<Value> = dbg
            .breakpoints()
            .iter()
            .filter(|b| b.node.position().filename == path)
            .filter(|b| (line..=end_line).contains(&b.node.position().line))
            .map(|b| {
                let pos = b.node.position();
                let end = b.node.end();
                json!({
                    "line": pos.line,
                    "column": pos.column,
                    "endLine": end.line,
                    "endColumn": end.column,
                })
            })
            .collect();
        drop(dbg);
        self.send_ok(
            request_seq,
            "breakpointLocations",
            Some(json!({ "breakpoints": hits })),
        );
    }

    /// A narrow debug-console evaluator: bare identifier lookup against the
    /// current frame's visible scopes. No expression language is
    /// evaluated, matching `original_source`'s own unfinished evaluator.
    fn handle_evaluate(&self, request_seq: i64, arguments: Option<Value>) {
        let arguments = match arguments {
            Some(a) => a,
            None => {
                return self.send_err(
                    request_seq,
                    "evaluate",
                    &Error::InvalidArgument("missing arguments".into()),
                )
            }
        };
        let context = arguments
            .get("context")
            .and_then(Value::as_str)
            .unwrap_or("");
        if context != "watch" && context != "repl" && context != "hover" {
            return self.send_err(
                request_seq,
                "evaluate",
                &Error::Unsupported(format!("evaluate context {} is not supported", context)),
            );
        }
        let expression = arguments
            .get("expression")
            .and_then(Value::as_str)
            .unwrap_or("");
        if !is_bare_identifier(expression) {
            return self.send_err(
                request_seq,
                "evaluate",
                &Error::Unsupported("only bare identifier lookups are supported".into()),
            );
        }
        let dbg = self.debugger.lock().unwrap();
        let found = [ScopeLevel::Block, ScopeLevel::Args, ScopeLevel::Module]
            .iter()
            .find_map(|level| {
                dbg.scope_at(*level)
                    .into_iter()
                    .find(|o| o.name == expression)
            });
        drop(dbg);
        match found {
            Some(object) => self.send_ok(
                request_seq,
                "evaluate",
                Some(json!({
                    "result": format!("{}", object.kind),
                    "variablesReference": 0,
                })),
            ),
            None => self.send_err(
                request_seq,
                "evaluate",
                &Error::NotFound(format!("undefined identifier: {}", expression)),
            ),
        }
    }

    fn handle_terminate(&self, request_seq: i64, command: &str) {
        self.send_ok(request_seq, command, None);
        self.debugger.lock().unwrap().terminate();
        self.send(self.event("terminated", None));
    }

    /// Emit an arbitrary event, for callers outside the request dispatcher
    /// (the server shell's output tee uses this for `output` events).
    pub fn emit_event(&self, event: &str, body: Option<Value>) {
        self.send(self.event(event, body));
    }

    /// Resolve a linespec in the context of the session's current stop
    /// point, for embedders that drive the core directly rather than
    /// through `setBreakpoints`.
    pub fn resolve_linespec(&self, spec: &str) -> Result<NodeRef, Error> {
        let parsed = linespec::parse_linespec(spec)?;
        let cursor = self.debugger.lock().unwrap().get_state().ok().map(|s| Cursor {
            file: s.at_node.position().filename,
            line: s.at_node.position().line,
        });
        linespec::resolve(&parsed, &self.module_table, cursor.as_ref())
    }
}

enum StepKind {
    Continue,
    Next,
    Step,
    StepOut,
}

fn stop_reason_name(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Entry => "entry",
        StopReason::Step => "step",
        StopReason::Breakpoint => "breakpoint",
        StopReason::Exception => "exception",
        StopReason::Pause => "pause",
        StopReason::Restart => "restart",
    }
}

fn stopped_body(reason: &str, thread_id: i64) -> Value {
    json!({ "reason": reason, "threadId": thread_id, "allThreadsStopped": true })
}

fn is_bare_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().map(|c| c.is_alphabetic() || c == '_').unwrap_or(false)
        && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{block, call, function, ident, string_literal, Kind as AstKind};
    use crate::position::Position;

    fn pos(line: usize, col: usize) -> Position {
        Position::new("build.hlb", 0, line, col)
    }

    fn sample_table() -> ModuleTable {
        let image = call(
            pos(2, 5),
            pos(2, 21),
            None,
            ident(pos(2, 5), pos(2, 10), "image"),
            vec![string_literal(pos(2, 11), pos(2, 20), "alpine")],
            None,
            None,
            false,
        );
        let run = call(
            pos(3, 5),
            pos(3, 27),
            None,
            ident(pos(3, 5), pos(3, 8), "run"),
            vec![string_literal(pos(3, 9), pos(3, 26), "echo hello")],
            None,
            None,
            false,
        );
        let body = block(pos(1, 16), pos(4, 2), vec![image, run]);
        let name = ident(pos(1, 4), pos(1, 11), "default");
        let func = function(
            pos(1, 1),
            pos(4, 2),
            Some(name),
            Vec::new(),
            AstKind::Fs,
            Vec::new(),
            body,
        );
        let m = crate::ast::module("build.hlb", vec![func]);
        let mut table = ModuleTable::new();
        table.insert("build.hlb", m);
        table
    }

    fn new_session() -> (Session, mpsc::Receiver<OutMessage>) {
        let (tx, rx) = mpsc::channel();
        let session = Session::new(tx, sample_table(), Arc::new(SourceRegistry::new()));
        (session, rx)
    }

    fn drain(rx: &mpsc::Receiver<OutMessage>) -> Vec<Value> {
        rx.try_iter().map(|m| m.0).collect()
    }

    #[test]
    fn initialize_emits_response_then_initialized_event() {
        let (session, rx) = new_session();
        session.handle_request(1, "initialize", None);
        let msgs = drain(&rx);
        assert_eq!(msgs[0]["type"], "response");
        assert_eq!(msgs[0]["success"], true);
        assert_eq!(msgs[1]["type"], "event");
        assert_eq!(msgs[1]["event"], "initialized");
    }

    #[test]
    fn requests_before_initialize_are_rejected() {
        let (session, rx) = new_session();
        session.handle_request(1, "threads", None);
        let msgs = drain(&rx);
        assert_eq!(msgs[0]["success"], false);
    }

    #[test]
    fn configuration_done_responds_before_stopped_entry() {
        let (session, rx) = new_session();
        session.handle_request(1, "initialize", None);
        session.handle_request(2, "configurationDone", None);
        let msgs = drain(&rx);
        // response to configurationDone (index 2, after initialize's
        // response + initialized event), then stopped{entry}.
        assert_eq!(msgs[2]["type"], "response");
        assert_eq!(msgs[2]["command"], "configurationDone");
        assert_eq!(msgs[3]["type"], "event");
        assert_eq!(msgs[3]["event"], "stopped");
        assert_eq!(msgs[3]["body"]["reason"], "entry");
    }

    #[test]
    fn set_breakpoints_verifies_stop_node_and_rejects_others() {
        let (session, rx) = new_session();
        session.handle_request(1, "initialize", None);
        session.handle_request(
            2,
            "setBreakpoints",
            Some(json!({
                "source": {"path": "build.hlb"},
                "breakpoints": [{"line": 3}, {"line": 4}],
            })),
        );
        let msgs = drain(&rx);
        let body = &msgs[2]["body"]["breakpoints"];
        assert_eq!(body[0]["verified"], true);
        assert_eq!(body[1]["verified"], false);
    }

    #[test]
    fn continue_to_breakpoint_then_step_back_matches_s6() {
        let (session, rx) = new_session();
        session.handle_request(1, "initialize", None);
        session.handle_request(
            2,
            "setBreakpoints",
            Some(json!({
                "source": {"path": "build.hlb"},
                "breakpoints": [{"line": 3}],
            })),
        );
        session.handle_request(3, "configurationDone", None);
        session.handle_request(4, "continue", None);
        session.handle_request(5, "stepBack", None);
        let msgs = drain(&rx);
        let stopped: Vec<&Value> = msgs
            .iter()
            .filter(|m| m["type"] == "event" && m["event"] == "stopped")
            .collect();
        assert_eq!(stopped[0]["body"]["reason"], "entry");
        assert_eq!(stopped[1]["body"]["reason"], "breakpoint");
        assert_eq!(stopped[2]["body"]["reason"], "step");
    }

    #[test]
    fn handle_monotonicity_across_repeated_scope_requests() {
        let (session, rx) = new_session();
        session.handle_request(1, "initialize", None);
        session.handle_request(2, "configurationDone", None);
        session.handle_request(3, "scopes", None);
        session.handle_request(4, "scopes", None);
        let msgs = drain(&rx);
        let scopes_responses: Vec<&Value> = msgs
            .iter()
            .filter(|m| m["command"] == "scopes")
            .collect();
        let first: Vec<i64> = scopes_responses[0]["body"]["scopes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["variablesReference"].as_i64().unwrap())
            .collect();
        let second: Vec<i64> = scopes_responses[1]["body"]["scopes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["variablesReference"].as_i64().unwrap())
            .collect();
        assert!(second.iter().all(|h| *h > *first.iter().max().unwrap()));
    }

    #[test]
    fn evaluate_rejects_non_identifier_expressions() {
        let (session, rx) = new_session();
        session.handle_request(1, "initialize", None);
        session.handle_request(2, "configurationDone", None);
        session.handle_request(
            3,
            "evaluate",
            Some(json!({"expression": "1 + 1", "context": "watch"})),
        );
        let msgs = drain(&rx);
        let resp = msgs.iter().find(|m| m["command"] == "evaluate").unwrap();
        assert_eq!(resp["success"], false);
    }
}
