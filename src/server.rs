//! The stdio server shell: the read loop that turns framed JSON into
//! dispatched requests, the send thread that drains a session's outbound
//! queue back onto the wire, and the cancellation handshake that lets a
//! host stop both cleanly.
//!
//! Framing and message extraction mirror the teacher's own single-session
//! reader: a `Header` followed by exactly `len` bytes of JSON. Responses
//! and events are serialized the same way in the other direction.

use std::io::{self, BufRead, Read, Write};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use serde_json::Value;

use crate::header::Header;
use crate::session::{OutMessage, OutputSink, Session};
use crate::Error;

/// A shutdown handshake shared between the read loop and the send thread.
/// Cloning gives every holder a handle to the same underlying flag.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    pub fn cancel(&self) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Block the calling thread until `cancel()` is called.
    pub fn wait(&self) {
        let (lock, condvar) = &*self.inner;
        let guard = lock.lock().unwrap();
        let _unused = condvar.wait_while(guard, |cancelled| !*cancelled).unwrap();
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one `Header` plus its JSON body off `input`. `Ok(None)` signals a
/// clean EOF before any header bytes were read; any other I/O failure, or a
/// malformed header/body, is returned as `Err`.
fn read_message<R: BufRead>(input: &mut R) -> Result<Option<Value>, Error> {
    if input.fill_buf()?.is_empty() {
        return Ok(None);
    }
    let header = Header::read_from(input)?;
    let mut buffer = vec![0; header.len];
    input.read_exact(&mut buffer)?;
    let value = serde_json::from_slice(&buffer)?;
    Ok(Some(value))
}

fn write_message<W: Write>(output: &mut W, message: &Value) -> Result<(), Error> {
    let body = serde_json::to_vec(message)?;
    write!(output, "Content-Length: {}\r\n\r\n", body.len())?;
    output.write_all(&body)?;
    output.flush()?;
    Ok(())
}

/// Drain `rx` and write each outbound message to `output`, until every
/// sender (the session itself, plus any `OutputSink` handed to a tee
/// thread) has been dropped and the channel disconnects. Runs on its own
/// thread so a handler's response is on the wire before the handler
/// returns, regardless of how long encoding/flushing takes. Draining to a
/// disconnect rather than polling a cancellation flag guarantees every
/// message enqueued before shutdown is still written.
fn send_loop<W: Write>(output: &mut W, rx: mpsc::Receiver<OutMessage>) {
    for OutMessage(message) in rx.iter() {
        if let Err(err) = write_message(output, &message) {
            log::warn!("failed to write outbound message: {}", err);
            return;
        }
    }
}

/// Run one DAP session to completion against `input`/`output`, dispatching
/// every request into `session` and shipping every response/event it
/// produces back out. Returns the first non-EOF I/O or protocol error; a
/// clean EOF on `input` returns `Ok(())`.
pub fn run<R, W>(
    mut input: R,
    mut output: W,
    session: Arc<Session>,
    out_rx: mpsc::Receiver<OutMessage>,
    cancel: CancellationToken,
) -> Result<(), Error>
where
    R: BufRead,
    W: Write + Send + 'static,
{
    let sender = thread::spawn(move || send_loop(&mut output, out_rx));

    let result = read_loop(&mut input, &session, &cancel);
    cancel.cancel();
    // Dropping the session's own sender lets the send thread drain whatever
    // is still queued and exit once disconnected; any `OutputSink` a tee
    // thread still holds keeps the channel open until that thread finishes.
    drop(session);
    let _ = sender.join();
    result
}

fn read_loop<R: BufRead>(input: &mut R, session: &Arc<Session>, cancel: &CancellationToken) -> Result<(), Error> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let message = match read_message(input) {
            Ok(Some(m)) => m,
            Ok(None) => return Ok(()),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        dispatch(session, message);
    }
}

fn dispatch(session: &Arc<Session>, message: Value) {
    if message.get("type").and_then(Value::as_str) != Some("request") {
        log::debug!("ignoring non-request inbound message");
        return;
    }
    let request_seq = match message.get("seq").and_then(Value::as_i64) {
        Some(s) => s,
        None => {
            log::warn!("dropping request with no seq");
            return;
        }
    };
    let command = match message.get("command").and_then(Value::as_str) {
        Some(c) => c.to_string(),
        None => {
            log::warn!("dropping request with no command");
            return;
        }
    };
    let arguments = message.get("arguments").cloned();
    session.handle_request(request_seq, &command, arguments);
}

/// Forward each line read from `source` as a DAP `output` event, tagged
/// with `category` (`"stdout"` or `"stderr"`, typically). Used to surface a
/// spawned build process's own output through the same session that is
/// debugging it; takes an `OutputSink` rather than the `Session` itself
/// since the session's tree state is `Rc`-based and not `Send`.
pub fn tee_output<R: Read + Send + 'static>(source: R, sink: OutputSink, category: &'static str) {
    thread::spawn(move || {
        let mut reader = io::BufReader::new(source);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => return,
                Ok(_) => sink.emit(
                    "output",
                    Some(serde_json::json!({ "category": category, "output": line })),
                ),
                Err(_) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    use crate::ast::{block, call, function, ident, module, string_literal, Kind};
    use crate::linespec::ModuleTable;
    use crate::position::{Position, SourceRegistry};

    fn pos(line: usize, col: usize) -> Position {
        Position::new("build.hlb", 0, line, col)
    }

    fn sample_table() -> ModuleTable {
        let run = call(
            pos(2, 5),
            pos(2, 27),
            None,
            ident(pos(2, 5), pos(2, 8), "run"),
            vec![string_literal(pos(2, 9), pos(2, 26), "echo hello")],
            None,
            None,
            false,
        );
        let body = block(pos(1, 16), pos(3, 2), vec![run]);
        let func = function(
            pos(1, 1),
            pos(3, 2),
            Some(ident(pos(1, 4), pos(1, 11), "default")),
            Vec::new(),
            Kind::Fs,
            Vec::new(),
            body,
        );
        let m = module("build.hlb", vec![func]);
        let mut table = ModuleTable::new();
        table.insert("build.hlb", m);
        table
    }

    fn framed(message: &Value) -> Vec<u8> {
        let body = serde_json::to_vec(message).unwrap();
        let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn read_message_reports_clean_eof() {
        let mut input = Cursor::new(Vec::<u8>::new());
        let msg = read_message(&mut input).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn read_message_round_trips_one_request() {
        let request = serde_json::json!({"seq": 1, "type": "request", "command": "threads"});
        let mut input = Cursor::new(framed(&request));
        let msg = read_message(&mut input).unwrap().unwrap();
        assert_eq!(msg["command"], "threads");
    }

    #[test]
    fn run_processes_requests_until_eof_and_writes_framed_responses() {
        let request = serde_json::json!({"seq": 1, "type": "request", "command": "initialize"});
        let input = Cursor::new(framed(&request));
        let output: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        struct SharedWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let (tx, rx) = mpsc::channel();
        let session = Arc::new(Session::new(tx, sample_table(), Arc::new(SourceRegistry::new())));
        let cancel = CancellationToken::new();
        run(input, SharedWriter(output.clone()), session, rx, cancel).unwrap();

        let written = output.lock().unwrap();
        let text = String::from_utf8_lossy(&written);
        assert!(text.contains("Content-Length"));
        assert!(text.contains("\"initialized\""));
    }
}
