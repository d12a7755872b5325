//! Stands up one session against real stdin/stdout, against a small
//! synthetic module (this crate does not parse HLB source itself — see
//! SPEC_FULL.md's scope note). Exercises the same wiring a host binary
//! would: log4rs to a file (stdout/stderr are the DAP transport, so
//! logging can never go there), a `Session`, and `server::run` driving
//! the read/send loop to completion.

use std::io;
use std::sync::{mpsc, Arc};

use hlb_debug_core::ast::{block, call, function, ident, module, string_literal, Kind};
use hlb_debug_core::linespec::ModuleTable;
use hlb_debug_core::position::{Position, SourceRegistry};
use hlb_debug_core::server::{self, CancellationToken};
use hlb_debug_core::session::Session;

fn init_logger() {
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{l} - {m}\n")))
        .build("output.log")
        .unwrap();

    let config = Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .build(
            Root::builder()
                .appender("logfile")
                .build(log::LevelFilter::Info),
        )
        .unwrap();

    log4rs::init_config(config).unwrap();
}

fn pos(line: usize, column: usize) -> Position {
    Position::new("build.hlb", 0, line, column)
}

/// A `default` fs target that runs one shell command, standing in for a
/// module a real HLB parser would hand the core.
fn mock_module() -> ModuleTable {
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
    let mut table = ModuleTable::new();
    table.insert("build.hlb", module("build.hlb", vec![func]));
    table
}

fn main() {
    init_logger();

    let stdin = io::stdin();
    let stdout = io::stdout();
    let (tx, rx) = mpsc::channel();
    let registry = Arc::new(SourceRegistry::new());
    let session = Arc::new(Session::new(tx, mock_module(), registry));
    let cancel = CancellationToken::new();

    if let Err(err) = server::run(stdin.lock(), stdout, session, rx, cancel) {
        log::error!("session ended: {}", err);
    }
}
