//! Debug adapter core for an HLB-style build DSL: a DAP-speaking session
//! driving a reversible stepper over a typed concrete syntax tree.
//!
//! The crate is organized leaves-first, mirroring the component order of
//! its own design: source buffers and positions (`position`), the typed
//! tree (`ast`), generic tree operations (`walk`), the linespec grammar
//! (`linespec`), the stepper itself (`debugger`), the protocol session
//! (`session`), and the stdio server shell (`server`).

use std::io;

use thiserror::Error as ThisError;

pub mod ast;
pub mod debugger;
pub mod header;
pub mod linespec;
pub mod position;
pub mod server;
pub mod session;
pub mod walk;

/// The crate's unified error type. `NotFound`/`InvalidArgument`/
/// `Unsupported`/`Conflict` are request-scoped and become a DAP error
/// response; `Terminated` ends the session after a `terminated` event;
/// `Transport`/`Io`/`InvalidJson`/`BadMessage` are wire-level failures that
/// surface to the server shell as the session's final error.
#[derive(ThisError, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("the interpreter has no further state")]
    Terminated,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed dap message")]
    BadMessage,
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl Error {
    /// The string a DAP error response's `message` field carries for this
    /// error. `Terminated` never reaches here: the session emits a
    /// `terminated` event for it instead of an error response.
    pub fn dap_message(&self) -> String {
        self.to_string()
    }
}
