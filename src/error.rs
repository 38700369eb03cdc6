/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::error
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Centralise Syn-Forum-Core error types to provide consistent
    diagnostics and exit semantics.

  Security / Safety Notes:
    Error contexts expose command names and high-level paths
    only; composer output is trimmed before inclusion.

  Dependencies:
    thiserror for ergonomic error definitions.

  Operational Scope:
    Used across modules to propagate recoverable failures and
    consolidate exit codes for the binary entry point.

  Revision History:
    2026-03-02 COD  Established shared error definitions.
    2026-03-19 COD  Added Timeout for stalled composer runs.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Explicit error taxonomy with actionable context
    - No silent failure paths
    - Stable exit codes for operational tooling
============================================================*/

use std::io;
use std::process::ExitCode;

use thiserror::Error;

/// Result alias for Syn-Forum-Core operations.
pub type Result<T> = std::result::Result<T, SynforumError>;

/// Enumerates high-level error domains surfaced by Syn-Forum-Core.
#[derive(Debug, Error)]
pub enum SynforumError {
    #[error("Required command `{command}` not found in PATH")]
    CommandMissing { command: String },
    #[error("Command `{command}` failed with status {status}: {stderr}")]
    CommandFailure {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("Command `{command}` produced no result within {seconds}s")]
    Timeout { command: String, seconds: u64 },
    #[error("Configuration: {0}")]
    Config(String),
    #[error("Network: {0}")]
    Network(String),
    #[error("Serialization: {0}")]
    Serialization(String),
    #[error("Filesystem: {0}")]
    Filesystem(String),
    #[error("Runtime: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SynforumError {
    /// Map error category to a deterministic exit code.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SynforumError::CommandMissing { .. } => ExitCode::from(10),
            SynforumError::CommandFailure { .. } => ExitCode::from(11),
            SynforumError::Timeout { .. } => ExitCode::from(12),
            SynforumError::Config(_) => ExitCode::from(20),
            SynforumError::Network(_) => ExitCode::from(30),
            SynforumError::Serialization(_) => ExitCode::from(31),
            SynforumError::Filesystem(_) => ExitCode::from(40),
            SynforumError::Runtime(_) => ExitCode::from(50),
            SynforumError::Io(_) => ExitCode::from(41),
        }
    }
}
