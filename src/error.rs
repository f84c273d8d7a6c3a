//! Error taxonomy for tartex.
//!
//! Every fatal condition the pipeline can hit has its own variant so callers
//! (and the CLI exit code) can tell a broken trace from a failed compile or a
//! git problem. Recoverable conditions (a corrupt cache, a missing file the
//! trace mentioned) are reported as warnings instead and never reach here,
//! except for [`Error::CacheCorrupt`], which the cache layer downgrades itself.

use std::path::PathBuf;
use std::time::Duration;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the tartex pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A trace line could not be parsed as `KEYWORD path`.
    #[error("malformed trace record in {path}:{line}: {content:?}")]
    TraceFormat {
        path: PathBuf,
        line: usize,
        content: String,
    },

    /// A required external program is not available.
    #[error("required tool '{tool}' not found: {hint}")]
    MissingTool { tool: String, hint: String },

    /// A revision checkout was requested on a tree with local modifications.
    #[error(
        "working tree at {repo} has uncommitted changes; \
         commit or stash them before selecting revision '{rev}'"
    )]
    DirtyWorkingTree { repo: PathBuf, rev: String },

    /// The LaTeX build did not finish within the allowed time.
    #[error("'{command}' timed out after {}s", timeout.as_secs_f64())]
    CompileTimeout { command: String, timeout: Duration },

    /// The LaTeX build exited with a non-zero status.
    #[error("latexmk failed to compile project (exit code {code}){}", format_summary(summary))]
    CompileFailed {
        command: String,
        code: i32,
        output: String,
        summary: Vec<String>,
    },

    /// A file explicitly requested by the user does not exist.
    #[error("file not found: {}", path.display())]
    MissingFile { path: PathBuf },

    /// The output archive already exists and no alternative was chosen.
    #[error("output file {} already exists; not overwriting", path.display())]
    Conflict { path: PathBuf },

    /// The cache record could not be read back.
    #[error("cache file {} is corrupt: {reason}", path.display())]
    CacheCorrupt { path: PathBuf, reason: String },

    /// Restoring the original checkout failed. The working tree needs manual
    /// attention.
    #[error(
        "failed to restore git checkout to '{original}': {source}{}",
        trigger.as_ref().map(|e| format!(" (while handling: {e})")).unwrap_or_default()
    )]
    RevisionRestore {
        original: String,
        source: Box<Error>,
        trigger: Option<Box<Error>>,
    },

    /// A git command failed.
    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    /// Some other external command failed.
    #[error(
        "'{program}' failed (exit code {code}){}",
        if stderr.is_empty() { String::new() } else { format!(":\n{stderr}") }
    )]
    Command {
        program: String,
        code: i32,
        stderr: String,
    },

    /// Writing the archive failed.
    #[error("failed to write archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn format_summary(summary: &[String]) -> String {
    if summary.is_empty() {
        return String::new();
    }
    let mut out = String::from(":");
    for line in summary {
        out.push_str("\n  ");
        out.push_str(line);
    }
    out
}

/// Process exit codes, one per failure family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    Generic = 1,
    Cache = 2,
    Git = 3,
    Latexmk = 4,
    Archive = 5,
}

impl Error {
    /// Shorthand for wrapping an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::CacheCorrupt { .. } => ExitCode::Cache,
            Self::DirtyWorkingTree { .. } | Self::RevisionRestore { .. } | Self::Git { .. } => {
                ExitCode::Git
            }
            Self::CompileTimeout { .. } | Self::CompileFailed { .. } => ExitCode::Latexmk,
            Self::Archive { .. } | Self::Conflict { .. } => ExitCode::Archive,
            Self::MissingTool { tool, .. } if tool == "git" => ExitCode::Git,
            Self::MissingTool { tool, .. } if tool == "latexmk" => ExitCode::Latexmk,
            _ => ExitCode::Generic,
        }
    }
}
