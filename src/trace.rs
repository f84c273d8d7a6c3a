//! Parser for the LaTeX recorder trace (`.fls`).
//!
//! A trace is a line-oriented log written by the TeX engine when run with
//! `-recorder` (latexmk always does this):
//!
//! ```text
//! PWD /home/user/paper
//! INPUT /usr/share/texmf-dist/tex/latex/base/article.cls
//! INPUT paper.tex
//! OUTPUT /tmp/tartex-x1y2/paper.aux
//! ```
//!
//! Relative paths are resolved against the `PWD` record active when they were
//! written. The result is one [`FileRecord`] per distinct path, in order of
//! first appearance.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::common::{normalize, resolve, slash_path};
use crate::error::{Error, Result};

/// Whether a file was read or written by the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    Input,
    Output,
}

/// Where a traced file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Under the project root.
    Project,
    /// Under the temporary build directory.
    Generated,
    /// Anywhere else (TeX installation, system fonts, ...).
    System,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Project => write!(f, "project"),
            Origin::Generated => write!(f, "generated"),
            Origin::System => write!(f, "system"),
        }
    }
}

/// One file referenced by the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute, lexically normalized path.
    pub path: PathBuf,
    /// `Input` if the build ever read the file, `Output` if it only wrote it.
    pub kind: TraceKind,
    pub origin: Origin,
}

/// Directories that decide a record's [`Origin`].
///
/// `build_dir` is the directory the trace was recorded in, which may no
/// longer exist. When its generated files were preserved elsewhere,
/// `artifacts_dir` points at the copy.
#[derive(Debug, Clone)]
pub struct TraceRoots {
    pub project_root: PathBuf,
    pub build_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
}

impl TraceRoots {
    pub fn new(project_root: impl Into<PathBuf>, build_dir: Option<PathBuf>) -> Self {
        Self {
            project_root: normalize(&project_root.into()),
            build_dir: build_dir.map(|d| normalize(&d)),
            artifacts_dir: None,
        }
    }

    /// Read generated files from `dir` instead of the build directory.
    pub fn with_artifacts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts_dir = Some(dir.into());
        self
    }

    /// Where the content of a traced path can be read now.
    pub fn source_of(&self, path: &Path) -> PathBuf {
        if let (Some(build_dir), Some(artifacts)) = (&self.build_dir, &self.artifacts_dir) {
            if let Ok(rel) = path.strip_prefix(build_dir) {
                return artifacts.join(rel);
            }
        }
        path.to_path_buf()
    }

    /// Origin of an absolute, normalized path.
    pub fn origin_of(&self, path: &Path) -> Origin {
        if let Some(build_dir) = &self.build_dir {
            if path.starts_with(build_dir) {
                return Origin::Generated;
            }
        }
        if path.starts_with(&self.project_root) {
            Origin::Project
        } else {
            Origin::System
        }
    }

    /// Slash-separated archive name of a project or generated path; `None`
    /// for system files.
    pub fn archive_name(&self, path: &Path) -> Option<String> {
        match self.origin_of(path) {
            Origin::Generated => self
                .build_dir
                .as_ref()
                .and_then(|dir| path.strip_prefix(dir).ok())
                .map(slash_path),
            Origin::Project => path.strip_prefix(&self.project_root).ok().map(slash_path),
            Origin::System => None,
        }
    }
}

/// Parsed trace: records plus the non-fatal problems seen along the way.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub records: Vec<FileRecord>,
    pub warnings: Vec<String>,
}

/// Read and parse a trace file. Relative paths before the first `PWD`
/// record resolve against the trace file's directory.
pub fn parse_file(path: &Path, roots: &TraceRoots) -> Result<Trace> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| roots.project_root.clone());
    parse(&text, path, &base, roots)
}

/// Parse trace text. `source` only labels errors; `base` is the working
/// directory assumed before the first `PWD` record.
pub fn parse(text: &str, source: &Path, base: &Path, roots: &TraceRoots) -> Result<Trace> {
    let mut cwd = normalize(base);
    let mut trace = Trace::default();
    let mut index: HashMap<PathBuf, usize> = HashMap::new();

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let (keyword, arg) = split_record(line).ok_or_else(|| Error::TraceFormat {
            path: source.to_path_buf(),
            line: lineno + 1,
            content: line.to_string(),
        })?;

        let kind = match keyword {
            "PWD" => {
                cwd = resolve(&cwd, Path::new(arg));
                continue;
            }
            "INPUT" => TraceKind::Input,
            "OUTPUT" => TraceKind::Output,
            other => {
                let msg = format!(
                    "{}:{}: skipping unknown trace record '{}'",
                    source.display(),
                    lineno + 1,
                    other
                );
                tracing::warn!("{msg}");
                trace.warnings.push(msg);
                continue;
            }
        };

        let path = resolve(&cwd, Path::new(arg));
        match index.get(&path) {
            Some(&i) => {
                if kind == TraceKind::Input {
                    trace.records[i].kind = TraceKind::Input;
                }
            }
            None => {
                let origin = roots.origin_of(&path);
                index.insert(path.clone(), trace.records.len());
                trace.records.push(FileRecord { path, kind, origin });
            }
        }
    }

    tracing::debug!(
        records = trace.records.len(),
        source = %source.display(),
        "parsed trace"
    );
    Ok(trace)
}

/// Split `KEYWORD path`. The keyword is upper-case ASCII (underscores allowed);
/// the path is everything after the separating whitespace, so paths with
/// spaces survive.
fn split_record(line: &str) -> Option<(&str, &str)> {
    let end = line.find(|c: char| c.is_whitespace())?;
    let (keyword, rest) = line.split_at(end);
    if keyword.is_empty()
        || !keyword
            .chars()
            .all(|c| c.is_ascii_uppercase() || c == '_')
    {
        return None;
    }
    let arg = rest.trim_start();
    if arg.is_empty() {
        return None;
    }
    Some((keyword, arg))
}
