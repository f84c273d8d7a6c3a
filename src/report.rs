//! What a run did, and how it is shown to the user.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::cache::CacheState;
use crate::classify::Reason;
use crate::common::slash_path;
use crate::error::{Error, Result};
use crate::trace::Origin;

/// What the run was asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Archive,
    List,
    Check,
}

/// The inclusion decision for one file, by archive name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDecision {
    pub name: String,
    pub origin: Origin,
    pub included: bool,
    pub reason: Reason,
}

/// Where the list of expected project files came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackedSource {
    Git { rev: String },
    Filesystem,
}

/// Result of a completeness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub source: TrackedSource,
    /// Needed by the build but not tracked.
    pub missing: Vec<String>,
    /// Tracked but not needed by the build.
    pub unnecessary: Vec<String>,
}

impl CheckReport {
    /// Compare the project files the build needs with the tracked ones.
    pub fn new<'a>(
        needed: impl IntoIterator<Item = &'a str>,
        tracked: impl IntoIterator<Item = &'a str>,
        source: TrackedSource,
    ) -> Self {
        let needed: BTreeSet<&str> = needed.into_iter().collect();
        let tracked: BTreeSet<&str> = tracked.into_iter().collect();
        Self {
            source,
            missing: needed.difference(&tracked).map(|s| s.to_string()).collect(),
            unnecessary: tracked.difference(&needed).map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn format(&self) -> String {
        let source = match &self.source {
            TrackedSource::Git { rev } => format!("tracked in git at {rev}"),
            TrackedSource::Filesystem => "present in the project directory".to_string(),
        };
        let mut out = String::new();
        if self.missing.is_empty() {
            let _ = writeln!(out, "All files needed to compile are {source}.");
        } else {
            let _ = writeln!(out, "Needed to compile but not {source}:");
            for name in &self.missing {
                let _ = writeln!(out, "  {name}");
            }
        }
        if !self.unnecessary.is_empty() {
            let _ = writeln!(out, "{} but not needed to compile:", capitalize(&source));
            for name in &self.unnecessary {
                let _ = writeln!(out, "  {name}");
            }
        }
        out
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Non-hidden files below `root`, as sorted slash-separated relative names.
pub fn filesystem_files(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .is_some_and(|s| s.starts_with('.'))
        });
    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            Error::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            names.push(slash_path(rel));
        }
    }
    Ok(names)
}

/// Everything a finished run has to say.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: RunMode,
    /// Archive written, in archive mode.
    pub archive: Option<PathBuf>,
    /// Archive member names, sorted.
    pub entries: Vec<String>,
    pub classified: Vec<FileDecision>,
    pub warnings: Vec<String>,
    /// `None` when the input was a trace file.
    pub cache_state: Option<CacheState>,
    pub check: Option<CheckReport>,
}

impl RunReport {
    /// Numbered file list, as printed by `--list`.
    pub fn format_listing(&self) -> String {
        let width = self.entries.len().to_string().len();
        let mut out = String::new();
        for (i, name) in self.entries.iter().enumerate() {
            let _ = writeln!(out, "{:>width$}. {name}", i + 1);
        }
        out
    }

    /// Every file seen, with the reason it was or was not included.
    pub fn format_reasons(&self) -> String {
        let mut decisions: Vec<&FileDecision> = self.classified.iter().collect();
        decisions.sort_by(|a, b| b.included.cmp(&a.included).then_with(|| a.name.cmp(&b.name)));
        let mut out = String::new();
        for d in decisions {
            let mark = if d.included { '+' } else { '-' };
            let _ = writeln!(out, "{mark} {} ({}): {}", d.name, d.origin, d.reason);
        }
        out
    }

    /// One-line summary, plus accumulated warnings.
    pub fn format_summary(&self) -> String {
        let mut out = String::new();
        let n = self.entries.len();
        match (self.mode, &self.archive) {
            (RunMode::Archive, Some(path)) => {
                let _ = writeln!(out, "Summary: {} generated with {n} files.", path.display());
            }
            (RunMode::Check, _) => {
                if let Some(check) = &self.check {
                    let _ = writeln!(
                        out,
                        "Summary: {n} files needed, {} missing, {} unnecessary.",
                        check.missing.len(),
                        check.unnecessary.len()
                    );
                }
            }
            _ => {
                let _ = writeln!(out, "Summary: {n} files to include.");
            }
        }
        if let Some(state) = &self.cache_state {
            let line = match state {
                CacheState::Fresh(_) => "cached trace reused".to_string(),
                CacheState::Stale(reason) => format!("recompiled ({reason})"),
            };
            let _ = writeln!(out, "Build: {line}");
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "Warnings ({}):", self.warnings.len());
            for w in &self.warnings {
                let _ = writeln!(out, "  {w}");
            }
        }
        out
    }
}
