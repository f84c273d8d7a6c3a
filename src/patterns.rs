//! User include/exclude overrides.
//!
//! Patterns are shell globs over slash-separated paths relative to the project
//! root. `*` stays within one path component and `**` spans any number of
//! them. A pattern without a leading `/` may match at any depth, so
//! `figures/*.pdf` picks up both `figures/a.pdf` and `ch1/figures/a.pdf`; a
//! leading `/` anchors it to the project root.
//!
//! Includes are applied first, excludes second, and excludes win. The main
//! file is the single exception: it cannot be excluded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use walkdir::{DirEntry, WalkDir};

use crate::classify::{ClassifiedFile, Reason};
use crate::common::{resolve, slash_path};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::trace::{FileRecord, Origin, TraceKind, TraceRoots};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Include and exclude globs as given by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
}

impl PatternSet {
    /// Build a set from repeatable, comma-separated option values
    /// (`-a "*.pdf,data/*.csv" -a extra.sty`).
    pub fn from_lists(includes: &[String], excludes: &[String]) -> Self {
        Self {
            includes: split_list(includes),
            excludes: split_list(excludes),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty() && self.excludes.is_empty()
    }
}

fn split_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// A compiled project-relative glob.
#[derive(Debug, Clone)]
pub struct Glob {
    raw: String,
    anchored: bool,
    pattern: Pattern,
}

impl Glob {
    pub fn new(raw: &str) -> Result<Self> {
        let anchored = raw.starts_with('/');
        let body = raw.trim_start_matches('/').trim_start_matches("./");
        let pattern = Pattern::new(body)
            .map_err(|e| Error::InvalidInput(format!("bad pattern '{raw}': {}", e.msg)))?;
        Ok(Self {
            raw: raw.to_string(),
            anchored,
            pattern,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True if the pattern has no glob metacharacters.
    pub fn is_literal(&self) -> bool {
        !self.raw.contains(['*', '?', '['])
    }

    /// Match a slash-separated project-relative path.
    pub fn matches(&self, rel: &str) -> bool {
        if self.anchored {
            return self.pattern.matches_with(rel, MATCH_OPTIONS);
        }
        // Try every component-aligned suffix.
        let mut rest = rel;
        loop {
            if self.pattern.matches_with(rest, MATCH_OPTIONS) {
                return true;
            }
            match rest.find('/') {
                Some(i) => rest = &rest[i + 1..],
                None => return false,
            }
        }
    }

    /// Path a literal include names under `root`.
    fn literal_path(&self, root: &Path) -> PathBuf {
        resolve(root, Path::new(self.pattern.as_str()))
    }
}

fn compile_all(raw: &[String]) -> Result<Vec<Glob>> {
    raw.iter().map(|r| Glob::new(r)).collect()
}

/// Apply include/exclude overrides to classified files in place.
///
/// Also drops included files that the trace named but that are gone from
/// disk (with a warning). A missing main file, or a literal include naming
/// no file, is fatal.
pub fn apply(
    files: &mut Vec<ClassifiedFile>,
    patterns: &PatternSet,
    roots: &TraceRoots,
    ctx: &mut RunContext,
) -> Result<()> {
    let includes = compile_all(&patterns.includes)?;
    let excludes = compile_all(&patterns.excludes)?;

    drop_missing(files, roots, ctx)?;

    if !includes.is_empty() {
        apply_includes(files, &includes, ctx)?;
    }

    for file in files.iter_mut().filter(|f| f.included) {
        let Some(name) = roots.archive_name(file.path()) else {
            continue;
        };
        let Some(glob) = excludes.iter().find(|g| g.matches(&name)) else {
            continue;
        };
        if file.reason == Reason::MainFile {
            ctx.warn(format!(
                "exclude pattern '{}' matches the main file {name}; ignoring",
                glob.as_str()
            ));
            continue;
        }
        tracing::debug!(file = %name, pattern = glob.as_str(), "excluded");
        file.included = false;
        file.reason = Reason::UserExclude(glob.as_str().to_string());
    }

    Ok(())
}

fn drop_missing(
    files: &mut [ClassifiedFile],
    roots: &TraceRoots,
    ctx: &mut RunContext,
) -> Result<()> {
    for file in files.iter_mut().filter(|f| f.included) {
        if roots.source_of(file.path()).is_file() {
            continue;
        }
        if file.reason == Reason::MainFile {
            return Err(Error::MissingFile {
                path: file.path().to_path_buf(),
            });
        }
        let name = roots
            .archive_name(file.path())
            .unwrap_or_else(|| file.path().display().to_string());
        ctx.warn(format!("{name} is listed in the trace but missing on disk; skipping"));
        file.included = false;
        file.reason = Reason::MissingOnDisk;
    }
    Ok(())
}

fn apply_includes(
    files: &mut Vec<ClassifiedFile>,
    includes: &[Glob],
    ctx: &mut RunContext,
) -> Result<()> {
    let root = ctx.project_root.clone();
    let mut hits = vec![0usize; includes.len()];
    let mut index: HashMap<PathBuf, usize> = files
        .iter()
        .enumerate()
        .map(|(i, f)| (f.path().to_path_buf(), i))
        .collect();

    // Wildcards never descend into hidden entries.
    let walker = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    for entry in walker {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
            Error::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&root) else {
            continue;
        };
        let rel = slash_path(rel);

        let mut matched = false;
        for (glob, count) in includes.iter().zip(hits.iter_mut()) {
            if glob.matches(&rel) {
                *count += 1;
                matched = true;
            }
        }
        if matched {
            include_path(files, &mut index, entry.path(), &rel);
        }
    }

    // A literal names its file directly, hidden or not.
    for (glob, count) in includes.iter().zip(hits.iter_mut()) {
        if !glob.is_literal() {
            continue;
        }
        let path = glob.literal_path(&root);
        if !path.starts_with(&root) || !path.is_file() {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(&root) {
            let rel = slash_path(rel);
            include_path(files, &mut index, &path, &rel);
            *count += 1;
        }
    }

    for (glob, count) in includes.iter().zip(hits) {
        if count > 0 {
            continue;
        }
        if glob.is_literal() {
            return Err(Error::MissingFile {
                path: glob.literal_path(&root),
            });
        }
        ctx.warn(format!("include pattern '{}' matched no files", glob.as_str()));
    }
    Ok(())
}

fn include_path(
    files: &mut Vec<ClassifiedFile>,
    index: &mut HashMap<PathBuf, usize>,
    path: &Path,
    rel: &str,
) {
    match index.get(path) {
        Some(&i) if files[i].included => {}
        Some(&i) => {
            files[i].included = true;
            files[i].reason = Reason::UserInclude;
        }
        None => {
            tracing::debug!(file = %rel, "added by include pattern");
            index.insert(path.to_path_buf(), files.len());
            files.push(ClassifiedFile {
                record: FileRecord {
                    path: path.to_path_buf(),
                    kind: TraceKind::Input,
                    origin: Origin::Project,
                },
                included: true,
                reason: Reason::UserInclude,
            });
        }
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|s| s.starts_with('.'))
}
