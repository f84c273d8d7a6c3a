//! Run context threaded through every pipeline stage.

use std::path::{Path, PathBuf};

use crate::common::slash_path;
use crate::error::{Error, Result};

/// Named switches consulted by the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Ship `.bib`/`.bst` sources alongside the generated `.bbl`.
    pub bibliography: bool,
}

/// What the user pointed tartex at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// A `.tex` file; the trace is produced (or reused from cache).
    Tex,
    /// A pre-existing `.fls` trace; no compile, no cache.
    Trace,
}

/// Project identity and per-run state.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Canonical directory containing the main file.
    pub project_root: PathBuf,
    /// Canonical path of the main `.tex` file.
    pub main_file: PathBuf,
    /// The file given on the command line (`.tex` or `.fls`), canonical.
    pub input: PathBuf,
    pub input_kind: InputKind,
    pub flags: FeatureFlags,
    warnings: Vec<String>,
}

impl RunContext {
    /// Build a context from the user's input path.
    ///
    /// `main.fls` implies `main.tex` next to it; a bare `main` implies
    /// `main.tex`. The main file must exist in `.tex` mode; in trace mode only
    /// the trace must.
    pub fn from_input(input: &Path, flags: FeatureFlags) -> Result<Self> {
        let (input_kind, input) = match input.extension().and_then(|e| e.to_str()) {
            Some("fls") => (InputKind::Trace, input.to_path_buf()),
            Some("tex") => (InputKind::Tex, input.to_path_buf()),
            _ => {
                let mut with_tex = input.as_os_str().to_owned();
                with_tex.push(".tex");
                (InputKind::Tex, PathBuf::from(with_tex))
            }
        };

        if !input.is_file() {
            return Err(Error::MissingFile { path: input });
        }
        let input = input.canonicalize().map_err(|e| Error::io(&input, e))?;
        let project_root = input
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::InvalidInput(format!("{} has no parent", input.display())))?;
        let main_file = input.with_extension("tex");

        Ok(Self {
            project_root,
            main_file,
            input,
            input_kind,
            flags,
            warnings: Vec::new(),
        })
    }

    /// File stem of the main file (`paper` for `paper.tex`).
    pub fn stem(&self) -> String {
        self.main_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tartex".to_string())
    }

    /// Project-relative, slash-separated name of a path under the project
    /// root, or `None` for paths outside it.
    pub fn relative(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.project_root).ok().map(slash_path)
    }

    /// Main file name relative to the project root.
    pub fn main_name(&self) -> String {
        self.relative(&self.main_file).unwrap_or_else(|| self.stem() + ".tex")
    }

    /// Record a non-fatal problem for the end-of-run summary.
    pub fn warn(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::warn!("{msg}");
        self.warnings.push(msg);
    }

    /// Add warnings collected elsewhere (already logged).
    pub fn extend_warnings(&mut self, warnings: impl IntoIterator<Item = String>) {
        self.warnings.extend(warnings);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}
