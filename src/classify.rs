//! File classification: which traced files belong in the archive, and why.
//!
//! [`classify`] is a pure function of a record, the run context and the
//! feature flags. [`classify_trace`] drives it over a whole trace and adds
//! what the trace cannot show: the main file (always shipped) and, when the
//! bibliography flag is on, the `.bib`/`.bst` sources named in the main file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::common::extension;
use crate::context::{FeatureFlags, RunContext};
use crate::trace::{FileRecord, Origin, Trace, TraceKind};

/// Auxiliary extensions never shipped from the project tree.
/// From the latexmk manual's list of generated files.
pub const AUX_EXTENSIONS: &[&str] = &[
    "aux", "bcf", "fls", "idx", "lof", "lot", "out", "toc", "blg", "ilg", "log", "xdv",
    "fdb_latexmk", "nav", "snm", "vrb",
];

/// Generated files a recompile needs (bibtex/makeindex output).
pub const SUPPLEMENT_EXTENSIONS: &[&str] = &["bbl", "ind"];

/// Bibliography sources, gated by [`FeatureFlags::bibliography`].
pub const BIBLIOGRAPHY_EXTENSIONS: &[&str] = &["bib", "bst"];

/// Why a file was included or excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    MainFile,
    ProjectSource,
    GeneratedSupplement,
    BibliographyRequested,
    UserInclude,
    SystemFile,
    BuildByproduct,
    AuxiliaryFile,
    GeneratedAuxiliary,
    FeatureDisabled(&'static str),
    UserExclude(String),
    MissingOnDisk,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::MainFile => write!(f, "main input file"),
            Reason::ProjectSource => write!(f, "project source read by the build"),
            Reason::GeneratedSupplement => write!(f, "generated file needed to recompile"),
            Reason::BibliographyRequested => write!(f, "bibliography source requested"),
            Reason::UserInclude => write!(f, "added by include pattern"),
            Reason::SystemFile => write!(f, "provided by the TeX installation"),
            Reason::BuildByproduct => write!(f, "build output, never read back"),
            Reason::AuxiliaryFile => write!(f, "auxiliary file"),
            Reason::GeneratedAuxiliary => write!(f, "generated auxiliary file"),
            Reason::FeatureDisabled(feature) => write!(f, "{feature} inclusion not enabled"),
            Reason::UserExclude(pattern) => write!(f, "excluded by pattern '{pattern}'"),
            Reason::MissingOnDisk => write!(f, "listed in trace but missing on disk"),
        }
    }
}

/// A trace record plus the inclusion decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFile {
    pub record: FileRecord,
    pub included: bool,
    pub reason: Reason,
}

impl ClassifiedFile {
    pub fn path(&self) -> &Path {
        &self.record.path
    }

    pub fn origin(&self) -> Origin {
        self.record.origin
    }
}

/// Decide inclusion for a single record.
pub fn classify(record: &FileRecord, ctx: &RunContext, flags: FeatureFlags) -> (bool, Reason) {
    if record.path == ctx.main_file {
        return (true, Reason::MainFile);
    }

    let ext = extension(&record.path);
    let has_ext = |set: &[&str]| ext.as_deref().is_some_and(|e| set.contains(&e));

    match record.origin {
        Origin::System => (false, Reason::SystemFile),
        _ if record.kind == TraceKind::Output => (false, Reason::BuildByproduct),
        Origin::Generated if has_ext(SUPPLEMENT_EXTENSIONS) => (true, Reason::GeneratedSupplement),
        Origin::Generated => (false, Reason::GeneratedAuxiliary),
        Origin::Project if has_ext(AUX_EXTENSIONS) => (false, Reason::AuxiliaryFile),
        Origin::Project if has_ext(BIBLIOGRAPHY_EXTENSIONS) => {
            if flags.bibliography {
                (true, Reason::BibliographyRequested)
            } else {
                (false, Reason::FeatureDisabled("bibliography"))
            }
        }
        Origin::Project => (true, Reason::ProjectSource),
    }
}

/// Classify every record of a trace.
pub fn classify_trace(trace: &Trace, ctx: &mut RunContext) -> Vec<ClassifiedFile> {
    let flags = ctx.flags;
    let mut files: Vec<ClassifiedFile> = trace
        .records
        .iter()
        .map(|record| {
            let (included, reason) = classify(record, ctx, flags);
            tracing::trace!(path = %record.path.display(), included, %reason, "classified");
            ClassifiedFile {
                record: record.clone(),
                included,
                reason,
            }
        })
        .collect();

    if !files.iter().any(|f| f.record.path == ctx.main_file) {
        tracing::debug!("main file not in trace, adding it");
        files.insert(
            0,
            ClassifiedFile {
                record: FileRecord {
                    path: ctx.main_file.clone(),
                    kind: TraceKind::Input,
                    origin: Origin::Project,
                },
                included: true,
                reason: Reason::MainFile,
            },
        );
    }

    if flags.bibliography {
        add_bibliography_sources(&mut files, ctx);
    }

    files
}

fn add_bibliography_sources(files: &mut Vec<ClassifiedFile>, ctx: &mut RunContext) {
    let text = match std::fs::read_to_string(&ctx.main_file) {
        Ok(text) => text,
        Err(e) => {
            ctx.warn(format!(
                "could not scan {} for bibliography files: {e}",
                ctx.main_file.display()
            ));
            return;
        }
    };

    for candidate in bibliography_files(&text) {
        let path = crate::common::resolve(&ctx.project_root, &candidate);
        if let Some(existing) = files.iter_mut().find(|f| f.record.path == path) {
            existing.included = true;
            existing.reason = Reason::BibliographyRequested;
            continue;
        }
        if !path.is_file() {
            ctx.warn(format!(
                "bibliography file {} not found in project, skipping",
                candidate.display()
            ));
            continue;
        }
        files.push(ClassifiedFile {
            record: FileRecord {
                path,
                kind: TraceKind::Input,
                origin: Origin::Project,
            },
            included: true,
            reason: Reason::BibliographyRequested,
        });
    }
}

/// Project `.bib`/`.bst` files the main file names that exist on disk.
///
/// bibtex and biber read these outside the recorder, so they never show up
/// in a trace.
pub fn bibliography_sources(ctx: &RunContext) -> Vec<PathBuf> {
    let Ok(text) = std::fs::read_to_string(&ctx.main_file) else {
        return Vec::new();
    };
    bibliography_files(&text)
        .iter()
        .map(|candidate| crate::common::resolve(&ctx.project_root, candidate))
        .filter(|path| path.starts_with(&ctx.project_root) && path.is_file())
        .collect()
}

/// `.bib` and `.bst` files named by `\bibliography{..}` and
/// `\bibliographystyle{..}`, in order of appearance, extensions added.
/// Commented-out commands are ignored.
pub fn bibliography_files(tex: &str) -> Vec<PathBuf> {
    static BIB_RE: OnceLock<Regex> = OnceLock::new();
    let re = BIB_RE.get_or_init(|| {
        Regex::new(r"^[^%]*?\\bibliography(style)?\s*\{([^}]*)\}").expect("static regex")
    });

    let mut out = Vec::new();
    for line in tex.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let ext = if caps.get(1).is_some() { "bst" } else { "bib" };
        for name in caps[2].split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let mut path = PathBuf::from(name);
            if extension(&path).as_deref() != Some(ext) {
                let mut with_ext = path.into_os_string();
                with_ext.push(".");
                with_ext.push(ext);
                path = PathBuf::from(with_ext);
            }
            if !out.contains(&path) {
                out.push(path);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FeatureFlags;
    use crate::trace::{parse, TraceRoots};
    use std::fs;

    fn project(flags: FeatureFlags) -> (tempfile::TempDir, RunContext) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("paper.tex"),
            "\\documentclass{article}\n\\bibliographystyle{plain}\n\\bibliography{refs, extra}\n",
        )
        .unwrap();
        fs::write(dir.path().join("refs.bib"), "@article{a,}").unwrap();
        let ctx = RunContext::from_input(&dir.path().join("paper.tex"), flags).unwrap();
        (dir, ctx)
    }

    fn record(path: PathBuf, kind: TraceKind, origin: Origin) -> FileRecord {
        FileRecord { path, kind, origin }
    }

    #[test]
    fn default_policy() {
        let (_dir, ctx) = project(FeatureFlags::default());
        let root = ctx.project_root.clone();
        let flags = FeatureFlags::default();

        let cases = [
            (
                record(ctx.main_file.clone(), TraceKind::Input, Origin::Project),
                true,
                Reason::MainFile,
            ),
            (
                record(root.join("intro.tex"), TraceKind::Input, Origin::Project),
                true,
                Reason::ProjectSource,
            ),
            (
                record(
                    PathBuf::from("/usr/share/texmf/article.cls"),
                    TraceKind::Input,
                    Origin::System,
                ),
                false,
                Reason::SystemFile,
            ),
            (
                record(root.join("paper.log"), TraceKind::Output, Origin::Project),
                false,
                Reason::BuildByproduct,
            ),
            (
                record(root.join("paper.aux"), TraceKind::Input, Origin::Project),
                false,
                Reason::AuxiliaryFile,
            ),
            (
                record(PathBuf::from("/tmp/b/paper.bbl"), TraceKind::Input, Origin::Generated),
                true,
                Reason::GeneratedSupplement,
            ),
            (
                record(PathBuf::from("/tmp/b/paper.toc"), TraceKind::Input, Origin::Generated),
                false,
                Reason::GeneratedAuxiliary,
            ),
            (
                record(root.join("refs.bib"), TraceKind::Input, Origin::Project),
                false,
                Reason::FeatureDisabled("bibliography"),
            ),
        ];
        for (rec, included, reason) in cases {
            assert_eq!(classify(&rec, &ctx, flags), (included, reason), "{}", rec.path.display());
        }
    }

    #[test]
    fn main_file_always_included_even_if_written() {
        let (_dir, ctx) = project(FeatureFlags::default());
        let rec = record(ctx.main_file.clone(), TraceKind::Output, Origin::Project);
        assert_eq!(classify(&rec, &ctx, FeatureFlags::default()), (true, Reason::MainFile));
    }

    #[test]
    fn classify_trace_adds_missing_main() {
        let (_dir, mut ctx) = project(FeatureFlags::default());
        let roots = TraceRoots::new(&ctx.project_root, None);
        let trace =
            parse("INPUT intro.tex\n", Path::new("t.fls"), &ctx.project_root, &roots).unwrap();
        let files = classify_trace(&trace, &mut ctx);
        assert_eq!(files[0].reason, Reason::MainFile);
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn bibliography_flag_adds_sources_and_warns_on_missing() {
        let (_dir, mut ctx) = project(FeatureFlags { bibliography: true });
        let roots = TraceRoots::new(&ctx.project_root, None);
        let trace =
            parse("INPUT paper.tex\n", Path::new("t.fls"), &ctx.project_root, &roots).unwrap();
        let files = classify_trace(&trace, &mut ctx);

        let bib = files
            .iter()
            .find(|f| f.path().ends_with("refs.bib"))
            .expect("refs.bib added");
        assert!(bib.included);
        assert_eq!(bib.reason, Reason::BibliographyRequested);

        // extra.bib and plain.bst do not exist in the project
        assert_eq!(ctx.warnings().len(), 2);
        assert!(ctx.warnings().iter().any(|w| w.contains("extra.bib")));
        assert!(ctx.warnings().iter().any(|w| w.contains("plain.bst")));
    }

    #[test]
    fn bibliography_files_parsing() {
        let tex = "% \\bibliography{commented}\n\
                   \\bibliographystyle{unsrt}\n\
                   text \\bibliography{a,b.bib , c}\n";
        let files = bibliography_files(tex);
        assert_eq!(
            files,
            vec![
                PathBuf::from("unsrt.bst"),
                PathBuf::from("a.bib"),
                PathBuf::from("b.bib"),
                PathBuf::from("c.bib"),
            ]
        );
    }

    #[test]
    fn reason_display_is_readable() {
        assert_eq!(Reason::UserExclude("*.bbl".into()).to_string(), "excluded by pattern '*.bbl'");
        assert_eq!(
            Reason::FeatureDisabled("bibliography").to_string(),
            "bibliography inclusion not enabled"
        );
    }
}
