//! One tartex run, from input file to archive, listing or check report.
//!
//! Stage order: preflight, output target (conflicts settled before any
//! work), revision checkout, cache decision, compile, trace, classify,
//! patterns, then the archive or report. Every stage reads and extends the
//! same [`RunContext`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::archive::{
    is_archive_name, resolve_conflicts, write_archive, ArchiveEntry, ArchiveSpec, Compression,
    ConflictResolver,
};
use crate::cache::{Cache, CacheState};
use crate::classify::{classify_trace, ClassifiedFile, AUX_EXTENSIONS};
use crate::common::{extension, mode_bits, mtime_secs, resolve, slash_path};
use crate::compile::{compile, resolve_mode, TexMode};
use crate::config::Config;
use crate::context::{FeatureFlags, InputKind, RunContext};
use crate::error::{Error, Result};
use crate::packages::{PackageManifest, MANIFEST_NAME};
use crate::patterns::{self, PatternSet};
use crate::preflight::{self, ToolNeeds};
use crate::report::{filesystem_files, CheckReport, FileDecision, RunMode, RunReport, TrackedSource};
use crate::revision::{with_revision, GitRepo, RevisionContext};
use crate::timing::Timer;
use crate::trace::{self, Origin, TraceRoots};

/// Everything the command line decides.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// `.tex` (suffix optional) or `.fls` input.
    pub input: PathBuf,
    /// Include globs, each entry possibly comma separated.
    pub includes: Vec<String>,
    /// Exclude globs, each entry possibly comma separated.
    pub excludes: Vec<String>,
    pub bibliography: bool,
    pub list: bool,
    pub check: bool,
    pub output: Option<PathBuf>,
    /// Compression forced by flag, overriding the output suffix.
    pub compression: Option<Compression>,
    pub force_recompile: bool,
    pub tex_mode: Option<TexMode>,
    pub with_pdf: bool,
    pub packages: bool,
    pub git_rev: Option<String>,
    pub overwrite: bool,
}

impl Options {
    pub fn run_mode(&self) -> RunMode {
        if self.check {
            RunMode::Check
        } else if self.list {
            RunMode::List
        } else {
            RunMode::Archive
        }
    }
}

/// The trace a run works from and how to read the files it names.
struct TraceSource {
    path: PathBuf,
    roots: TraceRoots,
    /// Timestamp stamped on generated and in-memory archive members.
    mtime: u64,
    /// Timestamp for every member, overriding file mtimes.
    pinned_mtime: Option<u64>,
    pdf: Option<PathBuf>,
}

/// Run tartex.
///
/// `cwd` anchors relative input and output paths. `resolver` is asked what
/// to do when the output archive already exists.
pub fn run(
    opts: &Options,
    config: &Config,
    resolver: &mut dyn ConflictResolver,
    cwd: &Path,
) -> Result<RunReport> {
    let timer = Timer::start("tartex run");
    let mode = opts.run_mode();
    let flags = FeatureFlags {
        bibliography: opts.bibliography,
    };
    let mut ctx = RunContext::from_input(&resolve(cwd, &opts.input), flags)?;
    tracing::debug!(
        main = %ctx.main_file.display(),
        root = %ctx.project_root.display(),
        ?mode,
        "starting run"
    );

    if opts.git_rev.is_some() && ctx.input_kind == InputKind::Trace {
        return Err(Error::InvalidInput(
            "--git-rev needs a .tex input; a trace file cannot be rebuilt at another revision"
                .to_string(),
        ));
    }

    preflight::run_preflight_or_fail(
        config,
        ToolNeeds {
            latexmk: ctx.input_kind == InputKind::Tex,
            git: opts.git_rev.is_some() || (opts.check && inside_git_work_tree(&ctx.project_root)),
        },
    )?;

    let repo = match &opts.git_rev {
        Some(_) => Some(GitRepo::discover(&config.git, &ctx.project_root)?),
        None => None,
    };
    let revision_id = match (&repo, &opts.git_rev) {
        (Some(repo), Some(rev)) => Some(repo.describe(&repo.resolve(rev)?)?),
        _ => None,
    };

    let spec = if mode == RunMode::Archive {
        let stem = match &revision_id {
            Some(id) => format!("{}-{id}", ctx.stem()),
            None => ctx.stem(),
        };
        let mut spec = ArchiveSpec::resolve(
            opts.output.as_deref(),
            opts.compression,
            &stem,
            &ctx.project_root,
            cwd,
        )?;
        spec.overwrite = opts.overwrite;
        let spec = resolve_conflicts(spec, resolver)?;
        tracing::debug!(
            output = %spec.output_path.display(),
            compression = %spec.compression,
            "output target"
        );
        Some(spec)
    } else {
        None
    };

    let report = match (&repo, &opts.git_rev) {
        (Some(repo), Some(rev)) => with_revision(repo, rev, |rc| {
            if !rc.is_clean {
                ctx.warn(format!(
                    "working tree has uncommitted changes; archiving them as {}",
                    rc.requested_rev
                ));
            }
            build(&mut ctx, opts, config, spec.as_ref(), Some((repo, rc)))
        })?,
        _ => build(&mut ctx, opts, config, spec.as_ref(), None)?,
    };

    timer.finish();
    Ok(report)
}

fn build(
    ctx: &mut RunContext,
    opts: &Options,
    config: &Config,
    spec: Option<&ArchiveSpec>,
    revision: Option<(&GitRepo, &RevisionContext)>,
) -> Result<RunReport> {
    let (mut source, cache_state) = match ctx.input_kind {
        InputKind::Trace => (given_trace(ctx)?, None),
        InputKind::Tex => {
            let (source, state) = cached_trace(ctx, opts, config)?;
            (source, Some(state))
        }
    };
    // A checkout rewrites mtimes; a clean revision is stamped with its commit time.
    if let Some((_, rc)) = revision.filter(|(_, rc)| rc.is_clean) {
        source.mtime = rc.commit_time;
        source.pinned_mtime = Some(rc.commit_time);
    }

    let timer = Timer::start("classify");
    let trace = trace::parse_file(&source.path, &source.roots)?;
    ctx.extend_warnings(trace.warnings.iter().cloned());
    let mut files = classify_trace(&trace, ctx);
    let patterns = PatternSet::from_lists(&opts.includes, &opts.excludes);
    patterns::apply(&mut files, &patterns, &source.roots, ctx)?;
    timer.finish();

    let classified = decisions(&files, &source.roots);
    let mut entries = collect_entries(&files, &source)?;

    if opts.with_pdf {
        match &source.pdf {
            Some(pdf) => {
                let name = format!("{}.pdf", ctx.stem());
                entries.insert(name.clone(), ArchiveEntry::file(name, pdf, source.mtime, 0o644));
            }
            None => ctx.warn(format!(
                "no compiled PDF found for {}; --with-pdf ignored",
                ctx.main_name()
            )),
        }
    }
    if opts.packages {
        let manifest = PackageManifest::from_trace(&trace);
        entries.insert(
            MANIFEST_NAME.to_string(),
            ArchiveEntry::bytes(MANIFEST_NAME, manifest.to_json()?, source.mtime),
        );
    }

    let names: Vec<String> = entries.keys().cloned().collect();

    let check = match opts.run_mode() {
        RunMode::Check => Some(completeness(ctx, config, &files, &source.roots, revision)?),
        _ => None,
    };

    let archive = match spec {
        Some(spec) => {
            let timer = Timer::start("archive");
            let path = write_archive(spec, entries.into_values().collect())?;
            timer.finish();
            Some(path)
        }
        None => None,
    };

    Ok(RunReport {
        mode: opts.run_mode(),
        archive,
        entries: names,
        classified,
        warnings: ctx.take_warnings(),
        cache_state,
        check,
    })
}

/// A `.fls` given on the command line: used as is, no cache.
fn given_trace(ctx: &RunContext) -> Result<TraceSource> {
    let pdf = ctx.project_root.join(format!("{}.pdf", ctx.stem()));
    Ok(TraceSource {
        path: ctx.input.clone(),
        roots: TraceRoots::new(&ctx.project_root, None),
        mtime: mtime_secs(&ctx.input)?,
        pinned_mtime: None,
        pdf: pdf.is_file().then_some(pdf),
    })
}

/// The cached trace for the main file, compiling first when the cache is stale.
fn cached_trace(
    ctx: &mut RunContext,
    opts: &Options,
    config: &Config,
) -> Result<(TraceSource, CacheState)> {
    let tex_mode = resolve_mode(ctx, opts.tex_mode)?;
    let cache = Cache::for_main_file(&config.cache_root, &ctx.main_file);
    let state = cache.evaluate(ctx, tex_mode, opts.force_recompile);

    let record = match &state {
        CacheState::Fresh(record) => record.clone(),
        CacheState::Stale(_) => {
            let timer = Timer::start("compile");
            let build = compile(ctx, config, tex_mode)?;
            timer.finish();

            // Classify on a scratch context so warnings surface once, from
            // the cached trace below.
            let roots = TraceRoots::new(&ctx.project_root, Some(build.build_dir.clone()));
            let trace = trace::parse_file(&build.trace, &roots)?;
            let mut scratch = ctx.clone();
            let files = classify_trace(&trace, &mut scratch);
            cache.commit(ctx, &build, &files)?
        }
    };

    let artifacts = cache.artifacts_dir();
    let pdf = artifacts.join(format!("{}.pdf", ctx.stem()));
    let source = TraceSource {
        mtime: mtime_secs(&record.trace_path)?,
        roots: TraceRoots::new(&ctx.project_root, Some(record.build_dir.clone()))
            .with_artifacts(&artifacts),
        path: record.trace_path,
        pinned_mtime: None,
        pdf: pdf.is_file().then_some(pdf),
    };
    Ok((source, state))
}

fn decisions(files: &[ClassifiedFile], roots: &TraceRoots) -> Vec<FileDecision> {
    files
        .iter()
        .map(|f| FileDecision {
            name: roots
                .archive_name(f.path())
                .unwrap_or_else(|| f.path().display().to_string()),
            origin: f.origin(),
            included: f.included,
            reason: f.reason.clone(),
        })
        .collect()
}

/// Archive members keyed by name. A generated file shadows a stale project
/// copy of the same name.
fn collect_entries(
    files: &[ClassifiedFile],
    source: &TraceSource,
) -> Result<BTreeMap<String, ArchiveEntry>> {
    let mut entries = BTreeMap::new();
    let included = |origin: Origin| {
        files
            .iter()
            .filter(move |f| f.included && f.origin() == origin)
    };

    for file in included(Origin::Project) {
        let Some(name) = source.roots.archive_name(file.path()) else {
            continue;
        };
        let path = file.path();
        let mtime = match source.pinned_mtime {
            Some(mtime) => mtime,
            None => mtime_secs(path)?,
        };
        let entry = ArchiveEntry::file(name.clone(), path, mtime, mode_bits(path)?);
        entries.insert(name, entry);
    }
    for file in included(Origin::Generated) {
        let Some(name) = source.roots.archive_name(file.path()) else {
            continue;
        };
        if entries.contains_key(&name) {
            tracing::debug!(file = %name, "generated file replaces project copy");
        }
        let entry = ArchiveEntry::file(
            name.clone(),
            source.roots.source_of(file.path()),
            source.mtime,
            0o644,
        );
        entries.insert(name, entry);
    }
    Ok(entries)
}

/// Compare the project files the build needs with the tracked ones.
fn completeness(
    ctx: &RunContext,
    config: &Config,
    files: &[ClassifiedFile],
    roots: &TraceRoots,
    revision: Option<(&GitRepo, &RevisionContext)>,
) -> Result<CheckReport> {
    let needed: Vec<String> = files
        .iter()
        .filter(|f| f.included && f.origin() == Origin::Project)
        .filter_map(|f| roots.archive_name(f.path()))
        .collect();

    let (tracked, source) = match revision {
        Some((repo, rc)) => (
            git_tracked(repo, &rc.commit, &ctx.project_root)?,
            TrackedSource::Git {
                rev: rc.requested_rev.clone(),
            },
        ),
        None if GitRepo::is_repo(&config.git, &ctx.project_root) => {
            let repo = GitRepo::discover(&config.git, &ctx.project_root)?;
            (
                git_tracked(&repo, "HEAD", &ctx.project_root)?,
                TrackedSource::Git {
                    rev: "HEAD".to_string(),
                },
            )
        }
        None => {
            let stem = ctx.stem();
            let tracked = filesystem_files(&ctx.project_root)?
                .into_iter()
                .filter(|name| !is_build_leftover(name, &stem))
                .collect();
            (tracked, TrackedSource::Filesystem)
        }
    };

    let report = CheckReport::new(
        needed.iter().map(String::as_str),
        tracked.iter().map(String::as_str),
        source,
    );
    tracing::info!(
        missing = report.missing.len(),
        unnecessary = report.unnecessary.len(),
        "completeness check done"
    );
    Ok(report)
}

fn git_tracked(repo: &GitRepo, rev: &str, dir: &Path) -> Result<Vec<String>> {
    Ok(repo
        .tracked_files(rev, dir)?
        .iter()
        .map(|p| slash_path(p))
        .filter(|name| !name.split('/').any(|c| c.starts_with('.')))
        .collect())
}

/// Files a previous build or archive run left in the project directory.
fn is_build_leftover(name: &str, stem: &str) -> bool {
    let path = Path::new(name);
    if let Some(ext) = extension(path) {
        if AUX_EXTENSIONS.contains(&ext.as_str()) {
            return true;
        }
        let is_main_output = path.file_stem().is_some_and(|s| s == stem) && !name.contains('/');
        if is_main_output && matches!(ext.as_str(), "pdf" | "dvi" | "ps") {
            return true;
        }
    }
    is_archive_name(name)
}

fn inside_git_work_tree(dir: &Path) -> bool {
    dir.ancestors().any(|d| d.join(".git").exists())
}
