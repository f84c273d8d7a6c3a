//! Build caching - hash-based trace reuse.
//!
//! Uses SHA256 hashes of every project file the last build depended on to
//! decide whether its trace can be reused, instead of running latexmk again.
//! Hashes catch real content changes; touched-but-unchanged files stay fresh.
//!
//! Each main file gets its own cache directory:
//!
//! ```text
//! <cache_root>/<parent>_<project>_<hash8>/
//!     cache.json      the CacheRecord
//!     trace.fls       copy of the build's recorder trace
//!     artifacts/      generated files the archive needs (.bbl, .ind, PDF)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classify::{bibliography_sources, ClassifiedFile};
use crate::common::{copy_with_dirs, slash_path};
use crate::compile::{CompileOutput, TexMode};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::trace::Origin;

/// Bumped whenever the record layout or cache directory contents change.
pub const CACHE_VERSION: u32 = 2;

const RECORD_FILE: &str = "cache.json";
const TRACE_FILE: &str = "trace.fls";
const ARTIFACTS_DIR: &str = "artifacts";

/// What the last successful build left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub version: u32,
    pub main_file: PathBuf,
    pub tex_mode: String,
    pub generated_at: DateTime<Utc>,
    /// Cached copy of the trace.
    pub trace_path: PathBuf,
    /// Directory the trace was recorded in (no longer exists).
    pub build_dir: PathBuf,
    /// Project-relative path -> SHA256 hex.
    pub fingerprint: BTreeMap<String, String>,
    /// Files saved under `artifacts/`, relative to it.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Why the cached trace cannot be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    NoRecord,
    Forced,
    Corrupt,
    Modified(String),
    Missing(String),
    MainFileMismatch,
    ModeMismatch,
    VersionMismatch,
    TraceMissing,
    ArtifactMissing(String),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::NoRecord => write!(f, "no cache record"),
            StaleReason::Forced => write!(f, "recompile forced"),
            StaleReason::Corrupt => write!(f, "cache record is corrupt"),
            StaleReason::Modified(path) => write!(f, "{path} changed"),
            StaleReason::Missing(path) => write!(f, "{path} no longer exists"),
            StaleReason::MainFileMismatch => write!(f, "cache belongs to a different main file"),
            StaleReason::ModeMismatch => write!(f, "TeX processing mode changed"),
            StaleReason::VersionMismatch => write!(f, "cache written by an incompatible version"),
            StaleReason::TraceMissing => write!(f, "cached trace is missing"),
            StaleReason::ArtifactMissing(name) => write!(f, "cached artifact {name} is missing"),
        }
    }
}

/// Outcome of [`Cache::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    Fresh(CacheRecord),
    Stale(StaleReason),
}

impl CacheState {
    pub fn is_fresh(&self) -> bool {
        matches!(self, CacheState::Fresh(_))
    }
}

/// Per-main-file cache directory.
#[derive(Debug, Clone)]
pub struct Cache {
    dir: PathBuf,
}

impl Cache {
    /// Cache for a canonical main file path.
    pub fn for_main_file(cache_root: &Path, main_file: &Path) -> Self {
        Self {
            dir: cache_root.join(cache_dir_name(main_file)),
        }
    }

    /// Cache rooted at an explicit directory.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    pub fn trace_path(&self) -> PathBuf {
        self.dir.join(TRACE_FILE)
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join(ARTIFACTS_DIR)
    }

    /// Read the record. `Ok(None)` if there is none; a record that exists but
    /// does not parse is [`Error::CacheCorrupt`].
    pub fn load(&self) -> Result<Option<CacheRecord>> {
        let path = self.record_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::CacheCorrupt {
                    path,
                    reason: e.to_string(),
                })
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| Error::CacheCorrupt {
                path,
                reason: e.to_string(),
            })
    }

    /// Decide whether the cached trace may be reused for this run.
    ///
    /// Never fails: an unreadable cache is just stale (with a warning).
    pub fn evaluate(&self, ctx: &mut RunContext, mode: TexMode, force: bool) -> CacheState {
        let state = self.evaluate_inner(ctx, mode, force);
        match &state {
            CacheState::Fresh(_) => {
                tracing::info!(cache = %self.dir.display(), "cache is fresh, reusing trace")
            }
            CacheState::Stale(reason) => tracing::info!(%reason, "cache is stale, recompiling"),
        }
        state
    }

    fn evaluate_inner(&self, ctx: &mut RunContext, mode: TexMode, force: bool) -> CacheState {
        if force {
            return CacheState::Stale(StaleReason::Forced);
        }

        let record = match self.load() {
            Ok(Some(record)) => record,
            Ok(None) => return CacheState::Stale(StaleReason::NoRecord),
            Err(e) => {
                ctx.warn(format!("{e}; recompiling"));
                return CacheState::Stale(StaleReason::Corrupt);
            }
        };

        if record.version != CACHE_VERSION {
            return CacheState::Stale(StaleReason::VersionMismatch);
        }
        if record.main_file != ctx.main_file {
            return CacheState::Stale(StaleReason::MainFileMismatch);
        }
        if record.tex_mode != mode.as_str() {
            return CacheState::Stale(StaleReason::ModeMismatch);
        }
        if !record.trace_path.is_file() {
            return CacheState::Stale(StaleReason::TraceMissing);
        }
        let artifacts = self.artifacts_dir();
        if let Some(name) = record
            .artifacts
            .iter()
            .find(|name| !artifacts.join(name).is_file())
        {
            return CacheState::Stale(StaleReason::ArtifactMissing(name.clone()));
        }

        for (rel, expected) in &record.fingerprint {
            let Some(path) = project_path(&ctx.project_root, rel) else {
                return CacheState::Stale(StaleReason::Corrupt);
            };
            if !path.is_file() {
                return CacheState::Stale(StaleReason::Missing(rel.clone()));
            }
            match hash_file(&path) {
                Ok(actual) if &actual == expected => {}
                Ok(_) => return CacheState::Stale(StaleReason::Modified(rel.clone())),
                Err(e) => {
                    tracing::warn!(
                        "failed to hash {}: {e} (cache will be invalidated)",
                        path.display()
                    );
                    return CacheState::Stale(StaleReason::Modified(rel.clone()));
                }
            }
        }

        CacheState::Fresh(record)
    }

    /// Store a successful build: trace, needed artifacts and fingerprint.
    ///
    /// `files` is the classification of that build's trace. Every included
    /// project file, the main file and the bibliography sources it names are
    /// fingerprinted; every included generated file is preserved.
    pub fn commit(
        &self,
        ctx: &RunContext,
        build: &CompileOutput,
        files: &[ClassifiedFile],
    ) -> Result<CacheRecord> {
        let artifacts = self.artifacts_dir();
        if artifacts.exists() {
            fs::remove_dir_all(&artifacts).map_err(|e| Error::io(&artifacts, e))?;
        }
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;

        let trace_path = self.trace_path();
        fs::copy(&build.trace, &trace_path).map_err(|e| Error::io(&build.trace, e))?;

        let mut saved = Vec::new();
        let generated = files
            .iter()
            .filter(|f| f.included && f.origin() == Origin::Generated)
            .map(|f| f.path().to_path_buf())
            .chain(build.pdf(&ctx.stem()));
        for path in generated {
            let Ok(rel) = path.strip_prefix(&build.build_dir) else {
                continue;
            };
            let name = slash_path(rel);
            if path.is_file() && !saved.contains(&name) {
                copy_with_dirs(&path, &artifacts.join(rel))?;
                saved.push(name);
            }
        }

        let mut fingerprint = BTreeMap::new();
        let bibliography = bibliography_sources(ctx);
        let project_files = files
            .iter()
            .filter(|f| f.included && f.origin() == Origin::Project)
            .map(|f| f.path())
            .chain(std::iter::once(ctx.main_file.as_path()))
            .chain(bibliography.iter().map(PathBuf::as_path));
        for path in project_files {
            let Some(rel) = ctx.relative(path) else {
                continue;
            };
            if fingerprint.contains_key(&rel) || !path.is_file() {
                continue;
            }
            fingerprint.insert(rel, hash_file(path)?);
        }

        let record = CacheRecord {
            version: CACHE_VERSION,
            main_file: ctx.main_file.clone(),
            tex_mode: build.mode.as_str().to_string(),
            generated_at: Utc::now(),
            trace_path,
            build_dir: build.build_dir.clone(),
            fingerprint,
            artifacts: saved,
        };
        self.save(&record)?;
        tracing::debug!(
            files = record.fingerprint.len(),
            cache = %self.dir.display(),
            "cache record written"
        );
        Ok(record)
    }

    /// Write the record atomically.
    pub fn save(&self, record: &CacheRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        let path = self.record_path();
        let json = serde_json::to_string_pretty(record).map_err(|e| Error::CacheCorrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| Error::io(&self.dir, e))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| Error::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| Error::io(&path, e.error))?;
        Ok(())
    }
}

/// `<parent>_<project>_<hash8>` for a main file at `.../<parent>/<project>/main.tex`.
pub fn cache_dir_name(main_file: &Path) -> String {
    let digest = Sha256::digest(main_file.as_os_str().as_encoded_bytes());
    let hash8: String = format!("{digest:x}").chars().take(8).collect();

    let mut names: Vec<String> = main_file
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let keep = names.len().saturating_sub(2);
    names.drain(..keep);
    names.push(hash8);
    names.join("_")
}

/// SHA256 of a file's raw bytes, as lowercase hex.
pub fn hash_file(path: &Path) -> Result<String> {
    let content = fs::read(path).map_err(|e| Error::io(path, e))?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

/// Join a fingerprint key onto the project root, refusing keys that would
/// escape it.
fn project_path(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    if rel
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        Some(root.join(rel))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FeatureFlags;

    fn project() -> (tempfile::TempDir, RunContext, Cache) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.tex"), "\\input{intro}").unwrap();
        std::fs::write(dir.path().join("intro.tex"), "hello").unwrap();
        let ctx =
            RunContext::from_input(&dir.path().join("main.tex"), FeatureFlags::default()).unwrap();
        let cache = Cache::at(dir.path().join(".cache-test"));
        (dir, ctx, cache)
    }

    fn record_for(ctx: &RunContext, cache: &Cache) -> CacheRecord {
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.trace_path(), "PWD /x\n").unwrap();
        let mut fingerprint = BTreeMap::new();
        for name in ["main.tex", "intro.tex"] {
            fingerprint.insert(
                name.to_string(),
                hash_file(&ctx.project_root.join(name)).unwrap(),
            );
        }
        CacheRecord {
            version: CACHE_VERSION,
            main_file: ctx.main_file.clone(),
            tex_mode: "pdf".to_string(),
            generated_at: Utc::now(),
            trace_path: cache.trace_path(),
            build_dir: PathBuf::from("/tmp/tartex-gone"),
            fingerprint,
            artifacts: Vec::new(),
        }
    }

    #[test]
    fn hash_detects_content_not_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let f = dir.path().join("a.tex");
        std::fs::write(&f, "one").unwrap();
        let h1 = hash_file(&f).unwrap();
        std::fs::write(&f, "one").unwrap();
        assert_eq!(hash_file(&f).unwrap(), h1);
        std::fs::write(&f, "two").unwrap();
        assert_ne!(hash_file(&f).unwrap(), h1);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn dir_name_uses_last_two_dirs_and_hash() {
        let name = cache_dir_name(Path::new("/home/user/papers/thesis/main.tex"));
        assert!(name.starts_with("papers_thesis_"), "{name}");
        assert_eq!(name.len(), "papers_thesis_".len() + 8);
        assert_ne!(name, cache_dir_name(Path::new("/other/papers/thesis/main.tex")));
    }

    #[test]
    fn no_record_then_fresh() {
        let (_dir, mut ctx, cache) = project();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::NoRecord)
        );
        let record = record_for(&ctx, &cache);
        cache.save(&record).unwrap();
        assert_eq!(cache.load().unwrap(), Some(record.clone()));
        assert_eq!(cache.evaluate(&mut ctx, TexMode::Pdf, false), CacheState::Fresh(record));
    }

    #[test]
    fn content_change_makes_stale() {
        let (_dir, mut ctx, cache) = project();
        cache.save(&record_for(&ctx, &cache)).unwrap();
        std::fs::write(ctx.project_root.join("intro.tex"), "changed").unwrap();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::Modified("intro.tex".to_string()))
        );
        std::fs::remove_file(ctx.project_root.join("intro.tex")).unwrap();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::Missing("intro.tex".to_string()))
        );
    }

    #[test]
    fn force_mode_and_trace_checks() {
        let (_dir, mut ctx, cache) = project();
        cache.save(&record_for(&ctx, &cache)).unwrap();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, true),
            CacheState::Stale(StaleReason::Forced)
        );
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Xelatex, false),
            CacheState::Stale(StaleReason::ModeMismatch)
        );
        std::fs::remove_file(cache.trace_path()).unwrap();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::TraceMissing)
        );
    }

    #[test]
    fn missing_artifact_makes_stale() {
        let (_dir, mut ctx, cache) = project();
        let mut record = record_for(&ctx, &cache);
        record.artifacts = vec!["main.bbl".to_string()];
        cache.save(&record).unwrap();
        std::fs::create_dir_all(cache.artifacts_dir()).unwrap();
        std::fs::write(cache.artifacts_dir().join("main.bbl"), "bbl").unwrap();
        assert!(cache.evaluate(&mut ctx, TexMode::Pdf, false).is_fresh());

        std::fs::remove_dir_all(cache.artifacts_dir()).unwrap();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::ArtifactMissing("main.bbl".to_string()))
        );
    }

    #[test]
    fn corrupt_record_is_stale_with_warning() {
        let (_dir, mut ctx, cache) = project();
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.record_path(), "{ not json").unwrap();
        assert!(matches!(cache.load(), Err(Error::CacheCorrupt { .. })));
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::Corrupt)
        );
        assert_eq!(ctx.warnings().len(), 1);
    }

    #[test]
    fn escaping_fingerprint_key_is_corrupt() {
        let (_dir, mut ctx, cache) = project();
        let mut record = record_for(&ctx, &cache);
        record.fingerprint.insert("../outside.tex".to_string(), "00".to_string());
        cache.save(&record).unwrap();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::Corrupt)
        );
    }

    #[test]
    fn version_mismatch() {
        let (_dir, mut ctx, cache) = project();
        let mut record = record_for(&ctx, &cache);
        record.version = CACHE_VERSION + 1;
        cache.save(&record).unwrap();
        assert_eq!(
            cache.evaluate(&mut ctx, TexMode::Pdf, false),
            CacheState::Stale(StaleReason::VersionMismatch)
        );
    }
}
