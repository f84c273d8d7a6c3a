//! Git revision selection.
//!
//! [`with_revision`] checks out a requested revision for the duration of a
//! closure and puts the original `HEAD` back afterwards, on success, on error
//! and (through a drop guard) on panic. The working tree must be clean before
//! anything is switched.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::process::{Cmd, CommandResult};

/// What `HEAD` pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    Branch(String),
    Detached(String),
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Head::Branch(name) => f.write_str(name),
            Head::Detached(sha) => write!(f, "{sha} (detached)"),
        }
    }
}

/// A git work tree driven through the `git` executable.
#[derive(Debug, Clone)]
pub struct GitRepo {
    git: String,
    root: PathBuf,
}

impl GitRepo {
    /// Find the repository containing `dir`.
    pub fn discover(git: &str, dir: &Path) -> Result<Self> {
        let out = Cmd::new(git)
            .dir(dir)
            .args(["rev-parse", "--show-toplevel"])
            .run()
            .map_err(|e| git_error("rev-parse --show-toplevel", e))?;
        let root = PathBuf::from(out.stdout_trimmed());
        let root = root.canonicalize().map_err(|e| Error::io(&root, e))?;
        Ok(Self {
            git: git.to_string(),
            root,
        })
    }

    /// True if `dir` is inside a git work tree (false also when git is missing).
    pub fn is_repo(git: &str, dir: &Path) -> bool {
        Cmd::new(git)
            .dir(dir)
            .args(["rev-parse", "--is-inside-work-tree"])
            .allow_fail()
            .run()
            .map(|o| o.success() && o.stdout_trimmed() == "true")
            .unwrap_or(false)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn git_in(&self, dir: &Path, args: &[&str]) -> Result<CommandResult> {
        Cmd::new(&self.git)
            .dir(dir)
            .args(args)
            .run()
            .map_err(|e| git_error(&args.join(" "), e))
    }

    fn git(&self, args: &[&str]) -> Result<CommandResult> {
        self.git_in(&self.root, args)
    }

    /// Full commit id of a revision.
    pub fn resolve(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self
            .git(&["rev-parse", "--verify", "--quiet", spec.as_str()])
            .map_err(|e| match e {
                Error::Git { command, stderr } if stderr.is_empty() => Error::Git {
                    command,
                    stderr: format!("unknown revision '{rev}'"),
                },
                other => other,
            })?;
        Ok(out.stdout_trimmed().to_string())
    }

    /// Current branch, or the commit id when detached.
    pub fn head(&self) -> Result<Head> {
        let out = Cmd::new(&self.git)
            .dir(&self.root)
            .args(["symbolic-ref", "--quiet", "--short", "HEAD"])
            .allow_fail()
            .run()?;
        if out.success() && !out.stdout_trimmed().is_empty() {
            return Ok(Head::Branch(out.stdout_trimmed().to_string()));
        }
        Ok(Head::Detached(self.resolve("HEAD")?))
    }

    /// No staged or unstaged changes to tracked files.
    pub fn is_clean(&self) -> Result<bool> {
        let out = self.git(&["status", "--porcelain", "--untracked-files=no"])?;
        Ok(out.stdout_trimmed().is_empty())
    }

    fn checkout_commit(&self, commit: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", "--detach", commit])?;
        Ok(())
    }

    fn restore(&self, head: &Head) -> Result<()> {
        match head {
            Head::Branch(name) => self.git(&["checkout", "--quiet", name.as_str()])?,
            Head::Detached(sha) => self.git(&["checkout", "--quiet", "--detach", sha.as_str()])?,
        };
        Ok(())
    }

    /// Exact tag pointing at `rev`, else `git.<short id>`.
    pub fn describe(&self, rev: &str) -> Result<String> {
        let tag = Cmd::new(&self.git)
            .dir(&self.root)
            .args(["describe", "--tags", "--exact-match", rev])
            .allow_fail()
            .run()?;
        if tag.success() && !tag.stdout_trimmed().is_empty() {
            return Ok(tag.stdout_trimmed().to_string());
        }
        let short = self.git(&["rev-parse", "--short", rev])?;
        Ok(format!("git.{}", short.stdout_trimmed()))
    }

    /// Committer timestamp of `rev`, in seconds since the epoch.
    pub fn commit_time(&self, rev: &str) -> Result<u64> {
        let out = self.git(&["log", "-1", "--format=%ct", rev])?;
        out.stdout_trimmed().parse().map_err(|_| Error::Git {
            command: format!("log -1 --format=%ct {rev}"),
            stderr: format!("unexpected commit time '{}'", out.stdout_trimmed()),
        })
    }

    /// Files tracked at `rev` below `dir`, relative to `dir`.
    pub fn tracked_files(&self, rev: &str, dir: &Path) -> Result<Vec<PathBuf>> {
        let out = self.git_in(dir, &["ls-tree", "-r", "--name-only", rev])?;
        Ok(out.lines().map(PathBuf::from).collect())
    }
}

fn git_error(command: &str, err: Error) -> Error {
    match err {
        Error::Command { stderr, .. } => Error::Git {
            command: command.to_string(),
            stderr,
        },
        other => other,
    }
}

/// The checkout a closure runs under.
#[derive(Debug, Clone)]
pub struct RevisionContext {
    pub requested_rev: String,
    /// Full commit id of the requested revision.
    pub commit: String,
    /// Tag name or `git.<short id>`.
    pub id: String,
    /// Committer timestamp of `commit`.
    pub commit_time: u64,
    pub original_head: Head,
    pub worktree_root: PathBuf,
    /// Tracked files had no local changes when the run started.
    pub is_clean: bool,
    /// `HEAD` was moved for this run.
    pub switched: bool,
}

/// Restores the original head when dropped without [`RestoreGuard::restore`].
struct RestoreGuard<'a> {
    repo: &'a GitRepo,
    original: Head,
    armed: bool,
}

impl RestoreGuard<'_> {
    fn restore(mut self) -> Result<()> {
        self.armed = false;
        tracing::debug!(head = %self.original, "restoring original checkout");
        self.repo.restore(&self.original)
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.repo.restore(&self.original) {
                tracing::error!(
                    "failed to restore git checkout to '{}': {e}",
                    self.original
                );
            }
        }
    }
}

/// Run `body` with the work tree at `rev`, restoring the original head after.
///
/// A dirty tree is rejected before anything changes, unless `rev` is already
/// checked out (then nothing is switched). If restoring fails the result is
/// [`Error::RevisionRestore`], carrying the body's error when there was one.
pub fn with_revision<T, F>(repo: &GitRepo, rev: &str, body: F) -> Result<T>
where
    F: FnOnce(&RevisionContext) -> Result<T>,
{
    let original_head = repo.head()?;
    let current = repo.resolve("HEAD")?;
    let commit = repo.resolve(rev)?;
    let is_clean = repo.is_clean()?;
    let id = repo.describe(&commit)?;
    let commit_time = repo.commit_time(&commit)?;
    let switched = commit != current;

    let ctx = RevisionContext {
        requested_rev: rev.to_string(),
        commit,
        id,
        commit_time,
        original_head,
        worktree_root: repo.root().to_path_buf(),
        is_clean,
        switched,
    };

    if !switched {
        tracing::debug!(rev, "requested revision is already checked out");
        return body(&ctx);
    }

    if !is_clean {
        return Err(Error::DirtyWorkingTree {
            repo: repo.root().to_path_buf(),
            rev: rev.to_string(),
        });
    }

    tracing::info!(rev, commit = %ctx.commit, "checking out revision");
    repo.checkout_commit(&ctx.commit)?;
    let guard = RestoreGuard {
        repo,
        original: ctx.original_head.clone(),
        armed: true,
    };

    let result = body(&ctx);
    let restored = guard.restore();

    match (result, restored) {
        (result, Ok(())) => result,
        (Ok(_), Err(restore)) => Err(Error::RevisionRestore {
            original: ctx.original_head.to_string(),
            source: Box::new(restore),
            trigger: None,
        }),
        (Err(trigger), Err(restore)) => Err(Error::RevisionRestore {
            original: ctx.original_head.to_string(),
            source: Box::new(restore),
            trigger: Some(Box::new(trigger)),
        }),
    }
}
