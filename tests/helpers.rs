//! Shared test utilities for tartex tests.

#![allow(dead_code)]

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tartex::archive::{ConflictResolver, Resolution};
use tartex::config::Config;
use tempfile::TempDir;

/// Stand-in for latexmk. Records its arguments, then writes
/// `<outdir>/<stem>.fls` from `trace.fls.in` (with `@OUT@` and `@PWD@`
/// substituted) and a fake PDF. Marker files next to it change behavior:
/// `sleep` (seconds a child process hangs for; its pid goes to `child.pid`),
/// `fail` (log text to print before exiting 12), `bbl` (copied to
/// `<outdir>/<stem>.bbl`).
const FAKE_LATEXMK: &str = r#"#!/bin/sh
set -e
here="$(cd "$(dirname "$0")" && pwd -P)"
echo "$@" >> "$here/calls"
outdir=""
main=""
for arg in "$@"; do
  case "$arg" in
    -outdir=*) outdir="${arg#-outdir=}" ;;
    -*) ;;
    *) main="$arg" ;;
  esac
done
if [ -f "$here/sleep" ]; then
  sleep "$(cat "$here/sleep")" &
  echo $! > "$here/child.pid"
  wait
  exit 0
fi
if [ -f "$here/fail" ]; then cat "$here/fail"; exit 12; fi
stem="${main%.tex}"
pwd="$(pwd -P)"
sed -e "s|@OUT@|$outdir|g" -e "s|@PWD@|$pwd|g" "$here/trace.fls.in" > "$outdir/$stem.fls"
printf '%%PDF-1.4 fake\n' > "$outdir/$stem.pdf"
if [ -f "$here/bbl" ]; then cp "$here/bbl" "$outdir/$stem.bbl"; fi
exit 0
"#;

/// Trace of the `paper.tex` project: two project sources, a system class,
/// and the usual latexmk byproducts in the build directory.
pub const PAPER_TRACE: &str = "PWD @PWD@
INPUT /usr/share/texmf/tex/latex/base/article.cls
INPUT paper.tex
INPUT intro.tex
INPUT @OUT@/paper.aux
OUTPUT @OUT@/paper.aux
OUTPUT @OUT@/paper.log
OUTPUT @OUT@/paper.pdf
";

/// A scratch LaTeX project with a fake latexmk and its own cache directory.
pub struct TestProject {
    /// Temporary directory (kept alive for lifetime of TestProject)
    pub _temp_dir: TempDir,
    /// Project directory (holds the main file)
    pub root: PathBuf,
    /// Directory holding the fake latexmk and its marker files
    pub bin: PathBuf,
    /// Cache root handed to tartex
    pub cache: PathBuf,
    /// Seconds before a compile is abandoned
    pub timeout: String,
}

impl TestProject {
    /// Create an empty project with a fake latexmk producing `trace`.
    pub fn new(trace: &str) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp dir");

        let root = base.join("project");
        let bin = base.join("bin");
        let cache = base.join("cache");
        fs::create_dir_all(&root).expect("Failed to create project dir");
        fs::create_dir_all(&bin).expect("Failed to create bin dir");

        let latexmk = bin.join("latexmk");
        fs::write(&latexmk, FAKE_LATEXMK).expect("Failed to write fake latexmk");
        let mut perms = fs::metadata(&latexmk).expect("Failed to get metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&latexmk, perms).expect("Failed to set permissions");
        fs::write(bin.join("trace.fls.in"), trace).expect("Failed to write trace template");

        Self {
            _temp_dir: temp_dir,
            root,
            bin,
            cache,
            timeout: "30".to_string(),
        }
    }

    /// The `paper.tex` project: `paper.tex`, `intro.tex` and an untraced
    /// `figures/plot.pdf`.
    pub fn paper() -> Self {
        let project = Self::new(PAPER_TRACE);
        project.write(
            "paper.tex",
            "\\documentclass{article}\n\\begin{document}\n\\input{intro}\n\\end{document}\n",
        );
        project.write("intro.tex", "Hello.\n");
        project.write("figures/plot.pdf", "%PDF-1.4 plot\n");
        project
    }

    /// Write a project file, creating parent directories.
    pub fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, content).expect("Failed to write project file");
        path
    }

    /// A path next to (not inside) the project directory.
    pub fn out(&self, name: &str) -> PathBuf {
        self.root.with_file_name(name)
    }

    /// Create (or replace) a marker file for the fake latexmk.
    pub fn set_marker(&self, name: &str, content: &str) {
        fs::write(self.bin.join(name), content).expect("Failed to write marker");
    }

    /// Number of times latexmk ran.
    pub fn compile_count(&self) -> usize {
        fs::read_to_string(self.bin.join("calls"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// Configuration pointing at the fake latexmk and the scratch cache.
    pub fn config(&self) -> Config {
        let latexmk = self.bin.join("latexmk").display().to_string();
        let cache = self.cache.display().to_string();
        let timeout = self.timeout.clone();
        Config::from_lookup(move |key| match key {
            "TARTEX_LATEXMK" => Some(latexmk.clone()),
            "TARTEX_CACHE_DIR" => Some(cache.clone()),
            "TARTEX_COMPILE_TIMEOUT" => Some(timeout.clone()),
            _ => None,
        })
    }

    /// Options for archiving `main` with everything else at defaults.
    pub fn options(&self, main: &str) -> tartex::pipeline::Options {
        tartex::pipeline::Options {
            input: self.root.join(main),
            ..Default::default()
        }
    }
}

/// Answers conflicts from a script, then aborts.
pub struct ScriptedResolver {
    pub answers: Vec<Resolution>,
    pub asked: Vec<PathBuf>,
}

impl ScriptedResolver {
    pub fn new(answers: Vec<Resolution>) -> Self {
        Self {
            answers,
            asked: Vec::new(),
        }
    }
}

impl ConflictResolver for ScriptedResolver {
    fn resolve(&mut self, existing: &Path) -> Resolution {
        self.asked.push(existing.to_path_buf());
        if self.answers.is_empty() {
            Resolution::Abort
        } else {
            self.answers.remove(0)
        }
    }
}

/// True while `pid` names a live (not zombie) process.
pub fn process_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        // state is the field after the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Content of one member of a (possibly compressed) tar archive.
pub fn read_member(archive: &Path, name: &str) -> Option<Vec<u8>> {
    let data = fs::read(archive).expect("Failed to read archive");
    let raw = decompress(&data);
    let mut tar = tar::Archive::new(raw.as_slice());
    for entry in tar.entries().expect("Failed to read tar entries") {
        let mut entry = entry.expect("Failed to read tar entry");
        let path = entry.path().expect("Bad entry path").to_string_lossy().into_owned();
        if path == name {
            let mut out = Vec::new();
            entry.read_to_end(&mut out).expect("Failed to read tar member");
            return Some(out);
        }
    }
    None
}

fn decompress(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    if data.starts_with(&[0x1f, 0x8b]) {
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .expect("Failed to gunzip");
    } else if data.starts_with(b"BZh") {
        bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut out)
            .expect("Failed to bunzip2");
    } else if data.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        xz2::read::XzDecoder::new(data)
            .read_to_end(&mut out)
            .expect("Failed to unxz");
    } else {
        out.extend_from_slice(data);
    }
    out
}

/// Run git in `dir`, returning trimmed stdout.
pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// True when a usable git is on PATH.
pub fn have_git() -> bool {
    tartex::process::exists("git")
}

/// Turn the project into a repository on `main` with everything committed.
pub fn init_repo(dir: &Path) {
    run_git(dir, &["init", "--quiet", "--initial-branch=main"]);
    run_git(dir, &["config", "user.name", "test-user"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
    run_git(dir, &["config", "commit.gpgsign", "false"]);
    commit_all(dir, "initial");
}

pub fn commit_all(dir: &Path, message: &str) {
    run_git(dir, &["add", "-A"]);
    run_git(dir, &["commit", "--quiet", "-m", message]);
}

/// Assert a path exists.
pub fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "Expected file to exist: {}", path.display());
}
