//! latexmk invocation.
//!
//! The build always runs with `-outdir` pointing at a fresh temporary
//! directory, so the project tree is never written to. The directory lives as
//! long as the returned [`CompileOutput`] and is removed when it drops,
//! whatever happened in between.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use tempfile::TempDir;

use crate::config::Config;
use crate::context::RunContext;
use crate::error::{Error, Result};

/// Processing modes accepted by `latexmk -<mode>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexMode {
    Dvi,
    Luatex,
    Lualatex,
    Pdf,
    Pdflua,
    Ps,
    Xdv,
    Xelatex,
}

impl TexMode {
    pub const ALL: [TexMode; 8] = [
        TexMode::Dvi,
        TexMode::Luatex,
        TexMode::Lualatex,
        TexMode::Pdf,
        TexMode::Pdflua,
        TexMode::Ps,
        TexMode::Xdv,
        TexMode::Xelatex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TexMode::Dvi => "dvi",
            TexMode::Luatex => "luatex",
            TexMode::Lualatex => "lualatex",
            TexMode::Pdf => "pdf",
            TexMode::Pdflua => "pdflua",
            TexMode::Ps => "ps",
            TexMode::Xdv => "xdv",
            TexMode::Xelatex => "xelatex",
        }
    }

    /// The `latexmk` switch for this mode.
    pub fn flag(self) -> String {
        format!("-{}", self.as_str())
    }

    /// Map a `% !TEX program = ...` engine name to a mode.
    fn from_engine(engine: &str) -> Option<Self> {
        match engine.to_ascii_lowercase().as_str() {
            "pdflatex" | "pdftex" => Some(TexMode::Pdf),
            "xelatex" | "xetex" => Some(TexMode::Xelatex),
            "lualatex" | "luatex" => Some(TexMode::Lualatex),
            "latex" => Some(TexMode::Dvi),
            _ => None,
        }
    }
}

impl fmt::Display for TexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TexMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        TexMode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<_> = TexMode::ALL.iter().map(|m| m.as_str()).collect();
                format!("unknown TeX mode '{s}' (expected one of: {})", valid.join(", "))
            })
    }
}

/// Pick a processing mode from the main file's contents.
///
/// A `% !TEX program = <engine>` magic comment wins; loading `pstricks`
/// selects PostScript; anything else builds a PDF.
pub fn detect_mode(tex: &str) -> TexMode {
    static MAGIC: OnceLock<Regex> = OnceLock::new();
    static PSTRICKS: OnceLock<Regex> = OnceLock::new();

    let magic = MAGIC.get_or_init(|| {
        Regex::new(r"(?mi)^\s*%\s*!\s*TEX\s+(?:TS-)?program\s*=\s*(\S+)").expect("static regex")
    });
    if let Some(mode) = magic
        .captures(tex)
        .and_then(|c| TexMode::from_engine(&c[1]))
    {
        return mode;
    }

    let pstricks = PSTRICKS.get_or_init(|| {
        Regex::new(r"(?m)^[^%\n]*\\usepackage\s*(?:\[[^\]]*\])?\s*\{[^}]*\bpstricks\b")
            .expect("static regex")
    });
    if pstricks.is_match(tex) {
        return TexMode::Ps;
    }
    TexMode::Pdf
}

/// Mode for a run: the explicit choice, or detection from the main file.
pub fn resolve_mode(ctx: &RunContext, explicit: Option<TexMode>) -> Result<TexMode> {
    if let Some(mode) = explicit {
        return Ok(mode);
    }
    let tex = std::fs::read_to_string(&ctx.main_file).map_err(|e| Error::io(&ctx.main_file, e))?;
    let mode = detect_mode(&tex);
    tracing::debug!(%mode, "detected TeX processing mode");
    Ok(mode)
}

/// A finished build. Dropping it deletes the build directory.
#[derive(Debug)]
pub struct CompileOutput {
    /// Canonical path of the build directory.
    pub build_dir: PathBuf,
    /// The recorder trace, `<build_dir>/<stem>.fls`.
    pub trace: PathBuf,
    pub mode: TexMode,
    _dir: TempDir,
}

impl CompileOutput {
    /// The compiled PDF, if the mode produced one.
    pub fn pdf(&self, stem: &str) -> Option<PathBuf> {
        let pdf = self.build_dir.join(format!("{stem}.pdf"));
        pdf.is_file().then_some(pdf)
    }
}

/// Arguments passed to latexmk, without the program name.
pub fn latexmk_args(mode: TexMode, build_dir: &Path, main_name: &str) -> Vec<String> {
    vec![
        mode.flag(),
        "-f".to_string(),
        "-cd".to_string(),
        format!("-outdir={}", build_dir.display()),
        "-interaction=nonstopmode".to_string(),
        main_name.to_string(),
    ]
}

/// Compile the main file in a temporary directory.
pub fn compile(ctx: &RunContext, config: &Config, mode: TexMode) -> Result<CompileOutput> {
    let dir = tempfile::Builder::new()
        .prefix("tartex-")
        .tempdir()
        .map_err(|e| Error::io(std::env::temp_dir(), e))?;
    let build_dir = dir
        .path()
        .canonicalize()
        .map_err(|e| Error::io(dir.path(), e))?;

    let args = latexmk_args(mode, &build_dir, &ctx.main_name());
    let command_line = format!("{} {}", config.latexmk, args.join(" "));
    tracing::info!(command = %command_line, "compiling LaTeX project");

    let mut std_cmd = std::process::Command::new(&config.latexmk);
    std_cmd
        .args(&args)
        .current_dir(&ctx.project_root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // latexmk's engines and bibtex/biber share its group, so a timeout can
    // take them all down.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut std_cmd, 0);
    let mut cmd = tokio::process::Command::from(std_cmd);
    cmd.kill_on_drop(true);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::io(&build_dir, e))?;

    let timeout = config.compile_timeout;
    let (pid, waited) = runtime
        .block_on(async {
            let child = cmd.spawn()?;
            let pid = child.id();
            let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
            Ok::<_, std::io::Error>((pid, waited))
        })
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::MissingTool {
                    tool: config.latexmk.clone(),
                    hint: "install latexmk (usually shipped with TeX Live or MiKTeX) \
                           or set TARTEX_LATEXMK"
                        .to_string(),
                }
            } else {
                Error::io(PathBuf::from(&config.latexmk), e)
            }
        })?;

    let output = match waited {
        Ok(output) => output.map_err(|e| Error::io(PathBuf::from(&config.latexmk), e))?,
        Err(_) => {
            kill_process_group(pid);
            return Err(Error::CompileTimeout {
                command: command_line,
                timeout,
            });
        }
    };

    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let summary = summarize_errors(&text);
        return Err(Error::CompileFailed {
            command: command_line,
            code: output.status.code().unwrap_or(-1),
            output: text,
            summary,
        });
    }

    let trace = build_dir.join(format!("{}.fls", ctx.stem()));
    if !trace.is_file() {
        return Err(Error::MissingFile { path: trace });
    }
    tracing::info!(trace = %trace.display(), "LaTeX project compiled");

    Ok(CompileOutput {
        build_dir,
        trace,
        mode,
        _dir: dir,
    })
}

/// Kill whatever is left of a timed-out build's process group.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; a group that is already gone
    // reports ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "latexmk process group already gone"
        );
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// Pick the lines worth showing from a failed build's output.
///
/// Each recognised error becomes one line, e.g.
/// `l.7 [Undefined control sequence]: \foo`. Order of first appearance;
/// duplicates dropped.
pub fn summarize_errors(output: &str) -> Vec<String> {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            (r"(?m)^! LaTeX Error: (Environment .* undefined)\.\r?$", "$1"),
            (r"(?m)^! LaTeX Error: (Missing \\begin\{document\})\.\r?$", "$1"),
            (r"(?m)^(.*)\r?\n! (Emergency stop)\.\r?$", "$2: $1"),
            (r"(?m)^! LaTeX Error: (File `.*' not found\.)\r?$", "$1"),
            (r"(?m)^! (Package.* Error: .* not found):", "$1"),
            (r"(?m)^! (Undefined control sequence)\.\r?\n(l\.\d+)\s*(.*?)\r?$", "$2 [$1]: $3"),
            (r"(?m)^! (Too many \}'s)\.\r?\n(l\.\d+)\s*(.*?)\r?$", "$2 [$1]: $3"),
            (
                r"(?m)^! (Missing \$ inserted)\.\r?\n(?:.*\n){0,2}(l\.\d+)\s*(.*?)\r?$",
                "$2 [$1]: $3",
            ),
            (
                r"(?m)^! (Misplaced alignment tab character &)\.\r?\n(l\.\d+)\s*(.*?)\r?$",
                "$2 [$1]: $3",
            ),
            (r"(?m)^(Runaway argument\?)\r?$", "$1"),
        ]
        .into_iter()
        .map(|(re, rep)| (Regex::new(re).expect("static regex"), rep))
        .collect()
    });

    let mut found: Vec<(usize, String)> = Vec::new();
    for (re, replacement) in patterns {
        for caps in re.captures_iter(output) {
            let Some(m) = caps.get(0) else { continue };
            let mut line = String::new();
            caps.expand(replacement, &mut line);
            found.push((m.start(), line.trim().to_string()));
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut out: Vec<String> = Vec::new();
    for (_, line) in found {
        if !out.contains(&line) {
            out.push(line);
        }
    }
    out
}
