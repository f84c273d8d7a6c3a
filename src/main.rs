//! tartex - archive exactly the files a LaTeX project needs to compile.
//!
//! Compiles the project with latexmk (or reuses a cached build), reads the
//! recorder trace, and packs the project sources plus the generated files a
//! recompile needs into a tarball.

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser};
use tracing_subscriber::EnvFilter;

use tartex::archive::{Compression, ConflictResolver, Resolution};
use tartex::compile::TexMode;
use tartex::config::Config;
use tartex::pipeline::{self, Options};
use tartex::report::RunMode;

#[derive(Parser)]
#[command(name = "tartex", version)]
#[command(about = "Build a tarball of the files needed to compile a LaTeX project")]
#[command(
    after_help = concat!(
        "EXAMPLES:\n",
        "  tartex paper.tex              Archive paper.tex and everything it needs\n",
        "  tartex -l paper               List the files instead\n",
        "  tartex -b -o out.tar paper    Include .bib/.bst, write an uncompressed tar\n",
        "  tartex --git-rev=v1 paper     Archive the project as of tag v1",
    )
)]
struct Cli {
    /// Main .tex file (suffix optional) or a .fls trace
    file: PathBuf,

    /// Comma-separated globs of extra files to include
    #[arg(short = 'a', long = "add", value_name = "GLOBS", action = ArgAction::Append)]
    add: Vec<String>,

    /// Comma-separated globs of files to leave out
    #[arg(short = 'x', long = "excl", value_name = "GLOBS", action = ArgAction::Append)]
    excl: Vec<String>,

    /// Include .bib and .bst files
    #[arg(short, long)]
    bib: bool,

    /// List the files that would be archived and exit
    #[arg(short, long)]
    list: bool,

    /// Output archive name or directory; the suffix picks the compression
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,

    #[command(flatten)]
    compression: CompressionArgs,

    /// More output (-v files and reasons, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Ignore the cache and recompile
    #[arg(short = 'F', long)]
    force_recompile: bool,

    /// Force the TeX processing mode
    /// (dvi, luatex, lualatex, pdf, pdflua, ps, xdv, xelatex)
    #[arg(long = "latexmk-tex", value_name = "MODE")]
    latexmk_tex: Option<TexMode>,

    /// Include the compiled PDF
    #[arg(long)]
    with_pdf: bool,

    /// Add a TeXPackages.json listing the TeX packages used
    #[arg(short, long)]
    packages: bool,

    /// Archive the project at a git revision (HEAD when no value is given)
    #[arg(
        short = 'g',
        long = "git-rev",
        value_name = "REV",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "HEAD"
    )]
    git_rev: Option<String>,

    /// Overwrite an existing archive without asking
    #[arg(long)]
    overwrite: bool,

    /// Report files missing from (or unneeded in) the project instead of archiving
    #[arg(short, long)]
    check: bool,

    /// Print a summary at the end
    #[arg(short, long)]
    summary: bool,
}

#[derive(Args)]
#[group(multiple = false)]
struct CompressionArgs {
    /// Compress with bzip2
    #[arg(short = 'j', long = "bzip2")]
    bzip2: bool,

    /// Compress with xz
    #[arg(short = 'J', long = "xz")]
    xz: bool,

    /// Compress with gzip
    #[arg(short = 'z', long = "gzip")]
    gzip: bool,

    /// Write a plain tar
    #[arg(long = "no-compress")]
    no_compress: bool,
}

impl CompressionArgs {
    fn forced(&self) -> Option<Compression> {
        if self.bzip2 {
            Some(Compression::Bzip2)
        } else if self.xz {
            Some(Compression::Xz)
        } else if self.gzip {
            Some(Compression::Gzip)
        } else if self.no_compress {
            Some(Compression::None)
        } else {
            None
        }
    }
}

impl Cli {
    fn options(&self) -> Options {
        Options {
            input: self.file.clone(),
            includes: self.add.clone(),
            excludes: self.excl.clone(),
            bibliography: self.bib,
            list: self.list,
            check: self.check,
            output: self.output.clone(),
            compression: self.compression.forced(),
            force_recompile: self.force_recompile,
            tex_mode: self.latexmk_tex,
            with_pdf: self.with_pdf,
            packages: self.packages,
            git_rev: self.git_rev.clone(),
            overwrite: self.overwrite,
        }
    }
}

/// Asks on the terminal; refuses when stdin is not one.
struct TerminalResolver;

impl TerminalResolver {
    fn ask(question: &str) -> Option<String> {
        eprint!("{question}");
        // An unflushed prompt still reads the answer.
        io::stderr().flush().ok();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(answer.trim().to_string()),
        }
    }
}

impl ConflictResolver for TerminalResolver {
    fn resolve(&mut self, existing: &Path) -> Resolution {
        if !io::stdin().is_terminal() {
            eprintln!(
                "{} already exists; use --overwrite or -o to pick another name",
                existing.display()
            );
            return Resolution::Abort;
        }
        loop {
            let question = format!(
                "{} already exists. [o]verwrite/[c]hoose new name/[Q]uit: ",
                existing.display()
            );
            let Some(answer) = Self::ask(&question) else {
                return Resolution::Abort;
            };
            match answer.to_lowercase().as_str() {
                "o" | "overwrite" => return Resolution::Overwrite,
                "c" | "choose" => match Self::ask("New archive name: ") {
                    Some(name) if !name.is_empty() => {
                        return Resolution::Rename(PathBuf::from(name))
                    }
                    Some(_) => continue,
                    None => return Resolution::Abort,
                },
                "" | "q" | "quit" => return Resolution::Abort,
                _ => continue,
            }
        }
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("tartex={level}"))),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let config = Config::load();
    config.log();
    let cwd = std::env::current_dir().context("cannot determine the current directory")?;

    let opts = cli.options();
    let report = pipeline::run(&opts, &config, &mut TerminalResolver, &cwd)?;

    if report.mode == RunMode::List {
        print!("{}", report.format_listing());
    }
    if cli.verbose > 0 {
        print!("{}", report.format_reasons());
    }
    if let Some(check) = &report.check {
        print!("{}", check.format());
    }
    if cli.summary {
        print!("{}", report.format_summary());
    }

    match &report.check {
        Some(check) if !check.is_complete() => Ok(ExitCode::FAILURE),
        _ => Ok(ExitCode::SUCCESS),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load .env if present
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = e
                .downcast_ref::<tartex::Error>()
                .map(|e| e.exit_code() as u8)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
