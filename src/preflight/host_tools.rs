//! Host tool availability checks.

use crate::config::Config;
use crate::process;

use super::types::CheckResult;

/// Which external tools this run will call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ToolNeeds {
    pub latexmk: bool,
    pub git: bool,
}

/// Check the configured host tools are installed.
pub fn check_host_tools(config: &Config, needs: ToolNeeds) -> Vec<CheckResult> {
    let tools = [
        (
            config.latexmk.as_str(),
            needs.latexmk,
            "latexmk",
            "Required to compile .tex input. \
             Install latexmk (usually with your TeX distribution) or set TARTEX_LATEXMK.",
        ),
        (
            config.git.as_str(),
            needs.git,
            "git",
            "Required for --git-rev and for --check inside a repository. \
             Install git or set TARTEX_GIT.",
        ),
    ];

    tools
        .into_iter()
        .map(|(program, needed, name, hint)| {
            if needed {
                check_tool_exists(program, name, hint)
            } else {
                CheckResult::skip(name, "not needed for this run")
            }
        })
        .collect()
}

/// Check if a tool exists in PATH (or at the configured path).
fn check_tool_exists(program: &str, name: &str, hint: &str) -> CheckResult {
    match process::which(program) {
        Some(path) => CheckResult::pass_with(name, &path.display().to_string()),
        None => CheckResult::fail(name, &format!("'{program}' not found. {hint}")),
    }
}
