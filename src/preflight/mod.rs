//! Preflight checks for a tartex run.
//!
//! Validates the external tools the run will call before anything touches
//! the working tree, the cache or the output path.

mod host_tools;
mod types;

use crate::config::Config;
use crate::error::{Error, Result};

pub use host_tools::ToolNeeds;
pub use types::{CheckResult, CheckStatus, PreflightReport};

/// Run all preflight checks.
pub fn run_preflight(config: &Config, needs: ToolNeeds) -> PreflightReport {
    let checks = host_tools::check_host_tools(config, needs);
    PreflightReport { checks }
}

/// Run preflight and fail on the first missing tool.
pub fn run_preflight_or_fail(config: &Config, needs: ToolNeeds) -> Result<()> {
    let report = run_preflight(config, needs);
    report.log();

    if let Some(check) = report.failures().next() {
        return Err(Error::MissingTool {
            tool: check.name.clone(),
            hint: check.details.clone().unwrap_or_default(),
        });
    }

    tracing::debug!("all preflight checks passed");
    Ok(())
}
