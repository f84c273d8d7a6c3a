//! Configuration management for tartex.
//!
//! Reads configuration from environment variables (a `.env` file is loaded
//! into the environment by the binary before this runs). Every setting has a
//! default, so an empty environment is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default latexmk executable.
pub const DEFAULT_LATEXMK: &str = "latexmk";

/// Default git executable.
pub const DEFAULT_GIT: &str = "git";

/// Default wall-clock limit for one latexmk run.
pub const DEFAULT_COMPILE_TIMEOUT: Duration = Duration::from_secs(300);

/// Tartex configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// latexmk program name or path (TARTEX_LATEXMK)
    pub latexmk: String,
    /// git program name or path (TARTEX_GIT)
    pub git: String,
    /// Compile timeout (TARTEX_COMPILE_TIMEOUT, seconds)
    pub compile_timeout: Duration,
    /// Root of the per-project cache directories (TARTEX_CACHE_DIR)
    pub cache_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let latexmk = lookup("TARTEX_LATEXMK")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LATEXMK.to_string());

        let git = lookup("TARTEX_GIT")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GIT.to_string());

        let compile_timeout = match lookup("TARTEX_COMPILE_TIMEOUT") {
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 => Duration::from_secs_f64(secs),
                _ => {
                    tracing::warn!(
                        value = %raw,
                        "ignoring invalid TARTEX_COMPILE_TIMEOUT, using default"
                    );
                    DEFAULT_COMPILE_TIMEOUT
                }
            },
            None => DEFAULT_COMPILE_TIMEOUT,
        };

        // XDG_CACHE_HOME is honoured by dirs::cache_dir on Linux; the explicit
        // lookup keeps from_lookup self-contained.
        let cache_root = lookup("TARTEX_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| lookup("XDG_CACHE_HOME").map(|p| PathBuf::from(p).join("tartex")))
            .or_else(|| dirs::cache_dir().map(|p| p.join("tartex")))
            .unwrap_or_else(|| std::env::temp_dir().join("tartex-cache"));

        Self {
            latexmk,
            git,
            compile_timeout,
            cache_root,
        }
    }

    /// Log the effective configuration at debug level.
    pub fn log(&self) {
        tracing::debug!(
            latexmk = %self.latexmk,
            git = %self.git,
            compile_timeout_secs = self.compile_timeout.as_secs_f64(),
            cache_root = %self.cache_root.display(),
            "configuration"
        );
    }
}
