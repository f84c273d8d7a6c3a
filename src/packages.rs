//! `TeXPackages.json`: the TeX packages a build loaded.
//!
//! System packages are named after the directory their `.sty`/`.cls`/`.def`
//! lives in (`tex/latex/amsmath/amsmath.sty` gives `amsmath`). Fonts are
//! named after the directory following `/public/` in their path when there
//! is one. LaTeX's own `base` directory is not a package and is skipped.
//! Local packages are listed by file name.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::extension;
use crate::error::{Error, Result};
use crate::trace::{Origin, Trace, TraceKind};

/// Archive member name of the manifest.
pub const MANIFEST_NAME: &str = "TeXPackages.json";

const PACKAGE_EXTENSIONS: &[&str] = &["sty", "cls", "def"];
const FONT_EXTENSIONS: &[&str] = &["pfb", "tfm"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageManifest {
    #[serde(rename = "System")]
    pub system: BTreeSet<String>,
    #[serde(rename = "Local")]
    pub local: BTreeSet<String>,
}

impl PackageManifest {
    pub fn from_trace(trace: &Trace) -> Self {
        let mut manifest = Self::default();
        for record in trace.records.iter().filter(|r| r.kind == TraceKind::Input) {
            let Some(ext) = extension(&record.path) else {
                continue;
            };
            let is_package = PACKAGE_EXTENSIONS.contains(&ext.as_str());
            let is_font = FONT_EXTENSIONS.contains(&ext.as_str());

            match record.origin {
                Origin::System if is_package => {
                    if let Some(dir) = parent_name(&record.path).filter(|d| d != "base") {
                        manifest.system.insert(dir);
                    }
                }
                Origin::System if is_font => {
                    if let Some(dir) = font_package(&record.path) {
                        manifest.system.insert(dir);
                    }
                }
                Origin::Project if is_package => {
                    if let Some(name) = record.path.file_name() {
                        manifest.local.insert(name.to_string_lossy().into_owned());
                    }
                }
                _ => {}
            }
        }
        tracing::debug!(
            system = manifest.system.len(),
            local = manifest.local.len(),
            "collected package list"
        );
        manifest
    }

    /// Pretty JSON, newline terminated.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::InvalidInput(format!("cannot serialize package list: {e}")))?;
        json.push(b'\n');
        Ok(json)
    }
}

fn parent_name(path: &Path) -> Option<String> {
    path.parent()
        .and_then(Path::file_name)
        .map(|n| n.to_string_lossy().into_owned())
}

fn font_package(path: &Path) -> Option<String> {
    let text = path.to_string_lossy();
    if let Some(idx) = text.find("/public/") {
        let rest = &text[idx + "/public/".len()..];
        if let Some(end) = rest.find('/') {
            return Some(rest[..end].to_string());
        }
    }
    parent_name(path)
}
