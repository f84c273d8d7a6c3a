//! Utilities for lexical path handling.
//!
//! Trace files name paths that may no longer exist (the temporary build
//! directory is gone by the time a cached trace is reused), so everything
//! here works on the path text and never touches the filesystem.

use std::path::{Component, Path, PathBuf};

/// Normalize a path lexically: drop `.` components and fold `..` into the
/// preceding component.
///
/// `..` at the root of an absolute path is discarded; leading `..` in a
/// relative path is kept.
///
/// # Example
/// ```
/// use std::path::Path;
/// use tartex::common::normalize;
///
/// assert_eq!(normalize(Path::new("/a/./b/../c.tex")), Path::new("/a/c.tex"));
/// ```
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `path` against `base` unless it is already absolute, then
/// normalize.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Forward-slash form of a relative path, as used for archive entry names,
/// pattern matching, and cache fingerprint keys.
pub fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// The lowercase extension of `path` without the dot, if any.
pub fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dots() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(normalize(Path::new("a/b/../../c")), PathBuf::from("c"));
        assert_eq!(normalize(Path::new("../x")), PathBuf::from("../x"));
        assert_eq!(normalize(Path::new("/../x")), PathBuf::from("/x"));
    }

    #[test]
    fn resolve_relative_and_absolute() {
        let base = Path::new("/proj");
        assert_eq!(resolve(base, Path::new("ch/intro.tex")), PathBuf::from("/proj/ch/intro.tex"));
        assert_eq!(resolve(base, Path::new("./main.tex")), PathBuf::from("/proj/main.tex"));
        assert_eq!(
            resolve(base, Path::new("/usr/share/texmf/article.cls")),
            PathBuf::from("/usr/share/texmf/article.cls")
        );
    }

    #[test]
    fn expand_tilde_only_leading() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_tilde(Path::new("~/out.tar.gz")), home.join("out.tar.gz"));
        assert_eq!(expand_tilde(Path::new("a/~/b")), PathBuf::from("a/~/b"));
        assert_eq!(expand_tilde(Path::new("~user")), PathBuf::from("~user"));
    }

    #[test]
    fn slash_path_joins_components() {
        assert_eq!(slash_path(Path::new("figures/plot.pdf")), "figures/plot.pdf");
        assert_eq!(slash_path(Path::new("./a/b")), "a/b");
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension(Path::new("fig.PDF")).as_deref(), Some("pdf"));
        assert_eq!(extension(Path::new("Makefile")), None);
    }
}
