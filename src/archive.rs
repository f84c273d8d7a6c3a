//! Archive writing.
//!
//! Output names follow a few rules:
//!
//! - the suffix picks the compression (`.tar`, `.tar.gz`/`.tgz`,
//!   `.tar.bz2`/`.tbz2`, `.tar.xz`/`.txz`); a bare `.gz`, `.bz2` or `.xz` gets
//!   `.tar` put in front of it;
//! - anything else gets `.tar.gz` appended, so `paper.v2` becomes
//!   `paper.v2.tar.gz`;
//! - an explicit compression replaces whatever suffix was given;
//! - a leading `~` is expanded, and an existing directory means "put the
//!   default name in here".
//!
//! Archives are reproducible: entries are sorted, owners are zeroed and the
//! gzip header carries no timestamp. The archive is written to a hidden
//! temporary file next to the target and only renamed into place once
//! complete, so a failure never leaves a truncated archive behind.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use flate2::GzBuilder;
use tar::{EntryType, Header};
use xz2::write::XzEncoder;

use crate::common::{expand_tilde, resolve};
use crate::error::{Error, Result};

/// Archive compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Bzip2,
    Xz,
}

impl Compression {
    /// Canonical file suffix.
    pub fn suffix(self) -> &'static str {
        match self {
            Compression::None => ".tar",
            Compression::Gzip => ".tar.gz",
            Compression::Bzip2 => ".tar.bz2",
            Compression::Xz => ".tar.xz",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
        };
        f.write_str(name)
    }
}

/// Recognised suffixes, longest first. The flag marks suffixes that lack
/// the `.tar` part.
const SUFFIXES: &[(&str, Compression, bool)] = &[
    (".tar.gz", Compression::Gzip, false),
    (".tar.bz2", Compression::Bzip2, false),
    (".tar.xz", Compression::Xz, false),
    (".tgz", Compression::Gzip, false),
    (".tbz2", Compression::Bzip2, false),
    (".tbz", Compression::Bzip2, false),
    (".txz", Compression::Xz, false),
    (".tar", Compression::None, false),
    (".gz", Compression::Gzip, true),
    (".bz2", Compression::Bzip2, true),
    (".xz", Compression::Xz, true),
];

/// Split a file name into stem and recognised archive suffix.
fn split_suffix(name: &str) -> (&str, Option<(&str, Compression, bool)>) {
    for &(suffix, compression, bare) in SUFFIXES {
        if name.len() > suffix.len() && name.ends_with(suffix) {
            return (&name[..name.len() - suffix.len()], Some((suffix, compression, bare)));
        }
    }
    (name, None)
}

/// True for names carrying a tar archive suffix (`.tar`, `.tar.gz`, `.tgz`, ...).
pub fn is_archive_name(name: &str) -> bool {
    matches!(split_suffix(name), (_, Some((_, _, false))))
}

/// Apply the suffix rules to a file name.
fn normalize_name(name: &str, forced: Option<Compression>) -> (String, Compression) {
    let (stem, found) = split_suffix(name);
    match (forced, found) {
        (Some(c), Some(_)) => (format!("{stem}{}", c.suffix()), c),
        (Some(c), None) => (format!("{name}{}", c.suffix()), c),
        (None, Some((_, c, true))) => (format!("{stem}{}", c.suffix()), c),
        (None, Some((_, c, false))) => (name.to_string(), c),
        (None, None) => (format!("{name}{}", Compression::Gzip.suffix()), Compression::Gzip),
    }
}

/// Where the archive goes and how it is compressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSpec {
    pub output_path: PathBuf,
    pub compression: Compression,
    pub overwrite: bool,
    forced: Option<Compression>,
    default_stem: String,
}

impl ArchiveSpec {
    /// Resolve the output target.
    ///
    /// Without `requested`, the archive is `<default_dir>/<default_stem>`
    /// plus suffix. A relative `requested` path is taken relative to `cwd`.
    pub fn resolve(
        requested: Option<&Path>,
        forced: Option<Compression>,
        default_stem: &str,
        default_dir: &Path,
        cwd: &Path,
    ) -> Result<Self> {
        let target = match requested {
            Some(path) => resolve(cwd, &expand_tilde(path)),
            None => default_dir.join(default_stem),
        };
        let target = if target.is_dir() {
            target.join(default_stem)
        } else {
            target
        };

        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::InvalidInput(format!("{} is not a valid archive name", target.display()))
            })?;
        let (name, compression) = normalize_name(&name, forced);

        Ok(Self {
            output_path: target.with_file_name(name),
            compression,
            overwrite: false,
            forced,
            default_stem: default_stem.to_string(),
        })
    }

    /// The same request under a new name. Relative names are taken relative
    /// to the current target's directory.
    pub fn renamed(&self, name: &Path) -> Result<Self> {
        let dir = self
            .output_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut spec = Self::resolve(Some(name), self.forced, &self.default_stem, &dir, &dir)?;
        spec.overwrite = self.overwrite;
        Ok(spec)
    }
}

/// Answer to an output-name conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Overwrite,
    Rename(PathBuf),
    Abort,
}

/// Decides what to do when the output archive already exists.
pub trait ConflictResolver {
    fn resolve(&mut self, existing: &Path) -> Resolution;
}

/// Never overwrite, never ask.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectConflicts;

impl ConflictResolver for RejectConflicts {
    fn resolve(&mut self, _existing: &Path) -> Resolution {
        Resolution::Abort
    }
}

/// Settle the final output path before any work is done.
pub fn resolve_conflicts(
    mut spec: ArchiveSpec,
    resolver: &mut dyn ConflictResolver,
) -> Result<ArchiveSpec> {
    while spec.output_path.exists() && !spec.overwrite {
        match resolver.resolve(&spec.output_path) {
            Resolution::Overwrite => {
                tracing::debug!(path = %spec.output_path.display(), "overwriting existing archive");
                spec.overwrite = true;
            }
            Resolution::Rename(name) => {
                let renamed = spec.renamed(&name)?;
                if renamed.output_path == spec.output_path {
                    return Err(Error::Conflict {
                        path: spec.output_path,
                    });
                }
                spec = renamed;
            }
            Resolution::Abort => {
                return Err(Error::Conflict {
                    path: spec.output_path,
                })
            }
        }
    }
    Ok(spec)
}

/// Content of an archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// One member of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Slash-separated path inside the archive.
    pub name: String,
    pub source: EntrySource,
    pub mtime: u64,
    pub mode: u32,
}

impl ArchiveEntry {
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>, mtime: u64, mode: u32) -> Self {
        Self {
            name: name.into(),
            source: EntrySource::File(path.into()),
            mtime,
            mode,
        }
    }

    pub fn bytes(name: impl Into<String>, data: Vec<u8>, mtime: u64) -> Self {
        Self {
            name: name.into(),
            source: EntrySource::Bytes(data),
            mtime,
            mode: 0o644,
        }
    }
}

enum Encoder<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Bzip2(BzEncoder<W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    fn new(compression: Compression, inner: W) -> Self {
        match compression {
            Compression::None => Encoder::Plain(inner),
            Compression::Gzip => Encoder::Gzip(
                GzBuilder::new()
                    .mtime(0)
                    .write(inner, flate2::Compression::default()),
            ),
            Compression::Bzip2 => Encoder::Bzip2(BzEncoder::new(inner, bzip2::Compression::best())),
            Compression::Xz => Encoder::Xz(XzEncoder::new(inner, 6)),
        }
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Plain(w) => Ok(w),
            Encoder::Gzip(e) => e.finish(),
            Encoder::Bzip2(e) => e.finish(),
            Encoder::Xz(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(w) => w.write(buf),
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Bzip2(e) => e.write(buf),
            Encoder::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(w) => w.flush(),
            Encoder::Gzip(e) => e.flush(),
            Encoder::Bzip2(e) => e.flush(),
            Encoder::Xz(e) => e.flush(),
        }
    }
}

/// Write `entries` to the archive described by `spec`. Returns the path
/// written.
pub fn write_archive(spec: &ArchiveSpec, mut entries: Vec<ArchiveEntry>) -> Result<PathBuf> {
    let output = &spec.output_path;
    let archive_err = |source: io::Error| Error::Archive {
        path: output.clone(),
        source,
    };

    if output.exists() && !spec.overwrite {
        return Err(Error::Conflict {
            path: output.clone(),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.dedup_by(|a, b| a.name == b.name);

    let dir = output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tartex-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(archive_err)?;

    {
        let encoder = Encoder::new(spec.compression, BufWriter::new(tmp.as_file_mut()));
        let mut builder = tar::Builder::new(encoder);
        for entry in &entries {
            append_entry(&mut builder, entry).map_err(archive_err)?;
        }
        let encoder = builder.into_inner().map_err(archive_err)?;
        let mut writer = encoder.finish().map_err(archive_err)?;
        writer.flush().map_err(archive_err)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644)).map_err(archive_err)?;
    }

    if spec.overwrite {
        tmp.persist(output).map_err(|e| archive_err(e.error))?;
    } else {
        tmp.persist_noclobber(output).map_err(|e| archive_err(e.error))?;
    }

    tracing::info!(
        archive = %output.display(),
        entries = entries.len(),
        compression = %spec.compression,
        "archive written"
    );
    Ok(output.clone())
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, entry: &ArchiveEntry) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(entry.mode);
    header.set_mtime(entry.mtime);
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("")?;
    header.set_groupname("")?;

    match &entry.source {
        EntrySource::File(path) => {
            let file = File::open(path).map_err(|e| with_path(e, path))?;
            let len = file.metadata().map_err(|e| with_path(e, path))?.len();
            header.set_size(len);
            // Guard against the file growing while it is read.
            builder.append_data(&mut header, &entry.name, file.take(len))
        }
        EntrySource::Bytes(data) => {
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, &entry.name, data.as_slice())
        }
    }
}

fn with_path(err: io::Error, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {err}", path.display()))
}

/// Member names of an existing archive, compression taken from its suffix.
pub fn list_archive(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let compression = split_suffix(&name)
        .1
        .map(|(_, c, _)| c)
        .unwrap_or(Compression::None);

    let reader: Box<dyn Read> = match compression {
        Compression::None => Box::new(file),
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(file)),
        Compression::Bzip2 => Box::new(bzip2::read::BzDecoder::new(file)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new(file)),
    };

    let mut archive = tar::Archive::new(reader);
    let mut names = Vec::new();
    for entry in archive.entries().map_err(|e| Error::io(path, e))? {
        let entry = entry.map_err(|e| Error::io(path, e))?;
        let entry_path = entry.path().map_err(|e| Error::io(path, e))?;
        names.push(entry_path.to_string_lossy().into_owned());
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(requested: &str, forced: Option<Compression>) -> ArchiveSpec {
        ArchiveSpec::resolve(
            Some(Path::new(requested)),
            forced,
            "paper",
            Path::new("/proj"),
            Path::new("/work"),
        )
        .unwrap()
    }

    #[test]
    fn suffix_rules() {
        let cases = [
            ("out.tar", "/work/out.tar", Compression::None),
            ("out.tar.gz", "/work/out.tar.gz", Compression::Gzip),
            ("out.tgz", "/work/out.tgz", Compression::Gzip),
            ("out.gz", "/work/out.tar.gz", Compression::Gzip),
            ("out", "/work/out.tar.gz", Compression::Gzip),
            ("out.tar.bz2", "/work/out.tar.bz2", Compression::Bzip2),
            ("out.bz2", "/work/out.tar.bz2", Compression::Bzip2),
            ("out.txz", "/work/out.txz", Compression::Xz),
            ("out.foo.bar", "/work/out.foo.bar.tar.gz", Compression::Gzip),
            ("/abs/x.tar.xz", "/abs/x.tar.xz", Compression::Xz),
        ];
        for (input, path, compression) in cases {
            let s = spec(input, None);
            assert_eq!(s.output_path, PathBuf::from(path), "{input}");
            assert_eq!(s.compression, compression, "{input}");
        }
    }

    #[test]
    fn forced_compression_rewrites_suffix() {
        let s = spec("out.tar.gz", Some(Compression::Bzip2));
        assert_eq!(s.output_path, PathBuf::from("/work/out.tar.bz2"));
        let s = spec("out.tgz", Some(Compression::Xz));
        assert_eq!(s.output_path, PathBuf::from("/work/out.tar.xz"));
        let s = spec("out", Some(Compression::None));
        assert_eq!(s.output_path, PathBuf::from("/work/out.tar"));
    }

    #[test]
    fn default_and_directory_targets() {
        let s = ArchiveSpec::resolve(None, None, "paper", Path::new("/proj"), Path::new("/work"))
            .unwrap();
        assert_eq!(s.output_path, PathBuf::from("/proj/paper.tar.gz"));

        let dir = tempfile::tempdir().unwrap();
        let s = ArchiveSpec::resolve(
            Some(dir.path()),
            Some(Compression::Xz),
            "paper",
            Path::new("/proj"),
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(s.output_path, dir.path().join("paper.tar.xz"));
    }

    #[test]
    fn tilde_is_expanded() {
        let home = dirs::home_dir().unwrap();
        let s = spec("~/out", None);
        assert_eq!(s.output_path, home.join("out.tar.gz"));
    }

    struct Scripted(Vec<Resolution>);

    impl ConflictResolver for Scripted {
        fn resolve(&mut self, _existing: &Path) -> Resolution {
            self.0.remove(0)
        }
    }

    #[test]
    fn conflicts_rename_overwrite_abort() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("out.tar"), "old").unwrap();
        fs::write(dir.path().join("taken.tar.gz"), "old").unwrap();
        let base =
            ArchiveSpec::resolve(Some(Path::new("out.tar")), None, "paper", dir.path(), dir.path())
                .unwrap();

        let err = resolve_conflicts(base.clone(), &mut RejectConflicts).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let mut resolver = Scripted(vec![
            Resolution::Rename(PathBuf::from("taken")),
            Resolution::Rename(PathBuf::from("fresh.tar.xz")),
        ]);
        let renamed = resolve_conflicts(base.clone(), &mut resolver).unwrap();
        assert_eq!(renamed.output_path, dir.path().join("fresh.tar.xz"));
        assert_eq!(renamed.compression, Compression::Xz);

        let over =
            resolve_conflicts(base.clone(), &mut Scripted(vec![Resolution::Overwrite])).unwrap();
        assert!(over.overwrite);
        assert_eq!(over.output_path, dir.path().join("out.tar"));

        let same = resolve_conflicts(
            base,
            &mut Scripted(vec![Resolution::Rename(PathBuf::from("out.tar"))]),
        );
        assert!(matches!(same, Err(Error::Conflict { .. })));
    }

    fn sample_entries(dir: &Path) -> Vec<ArchiveEntry> {
        fs::create_dir_all(dir.join("figures")).unwrap();
        fs::write(dir.join("main.tex"), "\\documentclass{article}").unwrap();
        fs::write(dir.join("figures/plot.pdf"), "%PDF").unwrap();
        vec![
            ArchiveEntry::file("main.tex", dir.join("main.tex"), 1_700_000_000, 0o644),
            ArchiveEntry::file(
                "figures/plot.pdf",
                dir.join("figures/plot.pdf"),
                1_700_000_000,
                0o600,
            ),
            ArchiveEntry::bytes("TeXPackages.json", b"{}".to_vec(), 1_700_000_000),
        ]
    }

    #[test]
    fn writes_sorted_normalized_entries() {
        let dir = tempfile::tempdir().unwrap();
        let entries = sample_entries(dir.path());
        let spec =
            ArchiveSpec::resolve(Some(Path::new("out.tar")), None, "paper", dir.path(), dir.path())
                .unwrap();
        let path = write_archive(&spec, entries).unwrap();

        let mut archive = tar::Archive::new(File::open(&path).unwrap());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            assert_eq!(header.uid().unwrap(), 0);
            assert_eq!(header.gid().unwrap(), 0);
            assert_eq!(header.mtime().unwrap(), 1_700_000_000);
            assert_eq!(header.username().unwrap(), Some(""));
            seen.push((
                entry.path().unwrap().to_string_lossy().into_owned(),
                header.mode().unwrap(),
            ));
        }
        assert_eq!(
            seen,
            vec![
                ("TeXPackages.json".to_string(), 0o644),
                ("figures/plot.pdf".to_string(), 0o600),
                ("main.tex".to_string(), 0o644),
            ]
        );
    }

    #[test]
    fn every_compression_reads_back_and_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.tar", "a.tar.gz", "a.tar.bz2", "a.tar.xz"] {
            let spec =
                ArchiveSpec::resolve(Some(Path::new(name)), None, "paper", dir.path(), dir.path())
                    .unwrap();
            let first = write_archive(&spec, sample_entries(dir.path())).unwrap();
            let bytes = fs::read(&first).unwrap();
            assert_eq!(
                list_archive(&first).unwrap(),
                vec!["TeXPackages.json", "figures/plot.pdf", "main.tex"],
                "{name}"
            );

            let again = ArchiveSpec { overwrite: true, ..spec };
            write_archive(&again, sample_entries(dir.path())).unwrap();
            assert_eq!(fs::read(&first).unwrap(), bytes, "{name} not reproducible");
        }
    }

    #[test]
    fn failure_leaves_no_partial_archive() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ArchiveSpec::resolve(
            Some(Path::new("out.tar.gz")),
            None,
            "paper",
            dir.path(),
            dir.path(),
        )
        .unwrap();
        let entries = vec![ArchiveEntry::file(
            "gone.tex",
            dir.path().join("gone.tex"),
            0,
            0o644,
        )];
        let err = write_archive(&spec, entries).unwrap_err();
        assert!(matches!(err, Error::Archive { .. }));
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn refuses_to_clobber_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("out.tar"), "old").unwrap();
        let spec =
            ArchiveSpec::resolve(Some(Path::new("out.tar")), None, "paper", dir.path(), dir.path())
                .unwrap();
        let err = write_archive(&spec, Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(fs::read_to_string(dir.path().join("out.tar")).unwrap(), "old");
    }
}
