// =============================================================================
// Dataset archive — tar.gz packing with hardened extraction
// =============================================================================
//
// Archives cross a trust boundary: they are produced on runners and unpacked
// wherever the dataset is consumed. Extraction therefore refuses entries
// whose normalized path escapes the destination and caps the decompressed
// size of every entry. Paths are validated over the whole archive before the
// first byte is written.
// =============================================================================

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::{IoContext, MonitorError, Result};

/// Decompressed-size cap per archive entry.
pub const MAX_ENTRY_BYTES: u64 = 1024 * 1024 * 1024;

#[cfg(unix)]
const DIR_MODE: u32 = 0o750;

/// Pack a directory into a gzip-compressed tarball. Directory entries are
/// emitted ahead of their files.
pub fn pack_dir(src: &Path, archive: &Path) -> Result<()> {
    let file = File::create(archive).transient("creating archive file")?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    builder
        .append_dir_all(".", src)
        .transient("packing dataset directory")?;

    let encoder = builder.into_inner().transient("finishing tar stream")?;
    let mut writer = encoder.finish().transient("finishing gzip stream")?;
    writer.flush().transient("flushing archive")?;

    debug!(archive = %archive.display(), "dataset archive packed");
    Ok(())
}

/// Unpack an archive into `dest` with the default entry cap.
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    unpack_archive_with_cap(archive, dest, MAX_ENTRY_BYTES)
}

/// Unpack with an explicit per-entry cap. Validates every entry path first,
/// so a traversal attempt anywhere in the archive writes nothing at all.
pub fn unpack_archive_with_cap(archive: &Path, dest: &Path, cap: u64) -> Result<()> {
    // Pass 1: path discipline over the whole archive.
    let mut reader = open_archive(archive)?;
    for entry in reader.entries().transient("reading archive entries")? {
        let entry = entry.transient("reading archive entry")?;
        let path = entry.path().transient("decoding entry path")?;
        sanitize_entry_path(&path)?;
    }

    // Pass 2: extraction under the cap.
    std::fs::create_dir_all(dest).transient("creating destination directory")?;
    let mut reader = open_archive(archive)?;
    for entry in reader.entries().transient("reading archive entries")? {
        let mut entry = entry.transient("reading archive entry")?;
        let relative = {
            let path = entry.path().transient("decoding entry path")?;
            sanitize_entry_path(&path)?
        };
        let target = dest.join(&relative);

        if entry.header().entry_type().is_dir() {
            create_dir_narrow(&target)?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            // Symlinks, devices and friends have no business in a dataset.
            debug!(entry = %relative.display(), "skipping non-regular archive entry");
            continue;
        }

        if let Some(parent) = target.parent() {
            create_dir_narrow(parent)?;
        }

        let file = File::create(&target).transient("creating extracted file")?;
        let mut writer = BufWriter::new(file);
        let copied = io::copy(&mut (&mut entry).take(cap), &mut writer)
            .transient("writing extracted file")?;
        if copied >= cap {
            return Err(MonitorError::ResourceExhausted(format!(
                "archive entry {} reached the {cap}-byte decompression cap",
                relative.display()
            )));
        }
    }

    Ok(())
}

fn open_archive(archive: &Path) -> Result<tar::Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(archive).transient("opening archive")?;
    Ok(tar::Archive::new(GzDecoder::new(BufReader::new(file))))
}

/// Normalize an entry path and insist it stays strictly inside the
/// destination: no absolute paths, no parent traversal, no prefixes.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(MonitorError::Semantic(format!(
                    "archive entry escapes destination: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(normalized)
}

#[cfg(unix)]
fn create_dir_narrow(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    if dir.exists() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .transient("creating extraction directory")
}

#[cfg(not(unix))]
fn create_dir_narrow(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).transient("creating extraction directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn count_files(dir: &Path) -> usize {
        let mut count = 0;
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                count += count_files(&entry.path());
            } else {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn round_trip_preserves_content() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("binance")).unwrap();
        std::fs::write(src.path().join("binance/BTC_USDT-5m.json"), b"[1,2,3]").unwrap();
        std::fs::write(src.path().join("manifest.json"), b"{}").unwrap();

        let archive = tempfile::tempdir().unwrap();
        let archive_path = archive.path().join("data.tar.gz");
        pack_dir(src.path(), &archive_path).unwrap();

        let dest = tempfile::tempdir().unwrap();
        unpack_archive(&archive_path, dest.path()).unwrap();

        let restored =
            std::fs::read(dest.path().join("binance/BTC_USDT-5m.json")).unwrap();
        assert_eq!(restored, b"[1,2,3]");
        assert_eq!(count_files(dest.path()), 2);
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap().flush().unwrap();
    }

    #[test]
    fn traversal_entry_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("evil.tar.gz");
        // A benign entry first: the traversal later in the archive must stop
        // even it from being extracted.
        write_tar_gz(
            &archive_path,
            &[
                ("innocent.txt", b"hello".as_slice()),
                ("../escape.txt", b"pwned".as_slice()),
            ],
        );

        let dest = tempfile::tempdir().unwrap();
        let err = unpack_archive(&archive_path, dest.path()).unwrap_err();
        assert!(matches!(err, MonitorError::Semantic(_)), "{err}");

        assert!(!dest.path().join("innocent.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn entry_over_cap_fails_without_writing_past_it() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("big.tar.gz");
        let payload = vec![0u8; 4096];
        write_tar_gz(&archive_path, &[("huge.bin", payload.as_slice())]);

        let dest = tempfile::tempdir().unwrap();
        let cap = 1024;
        let err = unpack_archive_with_cap(&archive_path, dest.path(), cap).unwrap_err();
        assert!(matches!(err, MonitorError::ResourceExhausted(_)), "{err}");

        let written = std::fs::metadata(dest.path().join("huge.bin")).unwrap().len();
        assert!(written <= cap, "wrote {written} bytes past the {cap} cap");
    }

    #[test]
    fn absolute_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("abs.tar.gz");
        write_tar_gz(&archive_path, &[("tmp/abs.txt", b"x".as_slice())]);

        // Relative nested paths are fine.
        let dest = tempfile::tempdir().unwrap();
        unpack_archive(&archive_path, dest.path()).unwrap();
        assert!(dest.path().join("tmp/abs.txt").exists());

        assert!(sanitize_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(sanitize_entry_path(Path::new("a/../../b")).is_err());
        assert_eq!(
            sanitize_entry_path(Path::new("./a/b")).unwrap(),
            PathBuf::from("a/b")
        );
    }
}
