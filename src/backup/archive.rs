//! Archive Helpers
//!
//! Tar component archives of file trees and the gzip-compressed artifact
//! that bundles a backup's working directory.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tar::{Archive, Builder};

use crate::error::{DrError, Result};

/// Archive entry name for a source path: the path without its root.
fn entry_name(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn collect_files(path: &Path, modified_after: Option<SystemTime>, out: &mut Vec<PathBuf>) -> Result<()> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        let mut entries: Vec<_> = fs::read_dir(path)?.collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            collect_files(&entry.path(), modified_after, out)?;
        }
    } else if meta.is_file() {
        let changed = match modified_after {
            Some(cutoff) => meta.modified().map(|m| m > cutoff).unwrap_or(true),
            None => true,
        };
        if changed {
            out.push(path.to_path_buf());
        }
    }
    Ok(())
}

/// Tar the files under `sources` into `dst`. Entries keep their path minus the
/// root, so extracting into `/` puts them back where they came from. With
/// `modified_after`, only files changed since then are included.
pub fn tar_paths(dst: &Path, sources: &[PathBuf], modified_after: Option<SystemTime>) -> Result<usize> {
    let mut files = Vec::new();
    for source in sources {
        if !source.exists() {
            return Err(DrError::Config(format!("backup source {} does not exist", source.display())));
        }
        collect_files(source, modified_after, &mut files)?;
    }

    let mut builder = Builder::new(BufWriter::new(File::create(dst)?));
    for file in &files {
        builder.append_path_with_name(file, entry_name(file))?;
    }
    builder.into_inner()?.flush()?;
    Ok(files.len())
}

/// Extract a component tar into `root`.
pub fn untar(src: &Path, root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;
    let mut archive = Archive::new(BufReader::new(File::open(src)?));
    archive.set_preserve_mtime(true);
    archive.unpack(root)?;
    Ok(())
}

/// Bundle every file in `src_dir` into a single artifact, gzip-compressed if asked.
pub fn pack_artifact(src_dir: &Path, dst: &Path, compress: bool) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(dst)?);
    if compress {
        let encoder = GzEncoder::new(writer, Compression::default());
        let mut builder = Builder::new(encoder);
        builder.append_dir_all(".", src_dir)?;
        builder.into_inner()?.finish()?.flush()?;
    } else {
        let mut builder = Builder::new(writer);
        builder.append_dir_all(".", src_dir)?;
        builder.into_inner()?.flush()?;
    }
    Ok(())
}

/// Reverse of [`pack_artifact`].
pub fn unpack_artifact(src: &Path, dst_dir: &Path, compressed: bool) -> Result<()> {
    fs::create_dir_all(dst_dir)?;
    let reader = BufReader::new(File::open(src)?);
    let reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Archive::new(reader).unpack(dst_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_tar_and_untar_preserve_paths() {
        let src = tempdir().unwrap();
        let uploads = src.path().join("uploads");
        fs::create_dir_all(uploads.join("nested")).unwrap();
        fs::write(uploads.join("a.txt"), b"alpha").unwrap();
        fs::write(uploads.join("nested/b.txt"), b"beta").unwrap();

        let out = tempdir().unwrap();
        let tar_path = out.path().join("files.tar");
        assert_eq!(tar_paths(&tar_path, &[uploads.clone()], None).unwrap(), 2);

        let root = tempdir().unwrap();
        untar(&tar_path, root.path()).unwrap();
        let restored = root.path().join(entry_name(&uploads)).join("nested/b.txt");
        assert_eq!(fs::read(restored).unwrap(), b"beta");
    }

    #[test]
    fn test_modified_after_filters_old_files() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("old.txt"), b"old").unwrap();
        let cutoff = SystemTime::now() + std::time::Duration::from_secs(3600);

        let out = tempdir().unwrap();
        let n = tar_paths(&out.path().join("inc.tar"), &[src.path().to_path_buf()], Some(cutoff)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_missing_source_is_config_error() {
        let out = tempdir().unwrap();
        let err = tar_paths(&out.path().join("x.tar"), &[out.path().join("nope")], None).unwrap_err();
        assert!(matches!(err, DrError::Config(_)));
    }

    #[test]
    fn test_artifact_pack_unpack() {
        for compress in [true, false] {
            let work = tempdir().unwrap();
            fs::write(work.path().join("manifest.json"), b"{}").unwrap();
            fs::write(work.path().join("database.dump"), vec![1u8; 4096]).unwrap();

            let out = tempdir().unwrap();
            let artifact = out.path().join("daily").join("artifact");
            pack_artifact(work.path(), &artifact, compress).unwrap();

            let dst = tempdir().unwrap();
            unpack_artifact(&artifact, dst.path(), compress).unwrap();
            assert_eq!(fs::read(dst.path().join("database.dump")).unwrap().len(), 4096);
            assert!(dst.path().join("manifest.json").exists());
        }
    }
}
