//! Creation and extraction of the gzipped tar archives used for scraper
//! code (`app.tgz`) and the build cache (`cache.tgz`).
//!
//! Only directories, regular files and symlinks are accepted; any other
//! entry type fails extraction. Absolute symlink targets are rewritten to
//! be relative to the symlink's own directory when an archive is created,
//! so archives stay portable across hosts.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("unsupported entry type in archive: {0:?}")]
    UnsupportedEntry(EntryType),
    #[error("archive entry escapes the target directory: {0}")]
    PathEscape(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// Create a gzipped tar archive of everything under `dir`.
///
/// Entry paths are relative to `dir`; `dir` itself is not included.
pub fn create_from_directory(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if path == dir {
            continue;
        }
        let relative = path
            .strip_prefix(dir)
            .map_err(|_| ArchiveError::PathEscape(path.display().to_string()))?;

        let file_type = entry.file_type();
        if file_type.is_dir() {
            builder.append_dir(relative, path)?;
        } else if file_type.is_symlink() {
            let target = relative_link_target(path)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder.append_link(&mut header, relative, &target)?;
        } else {
            builder.append_path_with_name(path, relative)?;
        }
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Read a symlink's target, rewriting absolute targets relative to the
/// symlink's parent directory.
fn relative_link_target(link: &Path) -> Result<PathBuf> {
    let target = std::fs::read_link(link)?;
    if !target.is_absolute() {
        return Ok(target);
    }
    let parent = link
        .parent()
        .ok_or_else(|| ArchiveError::PathEscape(link.display().to_string()))?;
    let parent = parent.canonicalize()?;
    Ok(make_relative(&target, &parent))
}

/// Express `target` relative to `base` using `..` components where needed.
fn make_relative(target: &Path, base: &Path) -> PathBuf {
    let target_components: Vec<Component<'_>> = target.components().collect();
    let base_components: Vec<Component<'_>> = base.components().collect();

    let common = target_components
        .iter()
        .zip(base_components.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component);
    }
    relative
}

/// Extract a gzipped tar archive into `dir`, which must already exist.
pub fn extract_to_directory<R: Read>(reader: R, dir: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Directory | EntryType::Regular | EntryType::Symlink => {}
            other => return Err(ArchiveError::UnsupportedEntry(other)),
        }
        let escaping = {
            let path = entry.path()?;
            path.components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir))
                .then(|| path.display().to_string())
        };
        if let Some(path) = escaping {
            return Err(ArchiveError::PathEscape(path));
        }
        entry.unpack_in(dir)?;
    }
    Ok(())
}

/// Validate that `bytes` is a well-formed archive containing only the
/// accepted entry types, without writing anything to disk.
pub fn validate(bytes: &[u8]) -> Result<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let entry = entry?;
        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Directory | EntryType::Regular | EntryType::Symlink => {}
            other => return Err(ArchiveError::UnsupportedEntry(other)),
        }
        entry.path()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn empty_directory_round_trips() {
        let source = TempDir::new().unwrap();
        let archive = create_from_directory(source.path()).unwrap();
        validate(&archive).unwrap();

        let dest = TempDir::new().unwrap();
        extract_to_directory(archive.as_slice(), dest.path()).unwrap();
        assert_eq!(fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn files_and_directories_round_trip() {
        let source = TempDir::new().unwrap();
        fs::create_dir(source.path().join("sub")).unwrap();
        fs::write(source.path().join("top.txt"), "top").unwrap();
        fs::write(source.path().join("sub/nested.txt"), "nested").unwrap();

        let archive = create_from_directory(source.path()).unwrap();
        let dest = TempDir::new().unwrap();
        extract_to_directory(archive.as_slice(), dest.path()).unwrap();

        assert_eq!(fs::read_to_string(dest.path().join("top.txt")).unwrap(), "top");
        assert_eq!(
            fs::read_to_string(dest.path().join("sub/nested.txt")).unwrap(),
            "nested"
        );
    }

    #[cfg(unix)]
    #[test]
    fn relative_symlinks_round_trip() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("target.txt"), "data").unwrap();
        std::os::unix::fs::symlink("target.txt", source.path().join("link")).unwrap();

        let archive = create_from_directory(source.path()).unwrap();
        let dest = TempDir::new().unwrap();
        extract_to_directory(archive.as_slice(), dest.path()).unwrap();

        let link = dest.path().join("link");
        assert_eq!(
            fs::read_link(&link).unwrap(),
            PathBuf::from("target.txt")
        );
        assert_eq!(fs::read_to_string(&link).unwrap(), "data");
    }

    #[cfg(unix)]
    #[test]
    fn absolute_symlink_targets_become_relative() {
        let source = TempDir::new().unwrap();
        fs::write(source.path().join("target.txt"), "data").unwrap();
        let absolute = source.path().canonicalize().unwrap().join("target.txt");
        std::os::unix::fs::symlink(&absolute, source.path().join("link")).unwrap();

        let archive = create_from_directory(source.path()).unwrap();
        let dest = TempDir::new().unwrap();
        extract_to_directory(archive.as_slice(), dest.path()).unwrap();

        let stored = fs::read_link(dest.path().join("link")).unwrap();
        assert!(!stored.is_absolute());
        assert_eq!(
            fs::read_to_string(dest.path().join("link")).unwrap(),
            "data"
        );
    }

    #[test]
    fn make_relative_walks_up_and_down() {
        assert_eq!(
            make_relative(Path::new("/a/b/target"), Path::new("/a/c")),
            PathBuf::from("../b/target")
        );
        assert_eq!(
            make_relative(Path::new("/a/b/target"), Path::new("/a/b")),
            PathBuf::from("target")
        );
    }

    #[test]
    fn garbage_bytes_fail_validation() {
        assert!(validate(b"definitely not a tarball").is_err());
    }

    #[test]
    fn entries_escaping_the_target_are_rejected() {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        let name = b"../escape.txt";
        header.as_gnu_mut().unwrap().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(EntryType::Regular);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, b"oops".as_slice()).unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();

        let dest = TempDir::new().unwrap();
        let err = extract_to_directory(bytes.as_slice(), dest.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::PathEscape(_)));
    }
}
