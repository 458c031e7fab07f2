//! Canonical archive serialization for store objects: a deterministic,
//! gzip-compressed tar with zeroed timestamps and owners, sorted entries,
//! and normalized modes, so the same object always archives to the same
//! bytes.

use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use flate2::{Compression, GzBuilder};
use tar::{EntryType, Header};

/// Archive a store object rooted at `path` (a directory tree, a single
/// file, or a symlink).
///
/// # Errors
///
/// Returns an error when the object is missing or unreadable.
pub fn dump_path(path: &Path) -> Result<Vec<u8>> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("store object {} is missing", path.display()))?;

    let encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    if metadata.file_type().is_dir() {
        append_tree(&mut builder, path)?;
    } else {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("store object {} has no usable name", path.display()))?;
        append_entry(&mut builder, path, name, &metadata)?;
    }

    builder.finish()?;
    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

fn append_tree<W: std::io::Write>(builder: &mut tar::Builder<W>, root: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(root).sort_by(|a, b| a.path().cmp(b.path())) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .context("failed to relativize archive entry")?;
        let rel = rel.to_string_lossy();
        let metadata = fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        append_entry(builder, path, &rel, &metadata)?;
    }
    Ok(())
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &Path,
    name: &str,
    metadata: &fs::Metadata,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    let _ = header.set_username("");
    let _ = header.set_groupname("");

    let file_type = metadata.file_type();
    if file_type.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder.append_data(&mut header, Path::new(name), std::io::empty())?;
    } else if file_type.is_file() {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(if is_executable(metadata) { 0o755 } else { 0o644 });
        header.set_size(metadata.len());
        let file = File::open(path)
            .with_context(|| format!("failed to open {} for archiving", path.display()))?;
        builder.append_data(&mut header, Path::new(name), file)?;
    } else if file_type.is_symlink() {
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        let target = match fs::read_link(path) {
            Ok(target) => target,
            Err(err) if err.kind() == ErrorKind::PermissionDenied => return Ok(()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read symlink {}", path.display()))
            }
        };
        header
            .set_link_name(&target)
            .with_context(|| format!("symlink target of {} is too long", path.display()))?;
        builder.append_data(&mut header, Path::new(name), std::io::empty())?;
    }
    // Sockets, fifos and devices never belong in a store object; skip them.
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn entry_names(archive: &[u8]) -> Vec<String> {
        let mut tar = tar::Archive::new(GzDecoder::new(archive));
        tar.entries()
            .expect("entries")
            .map(|e| {
                e.expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .to_string()
            })
            .collect()
    }

    #[test]
    fn directory_objects_archive_deterministically() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let object = dir.path().join("obj");
        fs::create_dir_all(object.join("bin"))?;
        fs::write(object.join("bin/tool"), b"#!/bin/sh\n")?;
        fs::write(object.join("README"), b"docs\n")?;

        let first = dump_path(&object)?;
        let second = dump_path(&object)?;
        assert_eq!(first, second);
        assert_eq!(entry_names(&first), vec!["README", "bin", "bin/tool"]);
        Ok(())
    }

    #[test]
    fn file_objects_archive_as_a_single_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let object = dir.path().join("blob");
        fs::write(&object, b"payload")?;

        let archive = dump_path(&object)?;
        let mut tar = tar::Archive::new(GzDecoder::new(archive.as_slice()));
        let mut entries = tar.entries()?;
        let mut entry = entries.next().expect("one entry")?;
        let mut contents = String::new();
        entry.read_to_string(&mut contents)?;
        assert_eq!(contents, "payload");
        assert!(entries.next().is_none());
        Ok(())
    }

    #[test]
    fn missing_objects_fail() {
        let err = dump_path(Path::new("/nonexistent/object")).expect_err("must fail");
        assert!(err.to_string().contains("missing"));
    }
}
