use crate::CacheError;
use kiln_schema::Digest;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// A layer directory serialized to a tar, with its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedLayer {
    pub digest: Digest,
    pub data: Vec<u8>,
}

impl PackedLayer {
    pub fn pack(source_dir: &Path, prefix: &str) -> Result<Self, CacheError> {
        let data = pack_layer(source_dir, prefix)?;
        Ok(Self {
            digest: Digest::of(&data),
            data,
        })
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Tar `source_dir` with every entry under `prefix`, e.g.
/// `layers/acme_node/runtime`. The ancestors of the prefix come first as
/// `0755` directories.
///
/// The same tree always gives the same bytes: a directory's children are
/// written in name order, and every entry has mtime 0 and owner 0:0. Modes
/// are kept. Only files, directories and symlinks are written.
pub fn pack_layer(source_dir: &Path, prefix: &str) -> Result<Vec<u8>, CacheError> {
    let mut writer = LayerWriter::new(prefix);
    writer.ancestors()?;
    if source_dir.is_dir() {
        let root = writer.prefix.clone();
        writer.walk(source_dir, &root)?;
    }
    Ok(writer.tar.into_inner()?)
}

struct LayerWriter {
    tar: tar::Builder<Vec<u8>>,
    prefix: String,
}

impl LayerWriter {
    fn new(prefix: &str) -> Self {
        let mut tar = tar::Builder::new(Vec::new());
        tar.follow_symlinks(false);
        Self {
            tar,
            prefix: prefix.trim_matches('/').to_owned(),
        }
    }

    fn ancestors(&mut self) -> Result<(), CacheError> {
        let parts: Vec<String> = self.prefix.split('/').map(str::to_owned).collect();
        for depth in 1..=parts.len() {
            let dir = parts[..depth].join("/");
            if !dir.is_empty() {
                self.directory(&dir, 0o755)?;
            }
        }
        Ok(())
    }

    fn walk(&mut self, dir: &Path, at: &str) -> Result<(), CacheError> {
        let mut children: Vec<(String, PathBuf)> = fs::read_dir(dir)?
            .map(|e| e.map(|e| (e.file_name().to_string_lossy().into_owned(), e.path())))
            .collect::<Result<_, _>>()?;
        children.sort();

        for (name, path) in children {
            let name = if at.is_empty() { name } else { format!("{at}/{name}") };
            let meta = path.symlink_metadata()?;
            let mode = meta.permissions().mode();
            let kind = meta.file_type();
            if kind.is_symlink() {
                let target = fs::read_link(&path)?;
                let mut h = header(tar::EntryType::Symlink, mode, 0);
                self.tar.append_link(&mut h, &name, &target)?;
            } else if kind.is_dir() {
                self.directory(&name, mode)?;
                self.walk(&path, &name)?;
            } else if kind.is_file() {
                let body = fs::read(&path)?;
                let mut h = header(tar::EntryType::Regular, mode, body.len() as u64);
                self.tar.append_data(&mut h, &name, body.as_slice())?;
            } else {
                warn!("not packing {}: neither file, directory nor symlink", path.display());
            }
        }
        Ok(())
    }

    fn directory(&mut self, name: &str, mode: u32) -> Result<(), CacheError> {
        let mut h = header(tar::EntryType::Directory, mode, 0);
        self.tar.append_data(&mut h, format!("{name}/"), io::empty())?;
        Ok(())
    }
}

fn header(kind: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(kind);
    h.set_mode(mode);
    h.set_size(size);
    h.set_mtime(0);
    h.set_uid(0);
    h.set_gid(0);
    h.set_cksum();
    h
}

/// Where an archive entry lands relative to the layer directory. `None` for
/// entries outside `prefix` and for the prefix itself.
fn relative_to_prefix(entry: &Path, prefix: &Path) -> Result<Option<PathBuf>, CacheError> {
    let Ok(rel) = entry.strip_prefix(prefix) else {
        return Ok(None);
    };
    if rel.as_os_str().is_empty() {
        return Ok(None);
    }
    if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(CacheError::Io(io::Error::other(format!(
            "refusing layer entry outside its directory: {}",
            entry.display()
        ))));
    }
    Ok(Some(rel.to_path_buf()))
}

/// Write the entries of `tar_data` that live under `prefix` into
/// `target_dir`, prefix removed.
pub fn unpack_layer(tar_data: &[u8], target_dir: &Path, prefix: &str) -> Result<(), CacheError> {
    let prefix = PathBuf::from(prefix.trim_matches('/'));
    fs::create_dir_all(target_dir)?;
    let mut archive = tar::Archive::new(tar_data);
    let mut skipped = 0usize;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.into_owned();
        let Some(rel) = relative_to_prefix(&name, &prefix)? else {
            skipped += 1;
            continue;
        };
        if entry.header().entry_type().is_hard_link() {
            return Err(CacheError::Io(io::Error::other(format!(
                "refusing hard link in layer: {}",
                name.display()
            ))));
        }
        reject_symlinked_parents(target_dir, &rel)?;
        let dest = target_dir.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.set_preserve_permissions(true);
        entry.set_preserve_mtime(false);
        entry.set_unpack_xattrs(false);
        entry.unpack(&dest)?;
    }
    debug!("unpacked into {} ({skipped} entries outside {})", target_dir.display(), prefix.display());
    Ok(())
}

/// Fail when a directory between `target_dir` and `rel` is a symlink, so an
/// entry cannot be written through a link laid down by an earlier entry.
fn reject_symlinked_parents(target_dir: &Path, rel: &Path) -> Result<(), CacheError> {
    let mut at = target_dir.to_path_buf();
    for component in rel.parent().into_iter().flat_map(Path::components) {
        at.push(component);
        match fs::symlink_metadata(&at) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(CacheError::Io(io::Error::other(format!(
                    "refusing layer entry {} below symlink {}",
                    rel.display(),
                    at.display()
                ))));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// [`unpack_layer`] into a scratch directory next to `target_dir`, then swap
/// it in. On failure `target_dir` keeps its old content.
pub fn unpack_layer_atomic(tar_data: &[u8], target_dir: &Path, prefix: &str) -> Result<(), CacheError> {
    let Some(parent) = target_dir.parent() else {
        return Err(CacheError::Io(io::Error::other(format!(
            "layer directory {} has no parent",
            target_dir.display()
        ))));
    };
    fs::create_dir_all(parent)?;
    let scratch = tempfile::Builder::new().prefix(".unpack-").tempdir_in(parent)?;
    unpack_layer(tar_data, scratch.path(), prefix)?;
    if target_dir.exists() {
        fs::remove_dir_all(target_dir)?;
    }
    fs::rename(scratch.path(), target_dir)?;
    crate::fsync_dir(parent)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNTIME: &str = "layers/acme_node/runtime";

    fn node_runtime(dir: &Path) {
        fs::create_dir_all(dir.join("bin")).unwrap();
        fs::write(dir.join("bin/node"), "#!/bin/sh\necho node\n").unwrap();
        fs::set_permissions(dir.join("bin/node"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir_all(dir.join("lib/node_modules")).unwrap();
        fs::write(dir.join("lib/libnode.so"), [0x7f, b'E', b'L', b'F']).unwrap();
        std::os::unix::fs::symlink("bin/node", dir.join("nodejs")).unwrap();
    }

    fn names(tar_data: &[u8]) -> Vec<String> {
        tar::Archive::new(tar_data)
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_owned())
            .collect()
    }

    #[test]
    fn runtime_layer_survives_pack_and_unpack() {
        let src = tempfile::tempdir().unwrap();
        node_runtime(src.path());
        let packed = pack_layer(src.path(), RUNTIME).unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack_layer(&packed, dst.path(), RUNTIME).unwrap();
        let node = dst.path().join("bin/node");
        assert_eq!(fs::read_to_string(&node).unwrap(), "#!/bin/sh\necho node\n");
        assert_eq!(fs::metadata(&node).unwrap().permissions().mode() & 0o777, 0o755);
        assert_eq!(fs::read(dst.path().join("lib/libnode.so")).unwrap(), [0x7f, b'E', b'L', b'F']);
        assert!(dst.path().join("lib/node_modules").is_dir());
        assert_eq!(fs::read_link(dst.path().join("nodejs")).unwrap(), Path::new("bin/node"));
    }

    #[test]
    fn entries_follow_prefix_then_name_order() {
        let src = tempfile::tempdir().unwrap();
        node_runtime(src.path());
        assert_eq!(
            names(&pack_layer(src.path(), RUNTIME).unwrap()),
            vec![
                "layers",
                "layers/acme_node",
                "layers/acme_node/runtime",
                "layers/acme_node/runtime/bin",
                "layers/acme_node/runtime/bin/node",
                "layers/acme_node/runtime/lib",
                "layers/acme_node/runtime/lib/libnode.so",
                "layers/acme_node/runtime/lib/node_modules",
                "layers/acme_node/runtime/nodejs",
            ]
        );
    }

    #[test]
    fn identical_trees_give_identical_digests() {
        let (a, b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        node_runtime(a.path());
        node_runtime(b.path());
        let first = PackedLayer::pack(a.path(), RUNTIME).unwrap();
        assert_eq!(first, PackedLayer::pack(b.path(), RUNTIME).unwrap());

        fs::write(b.path().join("bin/node"), "#!/bin/sh\necho patched\n").unwrap();
        assert_ne!(first.digest, PackedLayer::pack(b.path(), RUNTIME).unwrap().digest);
    }

    #[test]
    fn missing_source_packs_just_the_prefix() {
        let base = tempfile::tempdir().unwrap();
        let packed = pack_layer(&base.path().join("absent"), "workspace").unwrap();
        assert_eq!(names(&packed), vec!["workspace"]);
    }

    #[test]
    fn foreign_prefixes_are_left_alone() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("server.js"), "listen()").unwrap();
        let app = pack_layer(src.path(), "workspace").unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack_layer(&app, dst.path(), RUNTIME).unwrap();
        assert!(fs::read_dir(dst.path()).unwrap().next().is_none());
    }

    #[test]
    fn parent_references_are_refused() {
        assert!(relative_to_prefix(Path::new("layers/a/../../etc/passwd"), Path::new("layers/a")).is_err());
        assert_eq!(
            relative_to_prefix(Path::new("layers/a/x"), Path::new("layers/a")).unwrap(),
            Some(PathBuf::from("x"))
        );
        assert_eq!(relative_to_prefix(Path::new("layers/a"), Path::new("layers/a")).unwrap(), None);
    }

    fn append(
        tar: &mut tar::Builder<Vec<u8>>,
        kind: tar::EntryType,
        path: &str,
        link: Option<&Path>,
        data: &[u8],
    ) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(kind);
        header.set_mode(0o755);
        header.set_size(data.len() as u64);
        if let Some(link) = link {
            header.set_link_name(link).unwrap();
        }
        header.set_cksum();
        tar.append_data(&mut header, path, data).unwrap();
    }

    #[test]
    fn writes_through_symlinked_directories_are_refused() {
        let outside = tempfile::tempdir().unwrap();
        let mut tar = tar::Builder::new(Vec::new());
        let link = format!("{RUNTIME}/link");
        append(&mut tar, tar::EntryType::Symlink, &link, Some(outside.path()), &[]);
        append(&mut tar, tar::EntryType::Regular, &format!("{link}/escaped"), None, b"owned");
        let data = tar.into_inner().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let err = unpack_layer(&data, dst.path(), RUNTIME).unwrap_err();
        assert!(err.to_string().contains("symlink"), "{err}");
        assert!(!outside.path().join("escaped").exists());

        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("runtime");
        assert!(unpack_layer_atomic(&data, &target, RUNTIME).is_err());
        assert!(!outside.path().join("escaped").exists());
    }

    #[test]
    fn hard_links_are_refused() {
        let mut tar = tar::Builder::new(Vec::new());
        append(
            &mut tar,
            tar::EntryType::Link,
            &format!("{RUNTIME}/passwd"),
            Some(Path::new("/etc/passwd")),
            &[],
        );
        let data = tar.into_inner().unwrap();
        let dst = tempfile::tempdir().unwrap();
        assert!(unpack_layer(&data, dst.path(), RUNTIME).is_err());
        assert!(!dst.path().join("passwd").exists());
    }

    #[test]
    fn atomic_unpack_swaps_whole_directory() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("fresh"), "1").unwrap();
        let packed = pack_layer(src.path(), RUNTIME).unwrap();

        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("runtime");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale"), "0").unwrap();

        unpack_layer_atomic(&packed, &target, RUNTIME).unwrap();
        assert!(target.join("fresh").is_file());
        assert!(!target.join("stale").exists());
        let entries: Vec<_> = fs::read_dir(base.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("runtime")]);
    }

    #[test]
    fn truncated_archive_keeps_previous_content() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("runtime");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale"), "0").unwrap();

        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("big"), vec![7u8; 4096]).unwrap();
        let mut packed = pack_layer(src.path(), RUNTIME).unwrap();
        packed.truncate(700);

        assert!(unpack_layer_atomic(&packed, &target, RUNTIME).is_err());
        assert!(target.join("stale").is_file());
    }
}
