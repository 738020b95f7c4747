//! A scoped view of the container filesystem.
//!
//! Every operation takes a path relative to the validated root and is
//! rejected if it would resolve outside of it. The view holds no
//! descriptors; mount/unmount symmetry is owned by the caller.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use nix::mount::MsFlags;
use nix::unistd::{chown, Gid, Uid};

use crate::error::ErrorKind;

/// A single mount applied inside the container root. `flags` is the raw
/// kernel mount flag set (`MS_BIND`, `MS_NOSUID`, ...).
#[derive(Clone, Debug)]
pub struct Mount {
    pub source: PathBuf,
    /// Target path relative to the filesystem root.
    pub target: PathBuf,
    pub fs_type: String,
    pub flags: MsFlags,
}

#[derive(thiserror::Error, Debug)]
pub enum FilesystemError {
    #[error("root directory {path} does not exist")]
    RootMissing { path: PathBuf },
    #[error("root {path} is not a directory")]
    RootNotDirectory { path: PathBuf },
    #[error("path {path} escapes the filesystem root")]
    InvalidPath { path: PathBuf },
    #[error("{path} is a directory")]
    IsDirectory { path: PathBuf },
    #[error("{path} is not a regular file")]
    NotRegularFile { path: PathBuf },
    #[error("{path} not found")]
    NotFound { path: PathBuf },
    #[error("failed to {op} {path}: {err}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("{op} syscall failed for {path}: {err}")]
    Sys {
        op: &'static str,
        path: PathBuf,
        #[source]
        err: nix::Error,
    },
}

impl FilesystemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FilesystemError::RootMissing { .. } | FilesystemError::NotFound { .. } => {
                ErrorKind::NotFound
            }
            FilesystemError::RootNotDirectory { .. } => ErrorKind::InvalidSpec,
            FilesystemError::InvalidPath { .. }
            | FilesystemError::IsDirectory { .. }
            | FilesystemError::NotRegularFile { .. } => ErrorKind::InvalidPath,
            FilesystemError::Io { .. } | FilesystemError::Sys { .. } => ErrorKind::KernelIo,
        }
    }
}

/// A validated container root and the file operations scoped to it.
#[derive(Debug)]
pub struct Filesystem {
    root: PathBuf,
}

impl Filesystem {
    /// Validates that `root` exists and is a directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> Result<Filesystem, FilesystemError> {
        let root = root.into();
        let metadata = fs::metadata(&root).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                FilesystemError::RootMissing { path: root.clone() }
            } else {
                FilesystemError::Io {
                    op: "stat",
                    path: root.clone(),
                    err,
                }
            }
        })?;
        if !metadata.is_dir() {
            return Err(FilesystemError::RootNotDirectory { path: root });
        }

        Ok(Filesystem { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins `rel` onto the root, resolving `.` and `..` lexically. Absolute
    /// inputs are re-rooted; a path climbing above the root is rejected.
    pub fn abs<P: AsRef<Path>>(&self, rel: P) -> Result<PathBuf, FilesystemError> {
        let rel = rel.as_ref();
        let mut joined = self.root.clone();
        let mut depth: usize = 0;

        for component in rel.components() {
            match component {
                Component::RootDir | Component::Prefix(_) => {
                    joined = self.root.clone();
                    depth = 0;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(FilesystemError::InvalidPath {
                            path: rel.to_path_buf(),
                        });
                    }
                    joined.pop();
                    depth -= 1;
                }
                Component::Normal(part) => {
                    joined.push(part);
                    depth += 1;
                }
            }
        }

        Ok(joined)
    }

    pub fn mount(&self, mount: &Mount) -> Result<(), FilesystemError> {
        let target = self.abs(&mount.target)?;
        nix::mount::mount(
            Some(mount.source.as_path()),
            &target,
            Some(mount.fs_type.as_str()),
            mount.flags,
            None::<&str>,
        )
        .map_err(|err| FilesystemError::Sys {
            op: "mount",
            path: target.clone(),
            err,
        })?;

        tracing::debug!(target = %target.display(), fs_type = %mount.fs_type, "mounted");
        Ok(())
    }

    pub fn unmount<P: AsRef<Path>>(&self, target: P) -> Result<(), FilesystemError> {
        let target = self.abs(target)?;
        nix::mount::umount(&target).map_err(|err| FilesystemError::Sys {
            op: "unmount",
            path: target.clone(),
            err,
        })?;

        tracing::debug!(target = %target.display(), "unmounted");
        Ok(())
    }

    pub fn create_dir<P: AsRef<Path>>(&self, rel: P) -> Result<(), FilesystemError> {
        let path = self.abs(rel)?;
        fs::create_dir_all(&path).map_err(|err| FilesystemError::Io {
            op: "create directory",
            path: path.clone(),
            err,
        })
    }

    pub fn remove_dir<P: AsRef<Path>>(&self, rel: P) -> Result<(), FilesystemError> {
        let path = self.abs(rel)?;
        fs::remove_dir_all(&path).map_err(|err| FilesystemError::Io {
            op: "remove directory",
            path: path.clone(),
            err,
        })
    }

    /// Creates (or truncates) a regular file and returns the open write
    /// handle. An existing destination must already be a regular file.
    pub fn create_file<P: AsRef<Path>>(&self, rel: P) -> Result<File, FilesystemError> {
        let path = self.abs(rel)?;
        if let Ok(metadata) = fs::metadata(&path) {
            if metadata.is_dir() {
                return Err(FilesystemError::IsDirectory { path });
            }
            if !metadata.is_file() {
                return Err(FilesystemError::NotRegularFile { path });
            }
        }

        File::create(&path).map_err(|err| FilesystemError::Io {
            op: "create file",
            path: path.clone(),
            err,
        })
    }

    pub fn remove_file<P: AsRef<Path>>(&self, rel: P) -> Result<(), FilesystemError> {
        let path = self.abs(rel)?;
        fs::remove_file(&path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                FilesystemError::NotFound { path: path.clone() }
            } else {
                FilesystemError::Io {
                    op: "remove file",
                    path: path.clone(),
                    err,
                }
            }
        })
    }

    /// Streams `src` into `dst`. Either operand being a directory fails
    /// before any bytes are copied; a missing source is `NotFound` and the
    /// destination is left uncreated.
    pub fn copy_file<P: AsRef<Path>, Q: AsRef<Path>>(
        &self,
        src: P,
        dst: Q,
    ) -> Result<(), FilesystemError> {
        let src_path = self.abs(src)?;
        let dst_path = self.abs(dst)?;

        let src_metadata = fs::metadata(&src_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                FilesystemError::NotFound {
                    path: src_path.clone(),
                }
            } else {
                FilesystemError::Io {
                    op: "stat",
                    path: src_path.clone(),
                    err,
                }
            }
        })?;
        if src_metadata.is_dir() {
            return Err(FilesystemError::IsDirectory { path: src_path });
        }
        if !src_metadata.is_file() {
            return Err(FilesystemError::NotRegularFile { path: src_path });
        }
        if let Ok(dst_metadata) = fs::metadata(&dst_path) {
            if dst_metadata.is_dir() {
                return Err(FilesystemError::IsDirectory { path: dst_path });
            }
            if !dst_metadata.is_file() {
                return Err(FilesystemError::NotRegularFile { path: dst_path });
            }
        }

        let mut src_file = File::open(&src_path).map_err(|err| FilesystemError::Io {
            op: "open",
            path: src_path.clone(),
            err,
        })?;
        let mut dst_file = File::create(&dst_path).map_err(|err| FilesystemError::Io {
            op: "create",
            path: dst_path.clone(),
            err,
        })?;
        io::copy(&mut src_file, &mut dst_file).map_err(|err| FilesystemError::Io {
            op: "copy",
            path: dst_path.clone(),
            err,
        })?;

        Ok(())
    }

    pub fn set_ownership<P: AsRef<Path>>(
        &self,
        rel: P,
        uid: u32,
        gid: u32,
    ) -> Result<(), FilesystemError> {
        let path = self.abs(rel)?;
        chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|err| {
            FilesystemError::Sys {
                op: "chown",
                path: path.clone(),
                err,
            }
        })
    }

    pub fn set_permissions<P: AsRef<Path>>(&self, rel: P, mode: u32) -> Result<(), FilesystemError> {
        let path = self.abs(rel)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).map_err(|err| {
            FilesystemError::Io {
                op: "chmod",
                path: path.clone(),
                err,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn fixture(root: &Path, rel: &str, contents: &[u8]) -> PathBuf {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_new_requires_existing_directory() {
        let err = Filesystem::new("/definitely/not/here").unwrap_err();
        assert!(matches!(err, FilesystemError::RootMissing { .. }));
    }

    #[test]
    fn test_new_rejects_file_root() {
        let tmp = tempfile::tempdir().unwrap();
        let file = fixture(tmp.path(), "plain", b"");

        let err = Filesystem::new(file).unwrap_err();
        assert!(matches!(err, FilesystemError::RootNotDirectory { .. }));
    }

    #[test]
    fn test_abs_joins_below_root() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();

        assert_eq!(
            filesystem.abs("a/b").unwrap(),
            tmp.path().join("a").join("b")
        );
        assert_eq!(filesystem.abs("a/./b").unwrap(), tmp.path().join("a/b"));
        assert_eq!(filesystem.abs("a/../b").unwrap(), tmp.path().join("b"));
    }

    #[test]
    fn test_abs_reroots_absolute_input() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();

        assert_eq!(
            filesystem.abs("/etc/passwd").unwrap(),
            tmp.path().join("etc/passwd")
        );
    }

    #[test]
    fn test_abs_rejects_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();

        for escape in ["..", "../x", "a/../../x", "/.."] {
            let err = filesystem.abs(escape).unwrap_err();
            assert!(
                matches!(err, FilesystemError::InvalidPath { .. }),
                "{escape} must be rejected"
            );
        }
    }

    #[test]
    fn test_create_and_remove_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();

        filesystem.create_dir("var/run").unwrap();
        assert!(tmp.path().join("var/run").is_dir());
        filesystem.remove_dir("var").unwrap();
        assert!(!tmp.path().join("var").exists());
    }

    #[test]
    fn test_create_file_rejects_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();
        filesystem.create_dir("d").unwrap();

        let err = filesystem.create_file("d").unwrap_err();
        assert!(matches!(err, FilesystemError::IsDirectory { .. }));
    }

    #[test]
    fn test_copy_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();
        fixture(tmp.path(), "src.bin", b"spocker payload \x00\x01\x02");

        filesystem.copy_file("src.bin", "dst.bin").unwrap();

        let src = fs::read(tmp.path().join("src.bin")).unwrap();
        let dst = fs::read(tmp.path().join("dst.bin")).unwrap();
        assert_eq!(src, dst);
    }

    #[test]
    fn test_copy_file_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();

        let err = filesystem.copy_file("absent", "dst").unwrap_err();
        assert!(matches!(err, FilesystemError::NotFound { .. }));
        // The destination must not spring into existence on failure.
        assert!(!tmp.path().join("dst").exists());
    }

    #[test]
    fn test_copy_file_rejects_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();
        filesystem.create_dir("d").unwrap();
        fixture(tmp.path(), "src", b"data");

        assert!(matches!(
            filesystem.copy_file("d", "dst").unwrap_err(),
            FilesystemError::IsDirectory { .. }
        ));
        assert!(matches!(
            filesystem.copy_file("src", "d").unwrap_err(),
            FilesystemError::IsDirectory { .. }
        ));
    }

    #[test]
    fn test_remove_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();

        let err = filesystem.remove_file("absent").unwrap_err();
        assert!(matches!(err, FilesystemError::NotFound { .. }));
    }

    #[test]
    fn test_set_permissions() {
        let tmp = tempfile::tempdir().unwrap();
        let filesystem = Filesystem::new(tmp.path()).unwrap();
        fixture(tmp.path(), "f", b"");

        filesystem.set_permissions("f", 0o640).unwrap();
        let mode = fs::metadata(tmp.path().join("f")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}
