//! Reconstructs a directory tree from a tar archive, entry by entry, in
//! archive order.
use std::collections::HashMap;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use tar::Archive;

const DEFAULT_DIR_MODE: u32 = 0o755;
const MODE_MASK: u32 = 0o7777;

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("failed to open archive {path:?}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to read archive {path:?}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid header for entry {name:?}")]
    Header { name: PathBuf, source: io::Error },
    #[error("entry {name:?} has an empty name")]
    EmptyName { name: PathBuf },
    #[error("entry {name:?} escapes the destination root")]
    PathEscape { name: PathBuf },
    #[error("refusing to write {path:?} through symlink {link:?}")]
    SymlinkParent { path: PathBuf, link: PathBuf },
    #[error("link entry {path:?} has no link target")]
    MissingLinkTarget { path: PathBuf },
    #[error("failed to create directory {path:?}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to create file {path:?}")]
    CreateFile { path: PathBuf, source: io::Error },
    #[error("failed to copy data for {path:?}")]
    Copy { path: PathBuf, source: io::Error },
    #[error("failed to replace existing {path:?}")]
    Replace { path: PathBuf, source: io::Error },
    #[error("failed to create symlink {path:?} -> {target:?}")]
    Symlink {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },
    #[error("failed to create hard link {path:?} -> {target:?}")]
    HardLink {
        path: PathBuf,
        target: PathBuf,
        source: io::Error,
    },
    #[error("failed to set mode {mode:o} on {path:?}")]
    Permissions {
        path: PathBuf,
        mode: u32,
        source: io::Error,
    },
}

/// Extracts the tar archive at `archive` into `destination`, which must
/// already exist.
///
/// End of archive is success. Any error stops extraction at the offending
/// entry and leaves whatever was written so far in place, so a destination
/// must not be reused after a failure. Entries of a type other than
/// directory, regular file, symlink or hard link are skipped with a warning.
pub fn extract<P: AsRef<Path>, Q: AsRef<Path>>(
    archive: P,
    destination: Q,
) -> Result<(), UnpackError> {
    let archive = archive.as_ref();
    let file = File::open(archive).map_err(|err| UnpackError::Open {
        path: archive.to_path_buf(),
        source: err,
    })?;

    tracing::debug!(?archive, destination = ?destination.as_ref(), "extracting archive");
    Unpacker::new(destination.as_ref(), archive).unpack(file)
}

struct Unpacker<'a> {
    root: &'a Path,
    origin: &'a Path,
    // directory modes are applied once every child has been written
    deferred_modes: Vec<(PathBuf, u32)>,
}

impl<'a> Unpacker<'a> {
    fn new(root: &'a Path, origin: &'a Path) -> Self {
        Self {
            root,
            origin,
            deferred_modes: Vec::new(),
        }
    }

    fn unpack<R: Read>(mut self, reader: R) -> Result<(), UnpackError> {
        let mut archive = Archive::new(reader);
        let entries = archive.entries().map_err(|err| self.read_error(err))?;

        for entry in entries {
            let mut entry = entry.map_err(|err| self.read_error(err))?;
            let name = entry
                .path()
                .map_err(|err| self.read_error(err))?
                .into_owned();
            let relative = normalize_entry_name(&name)?;
            let target = self.root.join(&relative);
            let entry_type = entry.header().entry_type();

            if entry_type.is_dir() {
                if relative.as_os_str().is_empty() {
                    continue;
                }
                let mode = entry_mode(&entry, &name)?;
                self.ensure_no_symlink_parents(&relative)?;
                self.create_dir(&target, mode)?;
                continue;
            }

            if relative.as_os_str().is_empty() {
                return Err(UnpackError::EmptyName { name });
            }
            self.ensure_no_symlink_parents(&relative)?;

            if entry_type.is_file() {
                let mode = entry_mode(&entry, &name)?;
                self.prepare_target(&target)?;
                write_file(&mut entry, &target, mode)?;
            } else if entry_type.is_symlink() {
                let link = link_target(&entry, &name, &target)?;
                self.prepare_target(&target)?;
                std::os::unix::fs::symlink(&link, &target).map_err(|err| {
                    UnpackError::Symlink {
                        path: target.clone(),
                        target: link.clone(),
                        source: err,
                    }
                })?;
            } else if entry_type.is_hard_link() {
                let link = link_target(&entry, &name, &target)?;
                let link = normalize_entry_name(&link)?;
                self.ensure_no_symlink_parents(&link)?;
                let original = self.root.join(&link);
                self.prepare_target(&target)?;
                fs::hard_link(&original, &target).map_err(|err| UnpackError::HardLink {
                    path: target.clone(),
                    target: original.clone(),
                    source: err,
                })?;
            } else {
                tracing::warn!(path = ?target, ?entry_type, "skipping unsupported tar entry");
            }
        }

        for (path, mode) in final_modes(self.deferred_modes) {
            set_mode(&path, mode)?;
        }

        Ok(())
    }

    fn read_error(&self, err: io::Error) -> UnpackError {
        UnpackError::Read {
            path: self.origin.to_path_buf(),
            source: err,
        }
    }

    fn create_dir(&mut self, path: &Path, mode: u32) -> Result<(), UnpackError> {
        match fs::symlink_metadata(path) {
            // possibly created earlier as the implicit parent of another entry
            Ok(metadata) if metadata.is_dir() => {
                self.deferred_modes.push((path.to_path_buf(), mode));
                return Ok(());
            }
            Ok(_) => return Ok(()),
            Err(_) => {}
        }
        DirBuilder::new()
            .recursive(true)
            .mode(DEFAULT_DIR_MODE)
            .create(path)
            .map_err(|err| UnpackError::CreateDir {
                path: path.to_path_buf(),
                source: err,
            })?;
        self.deferred_modes.push((path.to_path_buf(), mode));
        Ok(())
    }

    /// Creates missing parents and removes a non-directory already sitting at
    /// `path`, so the new entry never writes through a stale symlink.
    fn prepare_target(&mut self, path: &Path) -> Result<(), UnpackError> {
        if let Some(parent) = path.parent() {
            if fs::symlink_metadata(parent).is_err() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(DEFAULT_DIR_MODE)
                    .create(parent)
                    .map_err(|err| UnpackError::CreateDir {
                        path: parent.to_path_buf(),
                        source: err,
                    })?;
            }
        }

        match fs::symlink_metadata(path) {
            Ok(metadata) if !metadata.is_dir() => {
                fs::remove_file(path).map_err(|err| UnpackError::Replace {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
            _ => Ok(()),
        }
    }

    fn ensure_no_symlink_parents(&self, relative: &Path) -> Result<(), UnpackError> {
        let mut current = self.root.to_path_buf();
        let mut components = relative.components().peekable();
        while let Some(component) = components.next() {
            if components.peek().is_none() {
                break;
            }
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    return Err(UnpackError::SymlinkParent {
                        path: self.root.join(relative),
                        link: current,
                    });
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok(())
    }
}

/// The last mode recorded for each directory, deepest directories first so a
/// read-only parent does not block a child.
fn final_modes(recorded: Vec<(PathBuf, u32)>) -> Vec<(PathBuf, u32)> {
    let mut modes: Vec<(PathBuf, u32)> = recorded
        .into_iter()
        .collect::<HashMap<_, _>>()
        .into_iter()
        .collect();
    modes.sort_by(|(a, _), (b, _)| {
        b.components()
            .count()
            .cmp(&a.components().count())
            .then_with(|| a.cmp(b))
    });
    modes
}

/// Lexically resolves an entry name against the destination root. Leading `/`
/// and `.` components are dropped; a `..` that climbs above the root is an
/// error.
fn normalize_entry_name(name: &Path) -> Result<PathBuf, UnpackError> {
    let mut normalized = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(UnpackError::PathEscape {
                        name: name.to_path_buf(),
                    });
                }
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Ok(normalized)
}

fn entry_mode<R: Read>(entry: &tar::Entry<R>, name: &Path) -> Result<u32, UnpackError> {
    entry
        .header()
        .mode()
        .map(|mode| mode & MODE_MASK)
        .map_err(|err| UnpackError::Header {
            name: name.to_path_buf(),
            source: err,
        })
}

fn link_target<R: Read>(
    entry: &tar::Entry<R>,
    name: &Path,
    target: &Path,
) -> Result<PathBuf, UnpackError> {
    entry
        .link_name()
        .map_err(|err| UnpackError::Header {
            name: name.to_path_buf(),
            source: err,
        })?
        .map(|link| link.into_owned())
        .ok_or_else(|| UnpackError::MissingLinkTarget {
            path: target.to_path_buf(),
        })
}

fn write_file<R: Read>(reader: &mut R, path: &Path, mode: u32) -> Result<(), UnpackError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|err| UnpackError::CreateFile {
            path: path.to_path_buf(),
            source: err,
        })?;
    io::copy(reader, &mut file).map_err(|err| UnpackError::Copy {
        path: path.to_path_buf(),
        source: err,
    })?;
    // the umask applied at creation may have dropped bits
    file.set_permissions(Permissions::from_mode(mode))
        .map_err(|err| UnpackError::Permissions {
            path: path.to_path_buf(),
            mode,
            source: err,
        })
}

fn set_mode(path: &Path, mode: u32) -> Result<(), UnpackError> {
    fs::set_permissions(path, Permissions::from_mode(mode)).map_err(|err| {
        UnpackError::Permissions {
            path: path.to_path_buf(),
            mode,
            source: err,
        }
    })
}
