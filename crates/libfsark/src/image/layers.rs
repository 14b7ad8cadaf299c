//! Squashes the ordered layers of an image into a single tar stream.
//!
//! Later layers win. A `.wh.<name>` entry deletes `<name>` from the layers
//! below it and `.wh..wh..opq` inside a directory hides everything the lower
//! layers put there. Whiteout markers themselves never reach the output.
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, Builder, Header};

use super::ImageError;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
// longer hard-link chains are treated as loops
const MAX_LINK_HOPS: usize = 8;

/// One image layer, still encoded as delivered by the registry.
#[derive(Debug, Clone)]
pub struct Layer {
    media_type: String,
    data: Vec<u8>,
}

impl Layer {
    pub fn new<S: Into<String>>(media_type: S, data: Vec<u8>) -> Self {
        Self {
            media_type: media_type.into(),
            data,
        }
    }

    fn is_gzip(&self) -> bool {
        self.media_type.ends_with("gzip") || self.data.starts_with(&GZIP_MAGIC)
    }

    fn archive(&self) -> Archive<Box<dyn Read + '_>> {
        let reader: Box<dyn Read + '_> = if self.is_gzip() {
            Box::new(GzDecoder::new(self.data.as_slice()))
        } else {
            Box::new(self.data.as_slice())
        };
        Archive::new(reader)
    }
}

/// What a single layer adds or removes, by cleaned path.
#[derive(Debug, Default)]
struct LayerIndex {
    /// path -> is directory
    entries: HashMap<PathBuf, bool>,
    whiteouts: HashSet<PathBuf>,
    opaque: HashSet<PathBuf>,
}

impl LayerIndex {
    fn build(layer: &Layer, index: usize) -> Result<Self, ImageError> {
        let layer_error = |err: io::Error| ImageError::Layer { index, source: err };
        let mut result = Self::default();
        let mut archive = layer.archive();
        for entry in archive.entries().map_err(layer_error)? {
            let entry = entry.map_err(layer_error)?;
            let path = clean(&entry.path().map_err(layer_error)?);
            match Marker::of(&path) {
                Marker::Opaque(dir) => {
                    result.opaque.insert(dir);
                }
                Marker::Whiteout(target) => {
                    result.whiteouts.insert(target);
                }
                Marker::None => {
                    let is_dir = entry.header().entry_type().is_dir();
                    result.entries.insert(path, is_dir);
                }
            }
        }
        Ok(result)
    }

    /// Whether this layer hides `path` written by some layer beneath it.
    fn hides(&self, path: &Path) -> bool {
        if self.whiteouts.contains(path) {
            return true;
        }
        // the upper entry replaces this one; a directory over a directory
        // still keeps the lower children, which the ancestor walk decides
        if self.entries.contains_key(path) {
            return true;
        }
        path.ancestors()
            .skip(1)
            .take_while(|ancestor| !ancestor.as_os_str().is_empty())
            .any(|ancestor| {
                self.whiteouts.contains(ancestor)
                    || self.opaque.contains(ancestor)
                    || self.entries.get(ancestor) == Some(&false)
            })
    }
}

enum Marker {
    Opaque(PathBuf),
    Whiteout(PathBuf),
    None,
}

impl Marker {
    fn of(path: &Path) -> Self {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            return Marker::None;
        };
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        if name == OPAQUE_WHITEOUT {
            Marker::Opaque(parent.to_path_buf())
        } else if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
            Marker::Whiteout(parent.join(target))
        } else {
            Marker::None
        }
    }
}

/// Lexically cleans an entry name to a relative path.
fn clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::ParentDir => {
                cleaned.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    cleaned
}

/// What a path holds within a single layer.
enum LinkSource {
    File(Header, Vec<u8>),
    Link(PathBuf),
}

/// Header and content of the regular file `target` as seen from the top of
/// `layers`, following hard-link chains.
fn linked_file(layers: &[Layer], target: &Path) -> Result<Option<(Header, Vec<u8>)>, ImageError> {
    let mut target = target.to_path_buf();
    for _ in 0..MAX_LINK_HOPS {
        let mut next = None;
        for (index, layer) in layers.iter().enumerate().rev() {
            let layer_error = |err: io::Error| ImageError::Layer { index, source: err };
            let mut found = None;
            let mut archive = layer.archive();
            for entry in archive.entries().map_err(layer_error)? {
                let mut entry = entry.map_err(layer_error)?;
                if clean(&entry.path().map_err(layer_error)?) != target {
                    continue;
                }
                let entry_type = entry.header().entry_type();
                found = if entry_type.is_file() {
                    let header = entry.header().clone();
                    let mut data = Vec::new();
                    entry.read_to_end(&mut data).map_err(layer_error)?;
                    Some(LinkSource::File(header, data))
                } else if entry_type.is_hard_link() {
                    entry
                        .link_name()
                        .map_err(layer_error)?
                        .map(|link| LinkSource::Link(clean(&link)))
                } else {
                    None
                };
            }
            match found {
                Some(LinkSource::File(header, data)) => return Ok(Some((header, data))),
                Some(LinkSource::Link(link)) => {
                    next = Some(link);
                    break;
                }
                None => {}
            }
        }
        match next {
            Some(link) => target = link,
            None => return Ok(None),
        }
    }
    Ok(None)
}

/// Writes the union of `layers` (lowest first) to `dest` as one tar stream.
pub fn flatten(layers: &[Layer], dest: &mut dyn Write) -> Result<(), ImageError> {
    let indexes = layers
        .iter()
        .enumerate()
        .map(|(index, layer)| LayerIndex::build(layer, index))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = Builder::new(dest);
    builder.follow_symlinks(false);

    for (index, layer) in layers.iter().enumerate() {
        let layer_error = |err: io::Error| ImageError::Layer { index, source: err };
        let upper = &indexes[index + 1..];
        let mut archive = layer.archive();
        let mut kept = 0usize;

        for entry in archive.entries().map_err(layer_error)? {
            let mut entry = entry.map_err(layer_error)?;
            let path = clean(&entry.path().map_err(layer_error)?);
            if path.as_os_str().is_empty() || !matches!(Marker::of(&path), Marker::None) {
                continue;
            }
            if upper.iter().any(|later| later.hides(&path)) {
                continue;
            }
            let entry_type = entry.header().entry_type();

            let mut header = entry.header().clone();
            if entry_type.is_symlink() || entry_type.is_hard_link() {
                let target = entry
                    .link_name()
                    .map_err(layer_error)?
                    .map(|target| target.into_owned())
                    .unwrap_or_default();
                let target = if entry_type.is_hard_link() {
                    clean(&target)
                } else {
                    target
                };
                // the link target never reaches the output, so the link
                // becomes a copy of the data it pointed at
                if entry_type.is_hard_link() && upper.iter().any(|later| later.hides(&target)) {
                    match linked_file(&layers[..=index], &target)? {
                        Some((mut file_header, data)) => {
                            builder
                                .append_data(&mut file_header, &path, data.as_slice())
                                .map_err(layer_error)?;
                            kept += 1;
                        }
                        None => {
                            tracing::warn!(?path, ?target, "dropping hard link to missing file");
                        }
                    }
                    continue;
                }
                header.set_size(0);
                builder
                    .append_link(&mut header, &path, &target)
                    .map_err(layer_error)?;
            } else {
                builder
                    .append_data(&mut header, &path, &mut entry)
                    .map_err(layer_error)?;
            }
            kept += 1;
        }
        tracing::debug!(layer = index, entries = kept, "flattened layer");
    }

    builder
        .into_inner()
        .and_then(|dest| dest.flush())
        .map_err(|err| ImageError::Layer {
            index: layers.len(),
            source: err,
        })
}
