//! Device identification is injected, not hardwired: the caller supplies
//! the candidate nodes and an acceptance check, and the first node that
//! opens and passes wins.

use std::path::{Path, PathBuf};

use log::debug;

use crate::errors::{Error, Result};

use super::V4l2Device;

/// Opens candidates in order and returns the first the probe accepts.
///
/// A typical probe tries the wanted coded format on the output queue and
/// rejects nodes that cannot take it.
pub fn open_first<I, F>(candidates: I, mut accept: F) -> Result<V4l2Device>
where
    I: IntoIterator<Item = PathBuf>,
    F: FnMut(&V4l2Device) -> bool,
{
    for path in candidates {
        match V4l2Device::open(&path) {
            Ok(dev) => {
                if accept(&dev) {
                    return Ok(dev);
                }
                debug!("{}: probe declined", path.display());
            }
            Err(e) => debug!("{}: {e}", path.display()),
        }
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no acceptable video device",
    )))
}

/// Video device nodes under `/dev`, sorted, as probe candidates.
pub fn video_nodes() -> Vec<PathBuf> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir(Path::new("/dev"))
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("video"))
                })
                .collect()
        })
        .unwrap_or_default();
    nodes.sort();
    nodes
}
