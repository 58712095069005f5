//! The node snapshot file: the only durable state of a simulation.
//!
//! Layout: `{ "version", "node_count", "node_info": [Node...] }`. Files
//! written before the `version` key existed are read as version 1.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::node::Node;
use crate::{Error, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

fn current_version() -> u32 {
    SNAPSHOT_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    #[serde(default = "current_version")]
    pub version: u32,
    pub node_count: usize,
    pub node_info: Vec<Node>,
}

impl NodeInfo {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            node_count: nodes.len(),
            node_info: nodes,
        }
    }

    /// Checks version, count and that node ids match their positions.
    pub fn validate(&self) -> Result<()> {
        if self.version != SNAPSHOT_VERSION {
            return Err(Error::SnapshotVersion(self.version));
        }
        if self.node_count != self.node_info.len() {
            return Err(Error::Snapshot(format!(
                "node_count {} but {} nodes listed",
                self.node_count,
                self.node_info.len()
            )));
        }
        for (idx, node) in self.node_info.iter().enumerate() {
            if node.id != idx {
                return Err(Error::Snapshot(format!(
                    "node at index {} has id {}",
                    idx, node.id
                )));
            }
        }
        Ok(())
    }
}

/// Reads the snapshot, returning `None` when the file does not exist.
pub fn load(path: &Path) -> Result<Option<NodeInfo>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let info: NodeInfo = serde_json::from_str(&raw)?;
    info.validate()?;
    Ok(Some(info))
}

/// Writes the snapshot atomically: a temp file in the same directory is
/// renamed over the target, so readers never see a partial file.
pub fn save(path: &Path, info: &NodeInfo) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, info)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    tracing::debug!(path = %path.display(), nodes = info.node_count, "snapshot written");
    Ok(())
}
