use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::{BlockId, BlockSequence, StreamingError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    pub optional: bool,
}

/// Where each block of one node's shard lives on disk.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ShardManifest {
    dir: PathBuf,
    entries: HashMap<BlockId, ManifestEntry>,
}

/// `<split_root>/node_<rank>`, the directory holding one node's shard files.
pub fn node_dir(split_root: &Path, rank: usize) -> PathBuf {
    split_root.join(format!("node_{rank}"))
}

impl ShardManifest {
    pub fn for_node(split_root: &Path, rank: usize, sequence: &BlockSequence) -> Self {
        Self::from_dir(node_dir(split_root, rank), sequence)
    }

    pub fn from_dir(dir: impl Into<PathBuf>, sequence: &BlockSequence) -> Self {
        let dir = dir.into();
        let entries = sequence
            .iter()
            .map(|block| {
                let entry = ManifestEntry {
                    path: dir.join(block.file_name()),
                    optional: block.is_optional(),
                };
                (block, entry)
            })
            .collect();
        Self { dir, entries }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry(&self, block: BlockId) -> Option<&ManifestEntry> {
        self.entries.get(&block)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks that every required shard file exists, reporting the first
    /// missing one in canonical order.
    pub fn verify(&self) -> Result<(), StreamingError> {
        let mut required = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.optional)
            .collect::<Vec<_>>();
        required.sort_by_key(|(block, _)| **block);
        for (block, entry) in required {
            if !entry.path.is_file() {
                return Err(StreamingError::MissingShard {
                    block: *block,
                    path: entry.path.clone(),
                });
            }
        }
        Ok(())
    }
}
