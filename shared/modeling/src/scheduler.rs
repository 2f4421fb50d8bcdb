use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
};

use tch::{TchError, Tensor};
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    ArenaError, BlockId, BlockSequence, MemoryHistory, MemoryProbe, ParameterArena, ParameterId,
    ShardManifest, UnknownBlockName,
};

#[derive(Debug, Error)]
pub enum StreamingError {
    #[error(transparent)]
    UnknownBlock(#[from] UnknownBlockName),

    #[error("block {block} is outside the canonical sequence of a {num_layers}-layer model")]
    BlockOutOfRange { block: BlockId, num_layers: usize },

    #[error("block {block} requested after the window already moved past it to {front}")]
    OutOfOrder { block: BlockId, front: BlockId },

    #[error("memory window must hold at least 2 blocks, got {0}")]
    WindowTooSmall(usize),

    #[error("shard file {} for block {block} not found", path.display())]
    MissingShard { block: BlockId, path: PathBuf },

    #[error("failed to read shard file {}: {source}", path.display())]
    ReadShard {
        path: PathBuf,
        #[source]
        source: TchError,
    },

    #[error("failed to load block {block} from {}: {source}", path.display())]
    Load {
        block: BlockId,
        path: PathBuf,
        #[source]
        source: ArenaError,
    },

    #[error("failed to spawn streaming worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("streaming worker is gone")]
    WorkerGone,
}

/// Keeps at most `capacity` consecutive blocks of one node's shard resident,
/// moving a window forward through the block sequence as the forward pass
/// progresses.
///
/// The scheduler is the only writer of the parameter arena. Blocks enter at the
/// back of the window in canonical order and leave from the front once the
/// forward pass has moved strictly past them.
pub struct MemoryWindowScheduler {
    sequence: BlockSequence,
    manifest: ShardManifest,
    arena: ParameterArena,
    capacity: usize,
    window: VecDeque<BlockId>,
    resident: HashMap<BlockId, Vec<ParameterId>>,
    probe: Box<dyn MemoryProbe>,
    history: MemoryHistory,
}

impl MemoryWindowScheduler {
    pub fn new(
        sequence: BlockSequence,
        manifest: ShardManifest,
        arena: ParameterArena,
        capacity: usize,
        mut probe: Box<dyn MemoryProbe>,
    ) -> Result<Self, StreamingError> {
        if capacity < 2 {
            return Err(StreamingError::WindowTooSmall(capacity));
        }
        let mut history = MemoryHistory::new();
        history.record(probe.resident_bytes());
        Ok(Self {
            sequence,
            manifest,
            arena,
            capacity,
            window: VecDeque::with_capacity(capacity),
            resident: HashMap::new(),
            probe,
            history,
        })
    }

    pub fn sequence(&self) -> &BlockSequence {
        &self.sequence
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn arena(&self) -> &ParameterArena {
        &self.arena
    }

    pub fn history(&self) -> &MemoryHistory {
        &self.history
    }

    /// Resident blocks, front of the window first.
    pub fn window(&self) -> Vec<BlockId> {
        self.window.iter().copied().collect()
    }

    pub fn position(&self, block: BlockId) -> Result<usize, StreamingError> {
        self.sequence
            .position(block)
            .ok_or(StreamingError::BlockOutOfRange {
                block,
                num_layers: self.sequence.num_layers(),
            })
    }

    /// Announces that the forward pass is about to read `block`.
    ///
    /// Releases every resident block strictly before it (everything, when
    /// `block` is the input, which starts a new pass), then loads forward from
    /// `block` until the window is full, then records a memory sample.
    pub fn track(&mut self, block: BlockId) -> Result<(), StreamingError> {
        let target = self.position(block)?;

        while let Some(&front) = self.window.front() {
            if block == BlockId::Input || self.position(front)? < target {
                self.window.pop_front();
                self.release(front);
            } else {
                break;
            }
        }

        if let Some(&front) = self.window.front() {
            if front > block {
                return Err(StreamingError::OutOfOrder { block, front });
            }
        }

        for index in target..self.sequence.len() {
            if self.window.len() >= self.capacity {
                break;
            }
            let Some(next) = self.sequence.get(index) else {
                break;
            };
            if self.window.contains(&next) {
                continue;
            }
            let loaded = self.load(next)?;
            self.resident.insert(next, loaded);
            self.window.push_back(next);
        }

        let sample = self.history.record(self.probe.resident_bytes());
        trace!(
            block = %block,
            window = ?self.window,
            resident_bytes = sample.resident_bytes,
            "tracked block"
        );
        Ok(())
    }

    fn load(&mut self, block: BlockId) -> Result<Vec<ParameterId>, StreamingError> {
        let Some(entry) = self.manifest.entry(block) else {
            return Err(StreamingError::BlockOutOfRange {
                block,
                num_layers: self.sequence.num_layers(),
            });
        };
        let path = entry.path.clone();
        if !path.is_file() {
            if entry.optional {
                debug!(block = %block, path = %path.display(), "optional shard file absent, skipping");
                return Ok(Vec::new());
            }
            return Err(StreamingError::MissingShard { block, path });
        }

        let mut tensors =
            Tensor::read_safetensors(&path).map_err(|source| StreamingError::ReadShard {
                path: path.clone(),
                source,
            })?;
        tensors.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut loaded = Vec::with_capacity(tensors.len());
        for (name, value) in tensors {
            let Some(id) = self.arena.id(&name) else {
                trace!(block = %block, name = %name, "shard tensor has no model parameter, ignoring");
                continue;
            };
            if let Err(source) = self.arena.overwrite(id, &value) {
                // a half-loaded block is not resident
                for id in loaded {
                    self.arena.release(id);
                }
                return Err(StreamingError::Load { block, path, source });
            }
            loaded.push(id);
        }
        debug!(block = %block, parameters = loaded.len(), "loaded block");
        Ok(loaded)
    }

    fn release(&mut self, block: BlockId) {
        let ids = self.resident.remove(&block).unwrap_or_default();
        for id in &ids {
            self.arena.release(*id);
        }
        debug!(block = %block, parameters = ids.len(), "released block");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArenaBuilder, BlockSequence, ShardManifest};
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use tch::{Device, Kind};

    const LAYERS: usize = 2;

    fn write_block(dir: &Path, block: BlockId, name: &str, value: f64) {
        let tensor = Tensor::full([2, 2], value, (Kind::Float, Device::Cpu));
        Tensor::write_safetensors(&[(name, tensor)], dir.join(block.file_name())).unwrap();
    }

    fn param_name(block: BlockId) -> String {
        format!("{block}.weight")
    }

    fn scheduler(dir: &Path, capacity: usize, with_output: bool) -> MemoryWindowScheduler {
        let sequence = BlockSequence::new(LAYERS);
        let mut builder = ArenaBuilder::new(Kind::Float, Device::Cpu);
        for block in sequence.iter() {
            builder.declare(param_name(block), &[2, 2]).unwrap();
            if block == BlockId::Output && !with_output {
                continue;
            }
            write_block(dir, block, &param_name(block), 1.0);
        }
        let manifest = ShardManifest::from_dir(dir, &sequence);
        MemoryWindowScheduler::new(
            sequence,
            manifest,
            builder.finish(),
            capacity,
            Box::new(|| 0u64),
        )
        .unwrap()
    }

    #[test]
    fn window_of_one_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sequence = BlockSequence::new(1);
        let manifest = ShardManifest::from_dir(dir.path(), &sequence);
        let arena = ArenaBuilder::new(Kind::Float, Device::Cpu).finish();
        assert!(matches!(
            MemoryWindowScheduler::new(sequence, manifest, arena, 1, Box::new(|| 0u64)),
            Err(StreamingError::WindowTooSmall(1))
        ));
    }

    #[test]
    fn walks_forward_and_releases_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(dir.path(), 3, true);
        use BlockId::*;

        scheduler.track(Input).unwrap();
        assert_eq!(scheduler.window(), vec![Input, Attention(0), Mlp(0)]);

        scheduler.track(Attention(0)).unwrap();
        assert_eq!(scheduler.window(), vec![Attention(0), Mlp(0), Attention(1)]);

        scheduler.track(Mlp(0)).unwrap();
        assert_eq!(scheduler.window(), vec![Mlp(0), Attention(1), Mlp(1)]);

        let released = scheduler.arena().get(&param_name(Attention(0))).unwrap();
        assert!(!released.is_resident());
        assert_eq!(released.tensor().size(), vec![0]);
        let loaded = scheduler.arena().get(&param_name(Mlp(1))).unwrap();
        assert!(loaded.is_resident());

        scheduler.track(Output).unwrap();
        assert_eq!(scheduler.window(), vec![Output]);

        scheduler.track(Input).unwrap();
        assert_eq!(scheduler.window(), vec![Input, Attention(0), Mlp(0)]);
        assert_eq!(scheduler.arena().resident_bytes(), 3 * 16);
    }

    #[test]
    fn absent_output_still_occupies_its_slot() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(dir.path(), 2, false);
        scheduler.track(BlockId::Mlp(1)).unwrap();
        assert_eq!(scheduler.window(), vec![BlockId::Mlp(1), BlockId::Output]);
        scheduler.track(BlockId::Output).unwrap();
        assert_eq!(scheduler.window(), vec![BlockId::Output]);
        assert!(!scheduler
            .arena()
            .get(&param_name(BlockId::Output))
            .unwrap()
            .is_resident());
    }

    #[test]
    fn missing_required_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(dir.path(), 2, true);
        let path = dir.path().join("mlp_0.bin");
        std::fs::remove_file(&path).unwrap();
        match scheduler.track(BlockId::Attention(0)) {
            Err(StreamingError::MissingShard { block, path: reported }) => {
                assert_eq!(block, BlockId::Mlp(0));
                assert_eq!(reported, path);
            }
            other => panic!("expected missing shard, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_and_backward_requests_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(dir.path(), 2, true);
        assert!(matches!(
            scheduler.track(BlockId::Attention(LAYERS)),
            Err(StreamingError::BlockOutOfRange { .. })
        ));
        scheduler.track(BlockId::Mlp(1)).unwrap();
        assert!(matches!(
            scheduler.track(BlockId::Attention(0)),
            Err(StreamingError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn tracking_input_twice_keeps_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(dir.path(), 3, true);
        scheduler.track(BlockId::Input).unwrap();
        let window = scheduler.window();
        let resident = scheduler.arena().resident_bytes();

        scheduler.track(BlockId::Input).unwrap();
        assert_eq!(scheduler.window(), window);
        assert_eq!(scheduler.arena().resident_bytes(), resident);
    }

    #[test]
    fn window_is_the_canonical_run_from_the_tracked_block() {
        let sequence = BlockSequence::new(LAYERS);
        let blocks: Vec<_> = sequence.iter().collect();
        for capacity in 2..=blocks.len() + 1 {
            let dir = tempfile::tempdir().unwrap();
            let mut scheduler = scheduler(dir.path(), capacity, true);
            for (index, &block) in blocks.iter().enumerate() {
                scheduler.track(block).unwrap();
                let window = scheduler.window();
                assert!(window.len() <= capacity, "W={capacity} after {block}");
                assert!(
                    window.windows(2).all(|pair| pair[0] < pair[1]),
                    "W={capacity} after {block}: {window:?}"
                );
                let expected: Vec<_> = blocks[index..].iter().copied().take(capacity).collect();
                assert_eq!(window, expected, "W={capacity} after {block}");
                assert_eq!(
                    scheduler.arena().resident_bytes(),
                    16 * window.len() as u64,
                    "W={capacity} after {block}"
                );
            }
        }
    }

    #[test]
    fn failed_load_leaves_nothing_resident() {
        let dir = tempfile::tempdir().unwrap();
        let sequence = BlockSequence::new(1);
        let mut builder = ArenaBuilder::new(Kind::Float, Device::Cpu);
        builder.declare("a.weight", &[2, 2]).unwrap();
        builder.declare("b.weight", &[2, 2]).unwrap();
        let fits = Tensor::ones([2, 2], (Kind::Float, Device::Cpu));
        let too_big = Tensor::ones([3, 3], (Kind::Float, Device::Cpu));
        Tensor::write_safetensors(
            &[("a.weight", fits), ("b.weight", too_big)],
            dir.path().join(BlockId::Input.file_name()),
        )
        .unwrap();
        let manifest = ShardManifest::from_dir(dir.path(), &sequence);
        let mut scheduler =
            MemoryWindowScheduler::new(sequence, manifest, builder.finish(), 2, Box::new(|| 0u64))
                .unwrap();

        assert!(matches!(
            scheduler.track(BlockId::Input),
            Err(StreamingError::Load {
                block: BlockId::Input,
                ..
            })
        ));
        assert!(!scheduler.arena().get("a.weight").unwrap().is_resident());
        assert_eq!(scheduler.arena().resident_bytes(), 0);
    }

    #[test]
    fn records_sample_per_track() {
        let dir = tempfile::tempdir().unwrap();
        let mut scheduler = scheduler(dir.path(), 2, true);
        assert_eq!(scheduler.history().len(), 1);
        scheduler.track(BlockId::Input).unwrap();
        scheduler.track(BlockId::Attention(0)).unwrap();
        assert_eq!(scheduler.history().len(), 3);
    }
}
