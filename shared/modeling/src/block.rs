use std::{cmp::Ordering, fmt, str::FromStr};

use thiserror::Error;

/// One unit of weight streaming: the embedding, a single attention or MLP
/// sub-layer, or the output head.
///
/// Blocks compare by their position in the forward pass, so `Mlp(0)` sorts
/// before `Attention(1)` regardless of how many layers the model has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockId {
    Input,
    Attention(usize),
    Mlp(usize),
    Output,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown block name {0:?}, expected input, self_attn.<layer>, mlp.<layer> or output")]
pub struct UnknownBlockName(pub String);

impl BlockId {
    fn sort_key(&self) -> (u8, usize, u8) {
        match self {
            BlockId::Input => (0, 0, 0),
            BlockId::Attention(layer) => (1, *layer, 0),
            BlockId::Mlp(layer) => (1, *layer, 1),
            BlockId::Output => (2, 0, 0),
        }
    }

    /// The layer this block belongs to, if any.
    pub fn layer(&self) -> Option<usize> {
        match self {
            BlockId::Attention(layer) | BlockId::Mlp(layer) => Some(*layer),
            BlockId::Input | BlockId::Output => None,
        }
    }

    /// Name of the shard file holding this block's parameters.
    pub fn file_name(&self) -> String {
        match self {
            BlockId::Input => "input.bin".to_string(),
            BlockId::Attention(layer) => format!("attn_{layer}.bin"),
            BlockId::Mlp(layer) => format!("mlp_{layer}.bin"),
            BlockId::Output => "output.bin".to_string(),
        }
    }

    /// Only the output head may be missing from a shard.
    pub fn is_optional(&self) -> bool {
        matches!(self, BlockId::Output)
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BlockId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Input => write!(f, "input"),
            BlockId::Attention(layer) => write!(f, "self_attn.{layer}"),
            BlockId::Mlp(layer) => write!(f, "mlp.{layer}"),
            BlockId::Output => write!(f, "output"),
        }
    }
}

impl FromStr for BlockId {
    type Err = UnknownBlockName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownBlockName(s.to_string());
        match s {
            "input" => Ok(BlockId::Input),
            "output" => Ok(BlockId::Output),
            _ => {
                let (kind, layer) = s.split_once('.').ok_or_else(unknown)?;
                if layer.is_empty() || !layer.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(unknown());
                }
                let layer = layer.parse::<usize>().map_err(|_| unknown())?;
                match kind {
                    "self_attn" => Ok(BlockId::Attention(layer)),
                    "mlp" => Ok(BlockId::Mlp(layer)),
                    _ => Err(unknown()),
                }
            }
        }
    }
}

/// The fixed traversal order of blocks for a model with `num_layers` decoder
/// layers: input, then attention and MLP for each layer, then output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSequence {
    num_layers: usize,
    blocks: Vec<BlockId>,
}

impl BlockSequence {
    pub fn new(num_layers: usize) -> Self {
        let mut blocks = Vec::with_capacity(num_layers * 2 + 2);
        blocks.push(BlockId::Input);
        for layer in 0..num_layers {
            blocks.push(BlockId::Attention(layer));
            blocks.push(BlockId::Mlp(layer));
        }
        blocks.push(BlockId::Output);
        Self { num_layers, blocks }
    }

    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<BlockId> {
        self.blocks.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().copied()
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.position(block).is_some()
    }

    /// Index of `block` in the sequence, or `None` if its layer is past the
    /// end of the model.
    pub fn position(&self, block: BlockId) -> Option<usize> {
        match block {
            BlockId::Input => Some(0),
            BlockId::Attention(layer) if layer < self.num_layers => Some(1 + 2 * layer),
            BlockId::Mlp(layer) if layer < self.num_layers => Some(2 + 2 * layer),
            BlockId::Output => Some(self.blocks.len() - 1),
            _ => None,
        }
    }

    /// The block whose weights are needed once layer `layer`'s MLP is done.
    pub fn after_mlp(&self, layer: usize) -> BlockId {
        if layer + 1 < self.num_layers {
            BlockId::Attention(layer + 1)
        } else {
            BlockId::Output
        }
    }
}
