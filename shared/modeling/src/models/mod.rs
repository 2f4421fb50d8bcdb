mod llama;

use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;

use crate::ArenaError;

pub use llama::{DecoderLayer, Embedding, Llama, LlamaConfig, MlpBlock, MlpDims, OutputHead};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq)]
#[serde(untagged)]
pub enum EosToks {
    Single(i64),
    Multiple(Vec<i64>),
}

impl EosToks {
    pub fn contains(&self, token: i64) -> bool {
        match self {
            EosToks::Single(eos) => *eos == token,
            EosToks::Multiple(eos) => eos.contains(&token),
        }
    }
}

/// Model families that can be split and streamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Llama,
}

impl FromStr for ModelKind {
    type Err = ModelLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "llama" => Ok(ModelKind::Llama),
            other => Err(ModelLoadError::UnsupportedModelType(other.to_string())),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Llama => write!(f, "llama"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("unsupported model type {0:?}, only llama is supported")]
    UnsupportedModelType(String),

    #[error("failed to read model config {}: {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model config {}: {source}", path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("shard holds {local} of {total} {what}, which does not match the model config")]
    ShardShape {
        what: &'static str,
        local: usize,
        total: usize,
    },

    #[error(transparent)]
    Arena(#[from] ArenaError),
}
