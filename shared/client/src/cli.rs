use std::{net::IpAddr, path::PathBuf};

use clap::Args;
use sluice_logging::LogOutput;
use sluice_modeling::{ComputeDevice, ComputeDtype};
use tracing::Level;

fn parse_trim_quotes(s: &str) -> Result<String, String> {
    Ok(s.trim_matches('"').to_string())
}

#[derive(Args, Debug, Clone)]
pub struct NodeArgs {
    /// Number of nodes taking part in tensor parallelism.
    #[clap(long, env, default_value_t = 1)]
    pub world_size: usize,

    /// This node's rank. Rank 0 is the coordinator: it splits the weights,
    /// serves the shards and reads the prompt.
    #[clap(long, env, default_value_t = 0)]
    pub rank: usize,

    /// Address of the rank 0 node.
    #[clap(long, env, default_value = "127.0.0.1")]
    pub master_addr: IpAddr,

    /// Port of the collective channel on rank 0.
    #[clap(long, env, default_value_t = 29500)]
    pub control_port: u16,

    /// Port rank 0 serves shard files on.
    #[clap(long, env, default_value_t = 29600)]
    pub file_port: u16,

    /// Directory holding the pretrained model (`config.json`, `*.safetensors`, `tokenizer.json`).
    #[clap(long, env)]
    pub model_path: PathBuf,

    /// Where shards are written. Relative paths are resolved against `--model-path`.
    #[clap(long, env, default_value = "split")]
    pub save_dir: PathBuf,

    /// Comma separated share of the kv heads per node. Defaults to an even split.
    #[clap(long, env, value_delimiter = ',')]
    pub split_ratio: Option<Vec<f64>>,

    /// Number of weight blocks held in memory at once. At least 2.
    #[clap(long, env, default_value_t = 4)]
    pub memory_window: usize,

    /// Split the model again even if shards already exist (rank 0).
    #[clap(long, env)]
    pub force_split: bool,

    /// Download this node's shard again even if it already exists (rank > 0).
    #[clap(long, env)]
    pub force_download: bool,

    #[clap(long, env, default_value = "llama", value_parser = parse_trim_quotes)]
    pub model_type: String,

    /// auto, cpu, mps, cuda or cuda:<n>.
    #[clap(long, env, default_value = "auto")]
    pub device: ComputeDevice,

    /// float32, float16 or bfloat16.
    #[clap(long, env, default_value = "float32")]
    pub dtype: ComputeDtype,

    /// Prompt to continue. Read from stdin on rank 0 when absent.
    #[clap(long, env, value_parser = parse_trim_quotes)]
    pub prompt: Option<String>,

    /// Text put in front of the prompt.
    #[clap(long, env, default_value = "")]
    pub prefix: String,

    /// Tokens to generate. Negative means as many as the model's context allows.
    #[clap(long, env, default_value_t = -1, allow_negative_numbers = true)]
    pub length: i64,

    /// 0 for greedy decoding.
    #[clap(long, env, default_value_t = 1.0)]
    pub temperature: f64,

    #[clap(long, env)]
    pub top_k: Option<usize>,

    #[clap(long, env)]
    pub top_p: Option<f64>,

    #[clap(long, env, default_value_t = 42)]
    pub seed: u64,

    /// console: standard logs
    /// json: standard logs with json format
    #[clap(
        long,
        env,
        default_value_t = LogOutput::Console,
        value_enum,
        ignore_case = true
    )]
    pub logs: LogOutput,

    #[clap(long, env, default_value_t = Level::INFO)]
    pub log_level: Level,

    /// If provided, logs are also appended to this file.
    #[clap(long, env)]
    pub write_log: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[derive(Parser, Debug)]
    struct Cli {
        #[clap(flatten)]
        args: NodeArgs,
    }

    #[test]
    fn parses_a_peer_command_line() {
        let cli = Cli::try_parse_from([
            "sluice-node",
            "--world-size",
            "3",
            "--rank",
            "2",
            "--master-addr",
            "10.0.0.1",
            "--model-path",
            "/models/llama",
            "--split-ratio",
            "0.5,0.25,0.25",
            "--length",
            "-1",
            "--device",
            "cpu",
            "--dtype",
            "bf16",
        ])
        .unwrap();
        let args = cli.args;
        assert_eq!(args.world_size, 3);
        assert_eq!(args.rank, 2);
        assert_eq!(args.split_ratio, Some(vec![0.5, 0.25, 0.25]));
        assert_eq!(args.length, -1);
        assert_eq!(args.control_port, 29500);
        assert_eq!(args.memory_window, 4);
        assert_eq!(args.device, ComputeDevice(tch::Device::Cpu));
        assert_eq!(args.dtype, ComputeDtype(tch::Kind::BFloat16));
        assert_eq!(args.logs, LogOutput::Console);
    }

    #[test]
    fn model_path_is_required() {
        assert!(Cli::try_parse_from(["sluice-node"]).is_err());
    }
}
