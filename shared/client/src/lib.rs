mod bootstrap;
mod cli;
mod config;
mod generate;
mod node;

pub use bootstrap::bootstrap;
pub use cli::NodeArgs;
pub use config::{adjust_length_to_model, ConfigError, GenerationConfig, NodeConfig, MAX_LENGTH};
pub use generate::{generate, GenerationSummary, RootPrompt};
pub use node::run;
