use std::{fs::OpenOptions, path::PathBuf};

use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{filter::Directive, fmt, layer::SubscriberExt, EnvFilter, Layer};

/// Environment variable that overrides the filter used for the log file.
pub const FILE_LOG_ENV: &str = "WRITE_RUST_LOG";

/// Terminal logs go to stderr; stdout carries the generated text.
const TERMINAL: fn() -> std::io::Stderr = std::io::stderr;

#[derive(Clone, Debug, Copy, ValueEnum, PartialEq)]
pub enum LogOutput {
    Console,
    Json,
    None,
}

pub struct LoggingBuilder {
    output: LogOutput,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Also append every log line to this file (optional)
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Installs the global subscriber. Fails if one is already set.
    pub fn init(self) -> anyhow::Result<()> {
        let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();

        match self.output {
            LogOutput::Console => layers.push(
                fmt::layer()
                    .with_writer(TERMINAL)
                    .with_filter(output_filter(self.level, None)?)
                    .boxed(),
            ),
            LogOutput::Json => layers.push(
                fmt::layer()
                    .json()
                    .with_writer(TERMINAL)
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_filter(output_filter(self.level, None)?)
                    .boxed(),
            ),
            LogOutput::None => {}
        }

        if let Some(path) = self.write_logs_file {
            let log_file = OpenOptions::new().append(true).create(true).open(path)?;
            let env_var = std::env::var(FILE_LOG_ENV).is_ok().then_some(FILE_LOG_ENV);
            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(log_file)
                    .with_filter(output_filter(self.level, env_var)?)
                    .boxed(),
            );
        }

        let subscriber = tracing_subscriber::registry().with(layers);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

/// `RUST_LOG` (or `env_var`) on top of `level`, with tokio's own traces muted.
fn output_filter(level: Level, env_var: Option<&str>) -> anyhow::Result<EnvFilter> {
    let builder = EnvFilter::builder().with_default_directive(level.into());
    let builder = match env_var {
        Some(var) => builder.with_env_var(var),
        None => builder,
    };
    let tokio_off: Directive = "tokio=off".parse()?;
    let runtime_off: Directive = "runtime=off".parse()?;
    Ok(builder
        .from_env()?
        .add_directive(tokio_off)
        .add_directive(runtime_off))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_keeps_the_requested_level() {
        let filter = output_filter(Level::DEBUG, Some("SLUICE_TEST_UNSET_FILTER")).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("tokio=off"), "{rendered}");
        assert!(rendered.contains("debug"), "{rendered}");
    }

    #[test]
    fn terminal_logs_use_stderr() {
        use std::io::Write;
        use tracing_subscriber::fmt::MakeWriter;

        let mut writer: std::io::Stderr = TERMINAL.make_writer();
        writer.flush().unwrap();
    }

    #[test]
    fn log_output_parses_from_the_command_line() {
        assert_eq!(LogOutput::from_str("json", true), Ok(LogOutput::Json));
        assert!(LogOutput::from_str("tui", true).is_err());
    }
}
