//! Command-line interface and tracing initialization.

use crate::constants::{ENV_HDT_LOG, ENV_HDT_LOG_FILE, ENV_HDT_LOG_FORMAT};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "hdt",
    version,
    about = "HTTP API documentor and dependency-driven end-to-end tester",
    long_about = "hdt reads a directory of API descriptors, emits Swagger 2.0\n\
                  documentation, and runs the described APIs as end-to-end tests,\n\
                  discovering their execution order from the variables each API\n\
                  consumes and produces.\n\n\
                  Examples:\n  \
                  hdt gendoc --indir ./apis --outdir ./docs\n  \
                  hdt compile --indir ./apis --config prod.json\n  \
                  hdt run --indir ./apis --var uaaHost=http://localhost:8080 --tests login"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project root directory holding hdt.yaml and the vhost directories
    #[arg(long, global = true, value_name = "DIR", default_value = ".")]
    pub indir: PathBuf,

    /// Output directory for generated documents (defaults to --indir)
    #[arg(long, global = true, value_name = "DIR")]
    pub outdir: Option<PathBuf>,

    /// JSON variable files, merged left to right
    #[arg(long, global = true, value_name = "FILE[,FILE]", value_delimiter = ',')]
    pub config: Vec<PathBuf>,

    /// Variable override; repeatable, wins over --config
    #[arg(long = "var", global = true, value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// Test-name prefixes selecting the APIs to run
    #[arg(long, global = true, value_name = "PREFIX[,PREFIX]", value_delimiter = ',')]
    pub tests: Vec<String>,

    /// Log level (falls back to the HDT_LOG environment variable)
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log: Option<LogLevel>,

    /// Alias for --log trace
    #[arg(short = 'v', global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Emit one Swagger 2.0 document per virtual host
    Gendoc,
    /// Build the test execution tree and print it
    Compile,
    /// Compile and execute the end-to-end tests
    Run,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Wrapper type to write logs to file or stderr.
struct FileOrStderr {
    file: Option<std::sync::Mutex<std::fs::File>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FileOrStderr {
    type Writer = Box<dyn std::io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        self.file
            .as_ref()
            .and_then(|mutex| mutex.lock().ok())
            .and_then(|file| file.try_clone().ok())
            .map_or_else(
                || Box::new(std::io::stderr()) as Self::Writer,
                |cloned| Box::new(cloned) as Self::Writer,
            )
    }
}

/// Initialize tracing-subscriber for the CLI.
///
/// Precedence for the filter: `-v` (trace), then `--log`, then the
/// `HDT_LOG` environment variable, then `warn`. `HDT_LOG_FORMAT` selects
/// `text` or `json` output; `HDT_LOG_FILE` redirects logs to a file.
pub fn init_tracing(level: Option<LogLevel>, verbose: bool) {
    use std::fs::OpenOptions;
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level_str = if verbose {
        "trace".to_string()
    } else if let Some(level) = level {
        level.as_str().to_string()
    } else {
        std::env::var(ENV_HDT_LOG).unwrap_or_else(|_| "warn".to_string())
    };

    let env_filter = EnvFilter::try_new(&level_str)
        .or_else(|_| EnvFilter::try_new("warn"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_format = std::env::var(ENV_HDT_LOG_FORMAT)
        .map_or_else(|_| "text".to_string(), |s| s.to_lowercase());

    let writer = std::env::var(ENV_HDT_LOG_FILE).ok().map_or_else(
        || FileOrStderr { file: None },
        |path| match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => FileOrStderr {
                file: Some(Mutex::new(file)),
            },
            Err(e) => {
                // Tracing is not initialized yet; stderr is the only channel.
                eprintln!("Warning: could not open log file '{path}': {e}. Using stderr.");
                FileOrStderr { file: None }
            }
        },
    );

    if log_format == "json" {
        let json_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_list(false)
            .with_target(false)
            .with_writer(writer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(json_layer)
            .init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(writer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
}
