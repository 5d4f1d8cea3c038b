#![deny(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use estate_chat::ChatSession;
use snafu::{ResultExt, Snafu};
use tracing_subscriber::EnvFilter;

mod repl;
mod settings;

use settings::{SettingsError, SettingsLoader};

/// Terminal front-end for the real-estate market assistant.
#[derive(Debug, Parser)]
#[command(name = "estate", version)]
struct Cli {
    /// Settings file (defaults to the user config directory).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the model identifier from settings.
    #[arg(long, value_name = "ID")]
    model: Option<String>,
}

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("failed to load settings"))]
    LoadSettings { source: SettingsError },
    #[snafu(display("failed to start async runtime on `{stage}`"))]
    Runtime {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("terminal I/O failed on `{stage}`"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

#[snafu::report]
fn main() -> Result<(), AppError> {
    // Logs go to stderr so streamed replies on stdout stay readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let loader = cli
        .config
        .map(SettingsLoader::new)
        .unwrap_or_else(SettingsLoader::at_default_path);
    tracing::debug!(path = ?loader.config_path(), "loading settings");

    let mut settings = loader.load().context(LoadSettingsSnafu)?;
    if let Some(model) = cli.model {
        settings.model = model;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context(RuntimeSnafu {
            stage: "build-tokio-runtime",
        })?;

    runtime.block_on(async {
        let session = ChatSession::new(settings.build_gateway());
        let input = tokio::io::BufReader::new(tokio::io::stdin());
        repl::run(session, input, tokio::io::stdout())
            .await
            .context(TerminalSnafu { stage: "chat-loop" })
    })
}
