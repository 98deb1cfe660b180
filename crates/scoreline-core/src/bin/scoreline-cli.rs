use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use scoreline_core::{
    HeaderFormat, Renderer, ScorelineConfig, encode_datagram,
    diagnostics::init_tracing_from_config,
    fixtures::demo_session_with_options,
    no_dependencies,
    persistence::{save_json, write_if_changed},
};

#[derive(Debug, Parser)]
#[command(name = "scoreline-cli")]
#[command(about = "Headless tools for compiling and rendering scoreline sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file; defaults to discovery through SCORELINE_CONFIG_PATH and scoreline.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Only write the JSON log file.
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    DemoCompile {
        #[arg(long, default_value = "data/scores/demo.osc")]
        output: PathBuf,

        #[arg(long, default_value_t = 20.0)]
        duration: f64,
    },
    DemoReport {
        #[arg(long, default_value = "data/reports/demo.json")]
        output: PathBuf,

        #[arg(long)]
        include_controls: bool,
    },
    DemoRender {
        #[arg(long, default_value = "data/renders/demo.aiff")]
        output: PathBuf,

        #[arg(long, value_enum)]
        header: Option<HeaderArg>,

        #[arg(long)]
        duration: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HeaderArg {
    Aiff,
    Wav,
}

impl From<HeaderArg> for HeaderFormat {
    fn from(value: HeaderArg) -> Self {
        match value {
            HeaderArg::Aiff => Self::Aiff,
            HeaderArg::Wav => Self::Wav,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ScorelineConfig::load_from(path)?,
        None => ScorelineConfig::load_or_default()?,
    };
    if let Some(log_dir) = cli.log_dir {
        config.diagnostics.log_dir = log_dir;
    }
    if cli.quiet {
        config.diagnostics.console = false;
    }
    let _telemetry = init_tracing_from_config(&config.diagnostics)?;
    let session =
        demo_session_with_options(config.session.clone()).context("failed to build demo session")?;

    match cli.command {
        Commands::DemoCompile { output, duration } => {
            let bundles = session.to_request_bundles(Some(duration))?;
            let datagram = encode_datagram(&bundles, &no_dependencies)?;
            let written = write_if_changed(&output, &datagram)?;
            for bundle in &bundles {
                for request in &bundle.requests {
                    println!("{:>8.3}  {request}", bundle.timestamp);
                }
            }
            tracing::info!(
                path = %output.display(),
                written,
                bundles = bundles.len(),
                "demo score compiled"
            );
        }
        Commands::DemoReport {
            output,
            include_controls,
        } => {
            save_json(&output, &session.report())?;
            for tree in session.to_strings(include_controls) {
                println!("{tree}");
            }
            tracing::info!(path = %output.display(), "demo report generated");
        }
        Commands::DemoRender {
            output,
            header,
            duration,
        } => {
            let mut options = config.render.clone();
            if let Some(header) = header {
                options.header_format = header.into();
            }
            if duration.is_some() {
                options.duration = duration;
            }
            let outcome = Renderer::new(options)
                .render(&session, Some(&output))
                .context("demo render failed")?;
            tracing::info!(
                path = %outcome.output.display(),
                hash = %outcome.hash,
                cache_hit = outcome.cache_hit(),
                "demo render finished"
            );
        }
    }

    Ok(())
}
