use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use conduit_runtime::block_on;
use conduit_stream::{PipelineOptions, Stage, Stream, pipeline_async};
use std::path::PathBuf;
use tracing_subscriber::filter::EnvFilter;

mod config;
mod fs_stream;

#[derive(Parser)]
#[command(name = "conduit", version, about = "Move bytes through stream pipelines")]
struct Cli {
    /// Configuration file (defaults to conduit.toml in this or a parent directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a file through a pipeline
    Copy {
        input: PathBuf,
        output: PathBuf,
        /// Upper-case ASCII letters on the way through
        #[arg(long)]
        upper: bool,
        /// Read chunk size in bytes
        #[arg(long)]
        high_water_mark: Option<usize>,
    },
    /// Print a file to standard output
    Cat {
        input: PathBuf,
        #[arg(long)]
        upper: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    let level = match cli.verbose {
        0 => config.log.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    config.streams.apply();

    match cli.command {
        Commands::Copy {
            input,
            output,
            upper,
            high_water_mark,
        } => run(
            fs_stream::file_reader(input, high_water_mark),
            upper,
            fs_stream::file_writer(output),
        ),
        Commands::Cat { input, upper } => run(
            fs_stream::file_reader(input, None),
            upper,
            fs_stream::stdout_writer(),
        ),
    }
}

fn run(source: Stream, upper: bool, sink: Stream) -> Result<()> {
    let mut stages = vec![Stage::from(source)];
    if upper {
        stages.push(Stage::from(fs_stream::upper_case()));
    }
    stages.push(Stage::from(sink));

    match block_on(pipeline_async(stages, PipelineOptions::default())) {
        Some(result) => Ok(result?),
        None => anyhow::bail!("pipeline stalled before completing"),
    }
}
