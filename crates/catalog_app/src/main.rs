//! `catalog-harvester`: crawl listing sites into per-kind JSON collections and
//! query what has been stored.

mod commands;
mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use catalog_core::MediaKind;
use catalog_logging::LogDestination;
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use crate::config::HarvestConfig;

#[derive(Parser, Debug)]
#[command(name = "catalog-harvester")]
#[command(about = "Harvest movie and show listings with their playback links")]
#[command(version)]
struct Cli {
    /// RON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding movies.json and shows.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Where log output goes: terminal, file or both
    #[arg(long, global = true)]
    log: Option<LogDestination>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Crawl listing pages and store the new entries
    Crawl {
        #[arg(long, value_enum, default_value_t = KindArg::All)]
        kind: KindArg,
    },

    /// Print stored entries whose title contains QUERY, one JSON object per line
    Search {
        query: String,

        #[arg(long, value_enum, default_value_t = KindArg::All)]
        kind: KindArg,
    },

    /// Print every stored entry, one JSON object per line
    List {
        #[arg(long, value_enum, default_value_t = KindArg::All)]
        kind: KindArg,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Movies,
    Shows,
    All,
}

impl KindArg {
    fn kinds(self) -> Vec<MediaKind> {
        match self {
            KindArg::Movies => vec![MediaKind::Movie],
            KindArg::Shows => vec![MediaKind::Show],
            KindArg::All => MediaKind::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {:#}", err);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = HarvestConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(log) = cli.log {
        config.log = log;
    }

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    catalog_logging::initialize(config.log, level, config.log_file.as_deref());

    match cli.command {
        Command::Crawl { kind } => commands::crawl(&config, &kind.kinds()).await,
        Command::Search { query, kind } => commands::search(&config, &kind.kinds(), &query).await,
        Command::List { kind } => commands::list(&config, &kind.kinds()).await,
    }
}
