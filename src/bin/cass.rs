//! Pipeline entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use log::info;

use cass::input::file::XtcFileInput;
use cass::input::generator::DataGenerator;
use cass::input::InputSource;
use cass::pipeline::{self, PipelineOptions};
use cass::settings::Settings;

#[derive(Parser, Debug)]
#[command(
    name = "cass",
    about = "Event-driven acquisition and analysis pipeline for FEL experiments"
)]
struct Args {
    /// Settings file (TOML).
    #[arg(short = 'i', long = "settings")]
    settings: Option<PathBuf>,

    /// XTC input file(s); without any, a synthetic generator runs.
    #[arg(short = 'f', long = "file")]
    files: Vec<PathBuf>,

    /// Partition tag for the live monitor; enables the shared-memory server.
    #[arg(short = 'p', long = "partition")]
    partition: Option<String>,

    /// Number of shared event buffers.
    #[arg(short = 'n', long = "buffers", default_value_t = 4)]
    buffers: usize,

    /// Size of one shared buffer in bytes.
    #[arg(short = 's', long = "buffer-size", default_value_t = 0x100_0000)]
    buffer_size: usize,

    /// Number of monitor clients served.
    #[arg(short = 'c', long = "clients", default_value_t = 2)]
    clients: usize,

    /// Number of analysis workers.
    #[arg(short = 'w', long = "workers", default_value_t = cass::NBR_OF_WORKERS)]
    workers: usize,

    /// Bind address of the control surface.
    #[arg(long = "control", default_value = "127.0.0.1:12321")]
    control: String,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let settings = match &args.settings {
        Some(path) => Settings::load(path)
            .with_context(|| format!("cannot load settings from '{}'", path.display()))?,
        None => Settings::empty(),
    };

    let source: Box<dyn InputSource> = if args.files.is_empty() {
        info!("no input files given, running the synthetic generator");
        Box::new(DataGenerator::from_settings(&settings))
    } else {
        Box::new(XtcFileInput::new(args.files.clone()))
    };

    let mut options = PipelineOptions::from_settings(&settings);
    if let Some(partition) = &args.partition {
        options.partition = Some(partition.clone());
    }
    options.nbr_shm_buffers = args.buffers;
    options.shm_buffer_size = args.buffer_size;
    options.nbr_clients = args.clients;
    options.workers = args.workers.max(1);
    options.control_addr = Some(args.control.clone());

    pipeline::run(settings, source, &options).context("pipeline failed")?;
    Ok(())
}
