//! Duet - play with a generative model from a MIDI keyboard.
//!
//! Connects to a MIDI input and output (preferring IAC Driver on macOS), then
//! runs a session until `q` is entered on stdin.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duet::archive::{Archive, DirectoryArchive, MemoryArchive};
use duet::midi::{connect_input, MidiOut, MidiSink};
use duet::model::EchoModel;
use duet::runtime::{run_session, Command};
use duet::sink::{PlaybackSink, TraceSink};
use duet::{DuetConfig, Engine, History};

#[derive(Parser, Debug)]
#[command(name = "duet", about = "Play a duet with a generative model")]
struct Args {
    /// Config file (defaults to duet_config.yaml next to the manifest)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write archived histories here (overrides the config)
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// Start by replaying a shared history (.yaml or .mid)
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Run without MIDI devices; output is logged
    #[arg(long)]
    no_midi: bool,

    /// Simulated model latency
    #[arg(long, default_value_t = 0)]
    model_latency_ms: u64,

    /// Title for recorded histories
    #[arg(long)]
    title: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(DuetConfig::default_path);
    let mut config = DuetConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    if let Some(dir) = args.archive_dir.clone() {
        config.archive_dir = Some(dir);
    }
    let instrument = config.instrument.clone();

    let sink: Box<dyn PlaybackSink> = if args.no_midi {
        Box::new(TraceSink)
    } else {
        match MidiOut::new(instrument.output_device.as_deref()) {
            Ok(out) => Box::new(MidiSink::new(
                out,
                instrument.lowest_midi_note,
                config.output_channel_index(),
            )),
            Err(e) => {
                warn!(error = %e, "no MIDI output, logging notes instead");
                Box::new(TraceSink)
            }
        }
    };

    let archive: Box<dyn Archive> = match &config.archive_dir {
        Some(dir) => Box::new(
            DirectoryArchive::new(dir, instrument.lowest_midi_note, config.output_channel_index())
                .with_context(|| format!("creating archive directory {}", dir.display()))?,
        ),
        None => Box::new(MemoryArchive::new()),
    };

    let mut engine = Engine::new(config, sink, archive)?;
    if let Some(title) = args.title {
        engine.set_title(title);
    }
    if let Some(path) = &args.replay {
        let shared = History::load_shared(path, instrument.lowest_midi_note, instrument.num_keys)
            .with_context(|| format!("loading shared history {}", path.display()))?;
        engine.load_shared(shared);
    }

    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let _input_connection = if args.no_midi {
        None
    } else {
        match connect_input(
            instrument.input_device.as_deref(),
            instrument.lowest_midi_note,
            instrument.num_keys,
            input_tx,
        ) {
            Ok((connection, _)) => Some(connection),
            Err(e) => {
                warn!(error = %e, "no MIDI input, only replay and commands available");
                None
            }
        }
    };

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || read_commands(command_tx));
    info!("commands: r = rewind, x = reset, q = quit");

    let model = Arc::new(EchoModel::new(Duration::from_millis(args.model_latency_ms)));
    let engine = run_session(engine, model, input_rx, command_rx).await;
    info!(histories = engine.histories().len(), "bye");
    Ok(())
}

fn read_commands(commands: UnboundedSender<Command>) {
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        match Command::parse(&line) {
            Some(command) => {
                if commands.send(command).is_err() || command == Command::Quit {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => warn!(input = %line.trim(), "unknown command"),
        }
    }
}
