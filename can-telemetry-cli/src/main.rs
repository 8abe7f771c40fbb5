//! CAN Telemetry CLI Application
//!
//! Command-line front end for the can-telemetry library:
//! - Loads port schemas (built-in table plus TOML files)
//! - Ingests capture files in parallel, one private store per file
//! - Tags every session with car/driver/event metadata
//! - Prints the ingest summary and channel metadata (table or JSON)
//! - Writes line-protocol batches to an export directory

use anyhow::{bail, Context, Result};
use can_telemetry::{
    export_store, ChannelKey, ChannelStore, CyphalReassembler, ExportBatch, Framing, Ingestor,
    PortTable, ReaderSource, SourceOutcome,
};
use clap::Parser;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

mod config;
mod report;

use config::AppConfig;

/// CAN Telemetry - Ingest bus captures and export them as line protocol
#[derive(Parser, Debug)]
#[command(name = "can-telemetry-cli")]
#[command(about = "Ingest CAN captures into typed time series and export line protocol", long_about = None)]
#[command(version)]
struct Args {
    /// Capture file(s) to ingest
    #[arg(value_name = "FILE")]
    inputs: Vec<PathBuf>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Extra port schema file(s) (can be repeated)
    #[arg(long, value_name = "FILE")]
    schema: Vec<PathBuf>,

    /// Do not load the built-in vehicle control unit schemas
    #[arg(long)]
    no_builtin: bool,

    /// Session identifier for all inputs (default: file stem)
    #[arg(short, long, value_name = "ID")]
    session: Option<String>,

    /// Treat every read as an independent datagram instead of a byte stream
    #[arg(long)]
    datagram: bool,

    /// Directory for line-protocol batch files
    #[arg(short, long, value_name = "DIR")]
    export_dir: Option<PathBuf>,

    /// Maximum records per export batch
    #[arg(long, value_name = "COUNT")]
    batch_size: Option<usize>,

    /// Print channel metadata as JSON
    #[arg(long)]
    json: bool,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    log::info!("CAN Telemetry CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using telemetry library v{}", can_telemetry::VERSION);

    let config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    let config = apply_overrides(config, &args);

    if config.input.files.is_empty() {
        println!("CAN Telemetry - No input specified");
        println!("\nQuick Start:");
        println!("  can-telemetry-cli 'CAN_2024-11-20(142000).bin'");
        println!("  can-telemetry-cli --config config.toml --export-dir out/");
        println!("\nUse --help for more options");
        return Ok(());
    }

    run(&config, args.json)
}

/// Command-line flags take precedence over the configuration file
fn apply_overrides(mut config: AppConfig, args: &Args) -> AppConfig {
    config.input.files.extend(args.inputs.iter().cloned());
    config.schema_files.extend(args.schema.iter().cloned());
    if args.no_builtin {
        config.builtin_schemas = false;
    }
    if let Some(session) = &args.session {
        config.input.session_id = Some(session.clone());
    }
    if args.datagram {
        config.transport.framing = Framing::Datagram;
    }
    if let Some(dir) = &args.export_dir {
        config.export.output_dir = Some(dir.clone());
    }
    if let Some(size) = args.batch_size {
        config.export.batching.max_batch_size = size;
    }
    config
}

fn run(config: &AppConfig, json: bool) -> Result<()> {
    config.transport.validate()?;
    config.export.batching.validate()?;

    let table = load_port_table(config)?;
    let stats = table.stats();
    log::info!(
        "Port table: {} messages, {} fields",
        stats.num_messages,
        stats.num_fields
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        log::warn!("Interrupted, stopping ingestion");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;

    let (shared, outcomes) = ingest_files(config, table, &cancel)?;

    let snapshot = shared.metadata_snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", report::format_ingest_summary(&outcomes));
        println!();
        print!("{}", report::format_channel_table(&snapshot));
    }

    if let Some(dir) = &config.export.output_dir {
        export_to_dir(&shared, config, dir)?;
    }

    Ok(())
}

/// Ingest every input file in parallel into one shared store and tag its sessions.
///
/// Raising `cancel` stops the workers; whatever each file produced so far is
/// still merged and tagged.
fn ingest_files(
    config: &AppConfig,
    table: PortTable,
    cancel: &AtomicBool,
) -> Result<(ChannelStore, Vec<SourceOutcome>)> {
    let mut sources = Vec::with_capacity(config.input.files.len());
    for path in &config.input.files {
        let session_id = session_id_for(path, config.input.session_id.as_deref())?;
        let file = File::open(path).with_context(|| format!("Failed to open capture: {:?}", path))?;
        log::info!("Queued {:?} as session {}", path, session_id);
        sources.push((
            session_id,
            ReaderSource::new(file, config.transport.read_chunk_bytes),
        ));
    }

    let ingestor = Ingestor::new(Arc::new(table), config.transport.clone());
    let shared = ChannelStore::new();
    let outcomes = ingestor.ingest_parallel(sources, CyphalReassembler::new, &shared, cancel);

    let sessions: BTreeSet<&str> = outcomes.iter().map(|o| o.session_id.as_str()).collect();
    for session_id in sessions {
        let tagged = shared.tag_session(session_id, &config.session);
        log::debug!("Tagged {} channels of session {}", tagged, session_id);
    }
    if outcomes.iter().any(|o| o.report.cancelled) {
        log::warn!("Ingestion was interrupted; results are partial");
    }

    Ok((shared, outcomes))
}

fn load_port_table(config: &AppConfig) -> Result<PortTable> {
    let mut table = if config.builtin_schemas {
        PortTable::builtin()
    } else {
        PortTable::new()
    };
    for path in &config.schema_files {
        table
            .load_toml_file(path)
            .with_context(|| format!("Failed to load schema file: {:?}", path))?;
    }
    if table.is_empty() {
        bail!("No port schemas loaded; nothing would be decoded");
    }
    Ok(table)
}

/// Session identifier of a capture: the explicit one, else the file stem
fn session_id_for(path: &Path, explicit: Option<&str>) -> Result<String> {
    if let Some(id) = explicit {
        return Ok(id.to_string());
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .with_context(|| format!("Cannot derive a session identifier from {:?}", path))
}

/// Write every batch of every channel as `<session>.<measurement>.<field>.<n>.lp`
fn export_to_dir(store: &ChannelStore, config: &AppConfig, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

    let mut files = 0;
    let mut failures = 0;
    for (key, result) in export_store(store, &config.export.batching) {
        match result {
            Ok(batches) => files += write_batches(dir, &key, &batches)?,
            Err(_) => failures += 1,
        }
    }

    log::info!("Wrote {} batch files to {:?}", files, dir);
    if failures > 0 {
        bail!("{} channels could not be exported", failures);
    }
    Ok(())
}

fn write_batches(dir: &Path, key: &ChannelKey, batches: &[ExportBatch]) -> Result<usize> {
    let stem = sanitize(&format!("{}.{}.{}", key.session_id, key.measurement, key.field));
    for (index, batch) in batches.iter().enumerate() {
        let path = dir.join(format!("{}.{:04}.lp", stem, index));
        fs::write(&path, &batch.text).with_context(|| format!("Failed to write {:?}", path))?;
    }
    Ok(batches.len())
}

/// Keep file names portable
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' | '(' | ')' => c,
            _ => '_',
        })
        .collect()
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
