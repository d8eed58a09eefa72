/*!
 * Conduit CLI
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use conduit::{
    config::{ConduitConfig, DataPlaneConfig, DataPlaneKind},
    error::{ConduitError, TransferError, EXIT_FATAL, EXIT_SUCCESS, EXIT_TRANSFER_FAILED},
    logging, EndpointDescriptor, Engine, TransferProcess, TransferRequest, TransferState,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(version, about = "Dataspace transfer engine: data-plane selection and transfer state machine", long_about = None)]
struct Cli {
    /// Configuration file (TOML); defaults apply when omitted
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: recover stored transfers, then serve notifications until Ctrl-C
    Run,

    /// Submit one transfer through an in-process data plane and wait for the outcome
    Transfer {
        /// Source address (a path for FILE)
        #[arg(short = 's', long = "source", value_name = "ADDRESS")]
        source: String,

        /// Destination address (a path for FILE)
        #[arg(short = 'd', long = "dest", value_name = "ADDRESS")]
        destination: String,

        /// Transport type the data plane must support
        #[arg(short = 't', long = "transport", default_value = "FILE")]
        transport: String,

        /// Contract agreement reference
        #[arg(long = "contract", default_value = "local")]
        contract: String,

        /// Source endpoint property, e.g. payload=hello for INLINE
        #[arg(short = 'p', long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },

    /// Show stored transfers
    Status {
        /// Print a single process
        #[arg(long)]
        id: Option<String>,
    },
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn parse_property(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

/// Map an error chain onto the process exit code
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<ConduitError>() {
        return e.exit_code();
    }
    match err.downcast_ref::<TransferError>() {
        Some(e) if !e.is_infrastructure() => EXIT_TRANSFER_FAILED,
        _ => EXIT_FATAL,
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => ConduitConfig::from_file(path)?,
        None => ConduitConfig::default(),
    };

    if let Err(e) = logging::init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    match cli.command {
        Commands::Run => runtime.block_on(run_engine(config)),
        Commands::Transfer {
            source,
            destination,
            transport,
            contract,
            properties,
        } => {
            let source = properties
                .into_iter()
                .fold(EndpointDescriptor::new(source, transport.as_str()), |endpoint, (k, v)| {
                    endpoint.with_property(k, v)
                });
            runtime.block_on(run_transfer(config, source, destination, transport, contract))
        }
        Commands::Status { id } => runtime.block_on(show_status(config, id)),
    }
}

async fn run_engine(config: ConduitConfig) -> Result<i32> {
    let engine = Engine::build(config)?;
    let report = engine.manager().recover().await?;
    println!(
        "Recovered {} transfer(s): {} started, {} adopted, {} re-sent, {} awaiting, {} errors",
        report.total(),
        report.started,
        report.adopted,
        report.reinitiated,
        report.awaiting,
        report.errors
    );

    let (mut handle, task) = engine.spawn();
    tokio::signal::ctrl_c().await?;
    handle.shutdown();
    if let Err(e) = task.await {
        eprintln!("Warning: event loop ended abnormally: {}", e);
        return Ok(EXIT_FATAL);
    }
    Ok(EXIT_SUCCESS)
}

async fn run_transfer(
    mut config: ConduitConfig,
    source: EndpointDescriptor,
    destination: String,
    transport: String,
    contract: String,
) -> Result<i32> {
    if config.data_planes.is_empty() {
        config.data_planes.push(DataPlaneConfig {
            id: "dp-local".to_string(),
            transport_types: vec!["FILE".to_string(), "INLINE".to_string()],
            kind: DataPlaneKind::Local,
        });
    }

    let engine = Engine::build(config)?;
    let mut events = engine.dispatcher().subscribe("cli");
    let (mut handle, task) = engine.spawn();
    let manager = handle.manager().clone();

    let request = TransferRequest::new(
        contract,
        source,
        EndpointDescriptor::new(destination, "FILE"),
        transport.as_str(),
    );
    let submitted = manager.submit(request).await?;
    let mut process = manager.start(&submitted.id).await?;

    while !process.is_terminal() {
        match events.recv().await {
            Some(event) if event.process_id == process.id && event.is_terminal() => {
                process = manager.find(&process.id).await?;
            }
            Some(_) => {}
            None => break,
        }
    }

    handle.shutdown();
    let _ = task.await;

    print_process(&process)?;

    Ok(if process.state == TransferState::Completed {
        EXIT_SUCCESS
    } else {
        EXIT_TRANSFER_FAILED
    })
}

async fn show_status(config: ConduitConfig, id: Option<String>) -> Result<i32> {
    let store = conduit_store::open(config.store.path.as_deref())?;

    if let Some(id) = id {
        let process = store
            .find(&id)
            .await
            .with_context(|| format!("Failed to load transfer {}", id))?;
        print_process(&process)?;
        return Ok(EXIT_SUCCESS);
    }

    let stats = store.stats().await?;
    println!(
        "{} transfer(s): {} requested, {} provisioning, {} in progress, {} completed, {} failed, {} terminated",
        stats.total,
        stats.requested,
        stats.provisioning,
        stats.in_progress,
        stats.completed,
        stats.failed,
        stats.terminated
    );
    for process in store.list().await? {
        println!(
            "{:<38} {:<13} {:<12} {}",
            process.id,
            process.state.to_string(),
            process.transport_type.to_string(),
            process.reason.as_ref().map(|r| r.code()).unwrap_or("-")
        );
    }

    Ok(if stats.has_failures() {
        EXIT_TRANSFER_FAILED
    } else {
        EXIT_SUCCESS
    })
}

fn print_process(process: &TransferProcess) -> Result<()> {
    let json = serde_json::to_string_pretty(process).context("Failed to encode process")?;
    println!("{}", json);
    Ok(())
}
