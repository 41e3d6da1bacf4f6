//! Tandem RPC demo.
//!
//! `tandem-rpc parent` spawns this same binary as `tandem-rpc child` and
//! exercises calls in both directions over tandem IPC.

mod endpoints;

use anyhow::Result;
use clap::{Parser, Subcommand};
use endpoints::Worker;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_ipc::{ChildIpc, IpcConfig, ParentIpc, Value};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tandem-rpc")]
#[command(about = "Parent/child RPC demo for tandem IPC")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Spawn a child and call into it
    Parent {
        /// Child executable (defaults to this binary)
        #[arg(long)]
        child: Option<PathBuf>,

        /// How long to wait for the child to connect
        #[arg(long, default_value = "10000")]
        accept_timeout_ms: u64,
    },
    /// Serve calls from a parent
    Child {
        /// Socket path injected by the parent
        #[arg(long = "ipc-socket")]
        ipc_socket: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        Command::Parent {
            child,
            accept_timeout_ms,
        } => run_parent(child, Duration::from_millis(accept_timeout_ms), args.debug).await,
        Command::Child { ipc_socket } => run_child(ipc_socket).await,
    }
}

async fn run_parent(child: Option<PathBuf>, accept_timeout: Duration, debug: bool) -> Result<()> {
    let program = match child {
        Some(path) => path,
        None => std::env::current_exe()?,
    };
    let mut child_args = Vec::new();
    if debug {
        child_args.push("--debug");
    }
    child_args.push("child");

    let config = IpcConfig::new()
        .register(endpoints::host())
        .with_accept_timeout(accept_timeout);
    let mut ipc = ParentIpc::new(&program, child_args, config);

    info!("Starting child {}", program.display());
    ipc.start().await?;

    // Output lines are read by callers of the demo (intentional stdout)
    let quotient = ipc.call("Math.Div", [10, 2]).await?;
    println!("Math.Div(10, 2) = {:?}", quotient);

    match ipc.call("Math.Div", [1, 0]).await {
        Ok(result) => println!("Math.Div(1, 0) = {:?}", result),
        Err(e) => println!("Math.Div(1, 0) failed: {}", e),
    }

    let xored = ipc
        .call(
            "Math.XorData",
            [Value::from(&b"tandem"[..]), Value::from(vec![0x20u8; 6])],
        )
        .await?;
    println!("Math.XorData = {:?}", xored);

    let sum = ipc
        .call("Math.Sum", [Value::from(vec![Value::Int(1), Value::Int(2), Value::Int(3)])])
        .await?;
    println!("Math.Sum([1, 2, 3]) = {:?}", sum);

    let greeting = ipc.call("Worker.Ask", ["Host.Greet"]).await?;
    println!("Worker.Ask(Host.Greet) = {:?}", greeting);

    ipc.stop().await?;
    info!("Child stopped");
    Ok(())
}

async fn run_child(ipc_socket: PathBuf) -> Result<()> {
    let worker = Arc::new(Worker::default());
    let config = IpcConfig::new()
        .register(endpoints::math())
        .register(endpoints::worker(worker.clone()));

    let mut ipc = ChildIpc::new(&ipc_socket, config);
    worker.attach(&ipc.handle());

    ipc.start().await?;
    info!("Child serving on {}", ipc.socket_path().display());

    tokio::select! {
        result = ipc.wait() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupt received, exiting"),
    }

    Ok(())
}
