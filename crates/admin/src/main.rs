//! keyspace: a one-shot command-line client.
//!
//! ```text
//! keyspace --addr 127.0.0.1:7000 put user:1 '{"name":"N"}'
//! keyspace --addr 127.0.0.1:7000 get user:1
//! keyspace --addr 127.0.0.1:7000 delete user:1
//! keyspace --addr 127.0.0.1:7000 info
//! ```

use clap::{Parser, Subcommand};
use keyspace_net::KvClient;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "keyspace", about = "Client for the keyspace distributed KV store")]
struct Args {
    /// Node address as host:port.
    #[arg(long, default_value = "127.0.0.1:7000")]
    addr: String,

    /// Connect timeout in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Store a value under a key.
    Put { key: String, value: String },
    /// Fetch a key's value and version.
    Get { key: String },
    /// Remove a key.
    Delete { key: String },
    /// Show the cluster view and the node's local store size.
    Info,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let mut client = match KvClient::connect(&args.addr, Duration::from_millis(args.timeout_ms)) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: cannot connect to {}: {e}", args.addr);
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Put { key, value } => client.put(&key, value.as_bytes()).map(|()| {
            println!("OK");
        }),
        Command::Get { key } => client.get(&key).map(|found| match found {
            Some(vv) => {
                println!("{}", String::from_utf8_lossy(&vv.value));
                println!("  timestamp: {}", vv.timestamp);
                println!("  origin:    {}", vv.origin);
            }
            None => println!("(not found)"),
        }),
        Command::Delete { key } => client.delete(&key).map(|()| {
            println!("OK");
        }),
        Command::Info => client.cluster_info().map(|(members, local_size)| {
            println!("{:<12} {:<22} {}", "NODE", "ADDRESS", "STATE");
            for m in &members {
                println!(
                    "{:<12} {:<22} {}",
                    m.node_id,
                    format!("{}:{}", m.host, m.port),
                    if m.is_alive { "alive" } else { "dead" }
                );
            }
            println!("local keys: {local_size}");
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
