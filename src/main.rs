//! plremote - command-line client for a PLearn-style computation server.
//!
//! Launches (or connects to) a server, runs one command against it and
//! closes the connection again.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plremote::{ClientConfig, Connection, Endpoint, Reply, Value};

#[derive(Parser)]
#[command(name = "plremote")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Talk to a remote PLearn server", long_about = None)]
struct Cli {
    /// Command line used to launch the server (overrides the config file)
    #[arg(long, global = true, conflicts_with = "connect")]
    command: Option<String>,

    /// Connect to a listening server instead (host:port, tcp://, unix://)
    #[arg(long, global = true)]
    connect: Option<String>,

    /// Log every request and reply
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand)]
enum Action {
    /// Check that the server answers a ping
    Ping,

    /// Call a remote function and print its results as JSON
    Call {
        /// Function name
        name: String,

        /// Arguments as JSON values; anything that is not JSON is a string
        args: Vec<String>,
    },

    /// List the server's functions
    Functions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "plremote=info".into()),
        ))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::load()?;
    if let Some(command) = &cli.command {
        config.command = command.clone();
    }
    if cli.verbose {
        config.log_traffic = true;
    }

    let conn = open(&cli, &config).await?;
    let outcome = run(&conn, cli.action).await;
    conn.close().await;
    outcome
}

async fn open(cli: &Cli, config: &ClientConfig) -> Result<Connection> {
    match &cli.connect {
        Some(endpoint) => {
            let endpoint: Endpoint = endpoint.parse()?;
            Connection::connect_with_retry(&endpoint, config)
                .await
                .with_context(|| format!("Failed to connect to {}", endpoint))
        }
        None => Connection::launch(&config.command, config)
            .await
            .with_context(|| format!("Failed to launch `{}`", config.command)),
    }
}

async fn run(conn: &Connection, action: Action) -> Result<()> {
    match action {
        Action::Ping => {
            if conn.is_alive().await {
                println!("alive");
            } else {
                println!("dead");
            }
        }
        Action::Call { name, args } => {
            let args: Vec<Value> = args.iter().map(|arg| parse_arg(arg)).collect();
            let reply = conn
                .call_function(&name, &args)
                .await
                .with_context(|| format!("Call to {} failed", name))?;
            print_reply(reply)?;
        }
        Action::Functions => {
            let functions = conn
                .list_functions()
                .await
                .context("Failed to list functions")?;
            match functions {
                Value::List(names) => {
                    for name in names {
                        println!("{}", name);
                    }
                }
                other => println!("{}", other),
            }
        }
    }
    Ok(())
}

fn parse_arg(arg: &str) -> Value {
    serde_json::from_str(arg).unwrap_or_else(|_| Value::from(arg))
}

fn print_reply(reply: Reply) -> Result<()> {
    for value in reply.into_values() {
        println!("{}", serde_json::to_string(&value)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("3"), Value::Int(3));
        assert_eq!(parse_arg("[1, 2.5]"), Value::List(vec![Value::Int(1), Value::Float(2.5)]));
        assert_eq!(parse_arg("\"quoted\""), Value::from("quoted"));
        assert_eq!(parse_arg("bare word"), Value::from("bare word"));
        assert_eq!(parse_arg("null"), Value::None);
    }

    #[test]
    fn test_cli_parses_call() {
        let cli = Cli::parse_from(["plremote", "--connect", "localhost:9000", "call", "cd", "\"/tmp\""]);
        assert_eq!(cli.connect.as_deref(), Some("localhost:9000"));
        match cli.action {
            Action::Call { name, args } => {
                assert_eq!(name, "cd");
                assert_eq!(args, vec!["\"/tmp\"".to_string()]);
            }
            _ => panic!("Expected call"),
        }
    }
}
