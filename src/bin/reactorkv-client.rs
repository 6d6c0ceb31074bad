//! The reactorkv-client executable: an interactive REPL speaking the
//! server's line protocol.
//!
//! Commands mirror the wire protocol (`PUT`, `GET`, `DEL`, `EXISTS`, `SIZE`,
//! `CLEAR`, `PING`, `QUIT`) plus a local `HELP`. The REPL exits on `QUIT`,
//! `EXIT` or end of input.

use std::io::{self, BufRead, Write};

use anyhow::Context;
use clap::{crate_version, App, Arg};
use reactorkv::KvClient;
use reactorkv::protocol::Status;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "6379";

fn main() -> anyhow::Result<()> {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("reactorkv-client")
        .version(crate_version!())
        .about("interactive client for a reactorkv server")
        .arg(
            Arg::with_name("host")
                .short("H")
                .long("host")
                .value_name("HOST")
                .help("sets the server host to connect to")
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("sets the server port to connect to")
                .default_value(DEFAULT_PORT),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap();
    let port: u16 = matches
        .value_of("port")
        .unwrap()
        .parse()
        .context("could not parse the port number")?;

    println!("========================================");
    println!("        ReactorKV Client v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!("  Connecting to {}:{}...", host, port);

    let mut client = KvClient::connect((host, port))
        .with_context(|| format!("failed to connect to {}:{}", host, port))?;
    println!("  {}", client.welcome());
    println!("Type HELP for available commands\n");

    repl(&mut client)
}

fn repl(client: &mut KvClient) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("reactorkv> ");
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => line?,
            // EOF ends the session
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let verb = line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        if verb == "HELP" {
            print_help();
            continue;
        }

        match client.request(line) {
            Ok(response) => {
                let shown = match response.status {
                    Status::Ok if response.message.is_empty() => "OK".to_string(),
                    Status::Ok => response.message.clone(),
                    Status::NotFound => "(not found)".to_string(),
                    Status::Error => format!("ERROR: {}", response.message),
                    Status::Pong => "PONG".to_string(),
                    Status::Bye => "BYE".to_string(),
                };
                println!("{}", shown);
            }
            Err(e) => {
                eprintln!("connection lost: {}", e);
                break;
            }
        }

        if verb == "QUIT" || verb == "EXIT" {
            break;
        }
    }
    Ok(())
}

fn print_help() {
    println!("\nAvailable commands:");
    println!("  PUT key value   - Store a key-value pair");
    println!("  GET key         - Get value by key");
    println!("  DEL key         - Delete a key");
    println!("  EXISTS key      - Check if key exists");
    println!("  SIZE            - Get number of stored keys");
    println!("  CLEAR           - Clear all data");
    println!("  PING            - Test server connection");
    println!("  QUIT            - Exit the client");
    println!("  HELP            - Show this help\n");
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::WARN)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
