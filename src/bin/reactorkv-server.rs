//! The reactorkv-server executable.
//! To see the list of command line options, type: `reactorkv-server --help`

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;

use clap::{crate_version, App, Arg};
use reactorkv::net::EventLoop;
use reactorkv::{KvError, KvServer, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_PORT: &str = "6379";
const DEFAULT_THREADS: &str = "4";
const DEFAULT_DATA_FILE: &str = "data.db";

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    port: u16,
    threads: usize,
    data_file: PathBuf,
}

impl Opt {
    /// validates the `port` and `threads` parameters
    /// # Errors
    /// returns [`KvError::Parsing`] if one of the parameters is invalid
    fn build(port: &str, threads: &str, data_file: &str) -> Result<Opt> {
        let port: u16 = port
            .parse()
            .map_err(|_| KvError::Parsing(format!("could not parse {} into a port number", port)))?;
        let threads: usize = threads.parse().map_err(|_| {
            KvError::Parsing(format!("could not parse {} into a thread count", threads))
        })?;

        Ok(Opt {
            port,
            threads,
            data_file: PathBuf::from(data_file),
        })
    }
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // parse command line args
    let matches = App::new("reactorkv-server")
        .version(crate_version!())
        .about("a multi-threaded, reactor-based key-value store")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("sets the port the server listens on")
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("threads")
                .short("t")
                .long("threads")
                .value_name("NUM")
                .help("sets the number of IO threads")
                .default_value(DEFAULT_THREADS),
        )
        .arg(
            Arg::with_name("data")
                .short("d")
                .long("data")
                .value_name("FILE")
                .help("sets the data file path")
                .default_value(DEFAULT_DATA_FILE),
        )
        .get_matches();

    let opt = match Opt::build(
        matches.value_of("port").unwrap(),
        matches.value_of("threads").unwrap(),
        matches.value_of("data").unwrap(),
    ) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{:?}", err);
            exit(1);
        }
    };

    if let Err(e) = run(opt) {
        eprintln!("{:?}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    println!("========================================");
    println!("        ReactorKV Server v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!("  Port:      {}", opt.port);
    println!("  Threads:   {}", opt.threads);
    println!("  Data File: {}", opt.data_file.display());
    println!("========================================");
    println!("Press Ctrl+C to stop");

    let base_loop = EventLoop::new()?;
    let server = KvServer::new(Arc::clone(&base_loop), opt.port, "ReactorKV")?;
    server.set_thread_num(opt.threads);

    // load an existing snapshot if one is there
    if server.load_data(&opt.data_file).is_ok() {
        info!(keys = server.store().size(), "loaded data file");
    } else {
        info!("no existing data file, starting fresh");
    }

    // SIGINT/SIGTERM request a cooperative shutdown: flip the quit flag and
    // wake the loop; everything else happens after the loop returns
    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    let signal_loop = Arc::clone(&base_loop);
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            signal_loop.quit();
        }
    });

    server.start()?;
    base_loop.run();

    // the loop has returned; saving is safe here
    println!("\nShutting down...");
    match server.save_to_data_file() {
        Ok(()) => println!("Data saved to {}", opt.data_file.display()),
        Err(e) => eprintln!("Failed to save data: {}", e),
    }
    println!("Server stopped.");
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
