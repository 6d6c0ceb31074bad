//! Echo server exercising the network engine on its own: every byte received
//! is sent straight back.
//!
//! ```sh
//! cargo run --example echo-server -- 8080
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;

use reactorkv::net::{EventLoop, TcpServer};
use reactorkv::Result;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(8080);

    println!("========================================");
    println!(" ReactorKV Echo Server");
    println!(" Port: {}", port);
    println!(" Press Ctrl+C to stop");
    println!("========================================");

    let base_loop = EventLoop::new()?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let server = TcpServer::new(Arc::clone(&base_loop), addr, "Echo", true)?;
    server.set_thread_num(2);

    server.set_connection_callback(Arc::new(|conn| {
        if conn.connected() {
            info!(name = conn.name(), peer = %conn.peer_addr(), "new connection");
        } else {
            info!(name = conn.name(), "connection closed");
        }
    }));
    server.set_message_callback(Arc::new(|conn, buf, _received_at| {
        let msg = buf.retrieve_all_as_string();
        info!(name = conn.name(), bytes = msg.len(), "echoing");
        conn.send(msg.as_bytes());
    }));

    let mut signals = Signals::new(&[SIGINT, SIGTERM])?;
    let signal_loop = Arc::clone(&base_loop);
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            signal_loop.quit();
        }
    });

    server.start()?;
    base_loop.run();
    println!("Echo server stopped.");
    Ok(())
}
