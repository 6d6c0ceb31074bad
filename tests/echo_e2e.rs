//! Drives the network engine directly, without the KV application on top:
//! an echo server built from `TcpServer` callbacks.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reactorkv::net::{EventLoop, TcpServer};

struct EchoServer {
    event_loop: Arc<EventLoop>,
    addr: SocketAddr,
    writes_completed: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl EchoServer {
    fn start(threads: usize) -> EchoServer {
        let writes_completed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&writes_completed);
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
            let server = TcpServer::new(Arc::clone(&event_loop), addr, "Echo", true).unwrap();
            server.set_thread_num(threads);

            server.set_message_callback(Arc::new(|conn, buf, _received_at| {
                let msg = buf.retrieve_all_as_string();
                conn.send(msg.as_bytes());
            }));
            server.set_write_complete_callback(Arc::new(move |_conn| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

            server.start().unwrap();
            tx.send((Arc::clone(&event_loop), server.local_addr()))
                .unwrap();
            event_loop.run();
        });

        let (event_loop, addr) = rx.recv().unwrap();
        EchoServer {
            event_loop,
            addr,
            writes_completed,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.event_loop.quit();
        self.handle.take().unwrap().join().unwrap();
    }
}

#[test]
fn echoes_a_line_back() {
    let server = EchoServer::start(1);

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"hello reactor\n").unwrap();

    let mut echoed = vec![0u8; 14];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello reactor\n");

    // the write-complete notification runs in the loop's deferred phase, so
    // give it a moment to land
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server.writes_completed.load(Ordering::SeqCst) == 0
        && std::time::Instant::now() < deadline
    {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(server.writes_completed.load(Ordering::SeqCst) >= 1);
    server.stop();
}

#[test]
fn bulk_transfer_round_trips_through_the_output_buffer() {
    let server = EchoServer::start(2);
    let addr = server.addr;

    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reader = stream.try_clone().unwrap();

    // writer thread pushes 4 x 64 KiB while the main thread drains the echo,
    // so the kernel buffers never wedge either side
    let total: usize = 4 * 64 * 1024;
    let writer = thread::spawn(move || {
        let mut stream = stream;
        let chunk = vec![0xabu8; 64 * 1024];
        for _ in 0..4 {
            stream.write_all(&chunk).unwrap();
        }
        stream
    });

    let mut received = 0usize;
    let mut buf = vec![0u8; 64 * 1024];
    while received < total {
        let n = reader.read(&mut buf).unwrap();
        assert!(n > 0, "server closed early after {} bytes", received);
        assert!(buf[..n].iter().all(|&b| b == 0xab));
        received += n;
    }
    assert_eq!(received, total);

    writer.join().unwrap();
    server.stop();
}

#[test]
fn many_sequential_connections_get_distinct_registry_slots() {
    let server = EchoServer::start(2);

    for i in 0..20 {
        let mut stream = TcpStream::connect(server.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let line = format!("round {}\n", i);
        stream.write_all(line.as_bytes()).unwrap();

        let mut echoed = vec![0u8; line.len()];
        stream.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, line.as_bytes());
    }

    server.stop();
}
