use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use evio::{EventLoop, LoopHandle, TcpClient, TcpServer};

mod util;

/// Spawn an echo server on its own loop thread and hand back its address
/// and loop handle.
fn spawn_echo_server(
    io_threads: usize,
    message_tx: Option<mpsc::Sender<Vec<u8>>>,
    connected_tx: Option<mpsc::Sender<bool>>,
) -> (std::net::SocketAddr, LoopHandle, thread::JoinHandle<()>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let listen = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(&event_loop, &listen, "echo").unwrap();
        server.set_thread_num(io_threads);
        let message_tx = Mutex::new(message_tx);
        server.set_message_callback(move |conn, buffer, _when| {
            let data = buffer.take_all();
            if let Some(tx) = message_tx.lock().unwrap().as_ref() {
                let _ = tx.send(data.clone());
            }
            conn.send(&data);
        });
        if let Some(connected_tx) = connected_tx {
            let connected_tx = Mutex::new(connected_tx);
            server.set_connection_callback(move |conn| {
                let _ = connected_tx.lock().unwrap().send(conn.connected());
            });
        }
        server.start().unwrap();
        addr_tx
            .send((server.listen_addr(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, handle) = util::recv(&addr_rx, "server address");
    (addr, handle, server_thread)
}

#[test]
fn echo_roundtrip() {
    util::init();
    let (message_tx, message_rx) = mpsc::channel();
    let (addr, handle, server_thread) = spawn_echo_server(1, Some(message_tx), None);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"hello\n").unwrap();

    assert_eq!(util::recv(&message_rx, "server message"), b"hello\n");
    let mut echoed = [0u8; 6];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello\n");

    drop(stream);
    handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn client_talks_to_server() {
    util::init();
    let (addr, server_handle, server_thread) = spawn_echo_server(0, None, None);

    let (echo_tx, echo_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();
    let client_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let client = TcpClient::new(&event_loop, addr, "echo-client");
        client.set_connection_callback(|conn| {
            if conn.connected() {
                conn.send(b"ping");
            }
        });
        let echo_tx = Mutex::new(echo_tx);
        client.set_message_callback(move |_conn, buffer, _when| {
            let _ = echo_tx.lock().unwrap().send(buffer.take_all());
        });
        client.connect();
        handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let client_handle = util::recv(&handle_rx, "client handle");

    assert_eq!(util::recv(&echo_rx, "echoed bytes"), b"ping");

    client_handle.quit();
    client_thread.join().unwrap();
    server_handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn half_close_drains_then_eofs() {
    util::init();
    let (message_tx, message_rx) = mpsc::channel();
    let (connected_tx, connected_rx) = mpsc::channel();
    let (addr, handle, server_thread) =
        spawn_echo_server(1, Some(message_tx), Some(connected_tx));

    let mut stream = TcpStream::connect(addr).unwrap();
    assert!(util::recv(&connected_rx, "connection up"));

    stream.write_all(b"ping").unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();

    // Server sees the message, then the disconnect.
    assert_eq!(util::recv(&message_rx, "server message"), b"ping");
    assert!(!util::recv(&connected_rx, "connection down"));

    // The echo arrives intact, then a clean EOF. A reset would error here.
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping");
    let mut rest = [0u8; 1];
    assert_eq!(stream.read(&mut rest).unwrap(), 0);

    handle.quit();
    server_thread.join().unwrap();
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn high_water_mark_fires_once() {
    util::init();
    const TOTAL: usize = 4 * 1024 * 1024;
    const MARK: usize = 64 * 1024;

    let hwm_count = Arc::new(AtomicUsize::new(0));
    let (wc_tx, wc_rx) = mpsc::channel();
    let (addr_tx, addr_rx) = mpsc::channel();

    let hwm = hwm_count.clone();
    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let listen = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(&event_loop, &listen, "firehose").unwrap();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let hwm = hwm.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, queued| {
                        assert!(queued >= MARK);
                        hwm.fetch_add(1, Ordering::Relaxed);
                    }),
                    MARK,
                );
                conn.send(&pattern(TOTAL));
            }
        });
        let wc_tx = Mutex::new(wc_tx);
        server.set_write_complete_callback(move |_conn| {
            let _ = wc_tx.lock().unwrap().send(());
        });
        server.start().unwrap();
        addr_tx
            .send((server.listen_addr(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, handle) = util::recv(&addr_rx, "server address");

    let mut stream = TcpStream::connect(addr).unwrap();
    // Do not read yet: the send must back up into the output buffer.
    thread::sleep(Duration::from_millis(500));

    let mut received = Vec::with_capacity(TOTAL);
    let mut chunk = [0u8; 64 * 1024];
    while received.len() < TOTAL {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed before the full payload arrived");
        received.extend_from_slice(&chunk[..n]);
    }
    assert_eq!(received, pattern(TOTAL));

    util::recv(&wc_rx, "write complete");
    assert!(wc_rx.try_recv().is_err(), "write complete fired twice");
    assert_eq!(hwm_count.load(Ordering::Relaxed), 1);

    handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn connection_handle_sends_in_order_across_threads() {
    util::init();
    let (handle_tx, handle_rx) = mpsc::channel();
    let (addr_tx, addr_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let listen = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(&event_loop, &listen, "pusher").unwrap();
        server.set_thread_num(1);
        let handle_tx = Mutex::new(handle_tx);
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let _ = handle_tx.lock().unwrap().send(conn.handle());
            }
        });
        server.start().unwrap();
        addr_tx
            .send((server.listen_addr(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, loop_handle) = util::recv(&addr_rx, "server address");

    let mut stream = TcpStream::connect(addr).unwrap();
    let conn_handle = util::recv(&handle_rx, "connection handle");

    // All sends come from this (non-loop) thread, marshalled to the loop.
    let mut expected = Vec::new();
    for i in 0..100 {
        let chunk = format!("c{:06}\n", i).into_bytes();
        conn_handle.send(&chunk);
        expected.extend_from_slice(&chunk);
    }

    let mut received = vec![0u8; expected.len()];
    stream.read_exact(&mut received).unwrap();
    assert_eq!(received, expected);

    loop_handle.quit();
    server_thread.join().unwrap();
}

#[test]
fn connector_retries_until_the_server_exists() {
    util::init();
    // Reserve a port, then free it so the first connect is refused.
    let placeholder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let (up_tx, up_rx) = mpsc::channel();
    let (handle_tx, handle_rx) = mpsc::channel();
    let client_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let client = TcpClient::new(&event_loop, addr, "late-client");
        let up_tx = Mutex::new(up_tx);
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                let _ = up_tx.lock().unwrap().send(());
            }
        });
        client.connect();
        handle_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let client_handle = util::recv(&handle_rx, "client handle");

    // Let at least one connect attempt fail before the server appears.
    thread::sleep(Duration::from_millis(150));
    let (server_addr_tx, server_addr_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(&event_loop, &addr, "late-server").unwrap();
        server.start().unwrap();
        server_addr_tx.send(event_loop.handle()).unwrap();
        event_loop.run();
    });
    let server_handle = util::recv(&server_addr_rx, "server handle");

    util::recv(&up_rx, "client connected after retry");

    client_handle.quit();
    client_thread.join().unwrap();
    server_handle.quit();
    server_thread.join().unwrap();
}
