// The poll(2) poller test owns this binary: the selection happens through
// the environment at loop construction, and other tests must not race it.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use evio::{EventLoop, TcpServer};

mod util;

#[test]
fn echo_works_on_the_poll_backend() {
    util::init();
    std::env::set_var("EVIO_USE_POLL", "1");

    let (addr_tx, addr_rx) = mpsc::channel();
    let (msg_tx, msg_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let listen = "127.0.0.1:0".parse().unwrap();
        let server = TcpServer::new(&event_loop, &listen, "poll-echo").unwrap();
        let msg_tx = Mutex::new(msg_tx);
        server.set_message_callback(move |conn, buffer, _when| {
            let data = buffer.take_all();
            let _ = msg_tx.lock().unwrap().send(data.clone());
            conn.send(&data);
        });
        server.start().unwrap();
        addr_tx
            .send((server.listen_addr(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, handle) = util::recv(&addr_rx, "server address");

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"over poll\n").unwrap();
    assert_eq!(util::recv(&msg_rx, "server message"), b"over poll\n");
    let mut echoed = [0u8; 10];
    stream.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"over poll\n");

    // Timers ride the same poller.
    let (tick_tx, tick_rx) = mpsc::channel();
    handle.run_after(Duration::from_millis(50), move || {
        tick_tx.send(()).unwrap();
    });
    util::recv(&tick_rx, "timer on poll backend");

    handle.quit();
    server_thread.join().unwrap();
}
