use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;

use log::error;

use crate::channel::Channel;
use crate::event_loop::LoopInner;
use crate::net::socket;

/// Owns a listening socket and hands accepted fds to its owner.
///
/// The spare "idle fd" is the recovery path for fd exhaustion: on `EMFILE`
/// the reserve is closed, the pending connection accepted and immediately
/// closed, and the reserve reopened. Without it a full process would spin on
/// a permanently readable listening socket.
pub(crate) struct Acceptor {
    socket: OwnedFd,
    channel: Rc<Channel>,
    idle_fd: RefCell<Option<OwnedFd>>,
    listen_addr: SocketAddr,
    listening: Cell<bool>,
    new_connection_callback: RefCell<Option<Box<dyn FnMut(OwnedFd, SocketAddr)>>>,
}

fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))?;
    // SAFETY: `open(2)` ensures the fd is valid.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: &Rc<LoopInner>,
        listen_addr: &SocketAddr,
    ) -> io::Result<Rc<Acceptor>> {
        let socket = socket::new_stream_socket(socket::domain_for(listen_addr))?;
        socket::set_reuse_addr(socket.as_raw_fd(), true)?;
        socket::bind(socket.as_raw_fd(), listen_addr)?;
        // Report the kernel-assigned port when the caller bound port 0.
        let listen_addr = socket::local_addr(socket.as_raw_fd())?;
        let idle_fd = open_idle_fd()?;

        let channel = Channel::new(event_loop, socket.as_raw_fd());
        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            idle_fd: RefCell::new(Some(idle_fd)),
            listen_addr,
            listening: Cell::new(false),
            new_connection_callback: RefCell::new(None),
        });
        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: FnMut(OwnedFd, SocketAddr) + 'static,
    {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(callback));
    }

    pub(crate) fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    #[allow(dead_code)]
    pub(crate) fn listening(&self) -> bool {
        self.listening.get()
    }

    pub(crate) fn listen(self: &Rc<Self>) -> io::Result<()> {
        self.listening.set(true);
        socket::listen(self.socket.as_raw_fd())?;
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&self) {
        match socket::accept(self.socket.as_raw_fd()) {
            Ok((conn, peer_addr)) => {
                match self.new_connection_callback.borrow_mut().as_mut() {
                    Some(callback) => callback(conn, peer_addr),
                    None => drop(conn),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("Acceptor::handle_read: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    // Free the reserve, drain the pending connection, take
                    // the reserve back.
                    let mut idle_fd = self.idle_fd.borrow_mut();
                    idle_fd.take();
                    if let Ok((conn, _)) = socket::accept(self.socket.as_raw_fd()) {
                        drop(conn);
                    }
                    match open_idle_fd() {
                        Ok(fd) => *idle_fd = Some(fd),
                        Err(err) => error!("Acceptor: reopening idle fd: {}", err),
                    }
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
