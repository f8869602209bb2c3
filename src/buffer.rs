use std::io;
use std::os::unix::io::RawFd;

/// Default reserved prepend area, enough for a 64-bit length prefix.
const CHEAP_PREPEND: usize = 8;
/// Initial readable/writable capacity.
const INITIAL_SIZE: usize = 1024;

/// A growable byte buffer with separate read and write cursors.
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// |                   |     (CONTENT)    |                  |
/// +-------------------+------------------+------------------+
/// |                   |                  |                  |
/// 0      <=      reader_index   <=   writer_index    <=    size
/// ```
///
/// Producers `append` at the back, consumers `peek`/`consume` at the front.
/// The prepend area lets a protocol layer stamp a length field in front of
/// already-assembled content without moving it.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable content, front to back.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Byte offset of the first occurrence of `needle` within the readable
    /// content, e.g. for `\r\n` framing.
    pub fn find(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.readable_bytes() {
            return None;
        }
        self.peek()
            .windows(needle.len())
            .position(|window| window == needle)
    }

    /// Discard `n` readable bytes from the front.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.reader_index += n;
        } else {
            self.consume_all();
        }
    }

    pub fn consume_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Copy out and discard the first `n` readable bytes.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        assert!(n <= self.readable_bytes());
        let data = self.peek()[..n].to_vec();
        self.consume(n);
        data
    }

    pub fn take_all(&mut self) -> Vec<u8> {
        self.take(self.readable_bytes())
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// Write `data` immediately in front of the readable content.
    ///
    /// Panics when the prepend area cannot hold it; callers reserve the
    /// space by construction (the area never shrinks below what has been
    /// consumed back into it).
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    pub fn prepend_u32(&mut self, value: u32) {
        self.prepend(&value.to_be_bytes());
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Shift the readable span back to the prepend boundary instead
            // of growing.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Read from `fd` with `readv(2)`, spilling into a 64 KiB stack scratch
    /// buffer so a single syscall can pick up more than the currently
    /// writable area holds. The scratch overflow is appended (growing the
    /// buffer) after the fact.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: unsafe { self.buf.as_mut_ptr().add(self.writer_index) } as *mut _,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut _,
                iov_len: extra.len(),
            },
        ];
        // When there is ample writable room the scratch buffer is not
        // needed, and capping at one iovec caps the bytes read per call.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))?;
        let n = n as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("readable", &self.readable_bytes())
            .field("writable", &self.writable_bytes())
            .field("prependable", &self.prependable_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_consume() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(&[b'x'; 200]);
        assert_eq!(buf.readable_bytes(), 200);
        buf.consume(50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 50);

        buf.consume_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows_on_demand() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'y'; 400]);
        buf.append(&vec![b'z'; 1000]);
        assert_eq!(buf.readable_bytes(), 1400);
        assert_eq!(&buf.peek()[..400], &vec![b'y'; 400][..]);
        assert_eq!(&buf.peek()[400..], &vec![b'z'; 1000][..]);
    }

    #[test]
    fn compacts_inside_existing_space() {
        let mut buf = Buffer::new();
        buf.append(&vec![b'a'; 800]);
        buf.consume(500);
        let cap = buf.buf.len();
        // 300 readable, 224 writable, 508 prependable: fits after a shift.
        buf.append(&vec![b'b'; 400]);
        assert_eq!(buf.buf.len(), cap);
        assert_eq!(buf.readable_bytes(), 700);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn prepend_into_reserved_area() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_u32(7);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
        assert_eq!(buf.peek(), b"\x00\x00\x00\x07payload");
        buf.consume(4);
        assert_eq!(buf.peek(), b"payload");
    }

    #[test]
    fn find_delimiter() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert_eq!(buf.find(b"\r\n"), Some(14));
        assert_eq!(buf.find(b"xyz"), None);
        buf.consume(16);
        assert_eq!(buf.find(b"\r\n"), Some(7));
    }

    #[test]
    fn read_fd_spills_into_scratch() {
        let mut fds = [0; 2];
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC)).unwrap();
        let payload = vec![b'q'; 3000];
        let written = syscall!(write(
            fds[1],
            payload.as_ptr() as *const libc::c_void,
            payload.len()
        ))
        .unwrap();
        assert_eq!(written as usize, payload.len());

        let mut buf = Buffer::with_capacity(100);
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(buf.peek(), &payload[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
