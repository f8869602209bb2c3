use std::env;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use time::macros::format_description;
use time::OffsetDateTime;

mod log_file;

pub use self::log_file::LogFile;

/// One log record; a record that does not fit is dropped whole.
pub const SMALL_BUFFER: usize = 4000;
/// One batch shipped to the backend.
pub const LARGE_BUFFER: usize = 4000 * 1000;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
/// Pending batches beyond this trip the overload drop policy.
const DROP_THRESHOLD: usize = 25;

/// Where formatted records go. `AsyncLogging` implements this; so does the
/// stdout default.
pub trait LogSink: Send + Sync {
    fn write(&self, record: &[u8]);
    fn flush(&self);
}

/// Install the global logger with a stdout sink. Level comes from the
/// environment: `MUDUO_LOG_TRACE`, `MUDUO_LOG_DEBUG`, else info.
pub fn init() -> Result<(), SetLoggerError> {
    init_with_sink(Arc::new(StdoutSink))
}

/// Install the global logger routing records into `sink`. Set once, before
/// any loop starts.
pub fn init_with_sink(sink: Arc<dyn LogSink>) -> Result<(), SetLoggerError> {
    let level = level_from_env();
    log::set_boxed_logger(Box::new(StreamLogger { level, sink }))?;
    log::set_max_level(level);
    Ok(())
}

fn level_from_env() -> LevelFilter {
    if env::var_os("MUDUO_LOG_TRACE").is_some() {
        LevelFilter::Trace
    } else if env::var_os("MUDUO_LOG_DEBUG").is_some() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write(&self, record: &[u8]) {
        let _ = io::stdout().lock().write_all(record);
    }

    fn flush(&self) {
        let _ = io::stdout().lock().flush();
    }
}

struct StreamLogger {
    level: LevelFilter,
    sink: Arc<dyn LogSink>,
}

impl Log for StreamLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = RecordBuffer::new();
        let _ = write!(
            line,
            "{} {:5} {} - {}\n",
            format_timestamp(),
            record.level(),
            record.target(),
            record.args(),
        );
        if line.overflow() {
            return;
        }
        self.sink.write(line.as_slice());
        if record.level() <= Level::Error {
            self.sink.flush();
        }
    }

    fn flush(&self) {
        self.sink.flush();
    }
}

pub(crate) fn format_timestamp() -> String {
    let format =
        format_description!("[year][month][day] [hour]:[minute]:[second].[subsecond digits:6]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| String::from("00000000 00:00:00.000000"))
}

/// Fixed-size record formatting buffer; overflowing writes mark the whole
/// record as dropped instead of truncating it mid-write.
struct RecordBuffer {
    data: [u8; SMALL_BUFFER],
    len: usize,
    overflow: bool,
}

impl RecordBuffer {
    fn new() -> RecordBuffer {
        RecordBuffer {
            data: [0; SMALL_BUFFER],
            len: 0,
            overflow: false,
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn overflow(&self) -> bool {
        self.overflow
    }
}

impl fmt::Write for RecordBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.overflow {
            return Ok(());
        }
        let bytes = s.as_bytes();
        if self.len + bytes.len() > self.data.len() {
            self.overflow = true;
            return Ok(());
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(())
    }
}

/// Fixed-size batch buffer. Appends are all-or-nothing so a record is never
/// split across batches.
struct FixedBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl FixedBuffer {
    /// Zero-filled up front so steady-state appends touch warm pages.
    fn with_capacity(capacity: usize) -> FixedBuffer {
        FixedBuffer {
            data: vec![0; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    fn avail(&self) -> usize {
        self.data.len() - self.len
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    fn append(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.avail());
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    fn reset(&mut self) {
        self.len = 0;
    }

    fn bzero(&mut self) {
        self.data.fill(0);
    }
}

struct ProducerState {
    current: FixedBuffer,
    next: Option<FixedBuffer>,
    buffers: Vec<FixedBuffer>,
}

/// Double-buffered asynchronous log pipeline.
///
/// Producers append into `current` under one short lock; the backend thread
/// swaps filled buffers out wholesale every `flush_interval` (or sooner when
/// notified) and does the file I/O outside the lock. Under sustained
/// overload everything past the first two pending buffers is dropped and a
/// single diagnostic records how many.
pub struct AsyncLogging {
    basename: String,
    roll_size: u64,
    flush_interval: Duration,
    buffer_size: usize,
    running: Arc<AtomicBool>,
    state: Arc<(Mutex<ProducerState>, Condvar)>,
    backend: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogging {
    pub fn new(basename: &str, roll_size: u64) -> AsyncLogging {
        AsyncLogging::with_config(basename, roll_size, DEFAULT_FLUSH_INTERVAL, LARGE_BUFFER)
    }

    /// `buffer_size` is tunable mostly for tests; production wants the
    /// 4 MB default.
    pub fn with_config(
        basename: &str,
        roll_size: u64,
        flush_interval: Duration,
        buffer_size: usize,
    ) -> AsyncLogging {
        AsyncLogging {
            basename: basename.to_owned(),
            roll_size,
            flush_interval,
            buffer_size,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new((
                Mutex::new(ProducerState {
                    current: FixedBuffer::with_capacity(buffer_size),
                    next: Some(FixedBuffer::with_capacity(buffer_size)),
                    buffers: Vec::with_capacity(16),
                }),
                Condvar::new(),
            )),
            backend: Mutex::new(None),
        }
    }

    /// Producer path: append one record, rotating buffers when `current`
    /// fills and waking the backend.
    pub fn append(&self, record: &[u8]) {
        let (lock, condvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        if state.current.avail() > record.len() {
            state.current.append(record);
            return;
        }

        let replacement = match state.next.take() {
            Some(buffer) => buffer,
            // Both buffers exhausted since the backend last ran; rare.
            None => FixedBuffer::with_capacity(self.buffer_size),
        };
        let full = mem::replace(&mut state.current, replacement);
        state.buffers.push(full);
        state.current.append(record);
        condvar.notify_one();
    }

    /// Spawn the backend thread. Must be called once, before producers
    /// depend on records reaching disk.
    pub fn start(&self) -> io::Result<()> {
        assert!(
            !self.running.swap(true, Ordering::AcqRel),
            "AsyncLogging started twice"
        );
        let running = self.running.clone();
        let state = self.state.clone();
        let basename = self.basename.clone();
        let roll_size = self.roll_size;
        let flush_interval = self.flush_interval;
        let buffer_size = self.buffer_size;
        let thread = std::thread::Builder::new()
            .name("logging".to_owned())
            .spawn(move || {
                backend_thread(
                    running,
                    state,
                    &basename,
                    roll_size,
                    flush_interval,
                    buffer_size,
                )
            })?;
        *self.backend.lock().unwrap() = Some(thread);
        Ok(())
    }

    /// Stop the backend after a final drain and flush.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.state.1.notify_one();
        if let Some(thread) = self.backend.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AsyncLogging {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LogSink for AsyncLogging {
    fn write(&self, record: &[u8]) {
        self.append(record);
    }

    fn flush(&self) {
        // The backend flushes on its own cadence; waking it is enough.
        self.state.1.notify_one();
    }
}

fn backend_thread(
    running: Arc<AtomicBool>,
    state: Arc<(Mutex<ProducerState>, Condvar)>,
    basename: &str,
    roll_size: u64,
    flush_interval: Duration,
    buffer_size: usize,
) {
    let mut output = match LogFile::with_config(basename, roll_size, flush_interval, 1024) {
        Ok(output) => output,
        Err(err) => {
            eprintln!("AsyncLogging: opening {}: {}", basename, err);
            return;
        }
    };
    let mut spare1 = Some(FixedBuffer::with_capacity(buffer_size));
    let mut spare2 = Some(FixedBuffer::with_capacity(buffer_size));
    let mut to_write: Vec<FixedBuffer> = Vec::with_capacity(16);

    while running.load(Ordering::Acquire) {
        debug_assert!(spare1.as_ref().map_or(false, |b| b.len() == 0));
        debug_assert!(to_write.is_empty());

        {
            let (lock, condvar) = &*state;
            let mut state = lock.lock().unwrap();
            if state.buffers.is_empty() {
                // Not the usual condvar discipline: a timeout is a
                // legitimate wakeup, it bounds record latency.
                let (next_state, _) = condvar.wait_timeout(state, flush_interval).unwrap();
                state = next_state;
            }
            let current = mem::replace(
                &mut state.current,
                spare1.take().expect("backend spare refilled each round"),
            );
            state.buffers.push(current);
            mem::swap(&mut state.buffers, &mut to_write);
            if state.next.is_none() {
                state.next = spare2.take();
            }
        }

        // Overload: keep two batches, drop the rest, say so once.
        if to_write.len() > DROP_THRESHOLD {
            let message = format!(
                "Dropped log messages at {}, {} larger buffers\n",
                format_timestamp(),
                to_write.len() - 2,
            );
            eprint!("{}", message);
            if let Err(err) = output.append(message.as_bytes()) {
                eprintln!("AsyncLogging: {}", err);
            }
            to_write.truncate(2);
        }

        for buffer in &to_write {
            if let Err(err) = output.append(buffer.as_slice()) {
                eprintln!("AsyncLogging: {}", err);
            }
        }

        if to_write.len() > 2 {
            to_write.truncate(2);
        }
        if spare1.is_none() {
            let mut buffer = to_write.pop().expect("a written batch to recycle");
            buffer.reset();
            buffer.bzero();
            spare1 = Some(buffer);
        }
        if spare2.is_none() {
            let mut buffer = to_write.pop().expect("a written batch to recycle");
            buffer.reset();
            buffer.bzero();
            spare2 = Some(buffer);
        }
        to_write.clear();
        if let Err(err) = output.flush() {
            eprintln!("AsyncLogging: {}", err);
        }
    }

    // Final drain so a clean shutdown loses nothing.
    {
        let (lock, _) = &*state;
        let mut state = lock.lock().unwrap();
        let current = mem::replace(
            &mut state.current,
            spare1
                .take()
                .unwrap_or_else(|| FixedBuffer::with_capacity(buffer_size)),
        );
        state.buffers.push(current);
        mem::swap(&mut state.buffers, &mut to_write);
    }
    for buffer in &to_write {
        if buffer.len() > 0 {
            if let Err(err) = output.append(buffer.as_slice()) {
                eprintln!("AsyncLogging: {}", err);
            }
        }
    }
    if let Err(err) = output.flush() {
        eprintln!("AsyncLogging: {}", err);
    }
}
