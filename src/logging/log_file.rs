use std::ffi::CStr;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use time::macros::format_description;
use time::OffsetDateTime;

const ROLL_PER_SECONDS: i64 = 60 * 60 * 24;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Synchronous append-only log file with size- and day-based rolling.
///
/// Each roll opens `<basename>.<YYYYmmdd-HHMMSS>.<hostname>.<pid>.log`; the
/// shape is fixed so external rotation tooling keeps working. Flushes happen
/// every `flush_interval`, checked at most every `check_every_n` appends.
/// Single-threaded by design: exactly one backend (or test) owns it.
pub struct LogFile {
    basename: String,
    roll_size: u64,
    flush_interval: Duration,
    check_every_n: u32,
    count: u32,
    file: BufWriter<File>,
    path: PathBuf,
    written_bytes: u64,
    start_of_period: i64,
    last_roll: i64,
    last_flush: i64,
}

impl LogFile {
    pub fn new(basename: &str, roll_size: u64) -> io::Result<LogFile> {
        LogFile::with_config(basename, roll_size, Duration::from_secs(3), 1024)
    }

    pub fn with_config(
        basename: &str,
        roll_size: u64,
        flush_interval: Duration,
        check_every_n: u32,
    ) -> io::Result<LogFile> {
        let now = OffsetDateTime::now_utc();
        let path = log_file_name(basename, now);
        let file = open_append(&path)?;
        let now_secs = now.unix_timestamp();
        Ok(LogFile {
            basename: basename.to_owned(),
            roll_size,
            flush_interval,
            check_every_n,
            count: 0,
            file,
            path,
            written_bytes: 0,
            start_of_period: now_secs / ROLL_PER_SECONDS * ROLL_PER_SECONDS,
            last_roll: now_secs,
            last_flush: now_secs,
        })
    }

    /// The file currently being written.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written_bytes += data.len() as u64;

        if self.written_bytes > self.roll_size {
            self.roll()?;
        } else {
            self.count += 1;
            if self.count >= self.check_every_n {
                self.count = 0;
                let now_secs = OffsetDateTime::now_utc().unix_timestamp();
                let this_period = now_secs / ROLL_PER_SECONDS * ROLL_PER_SECONDS;
                if this_period != self.start_of_period {
                    self.roll()?;
                } else if now_secs - self.last_flush > self.flush_interval.as_secs() as i64 {
                    self.last_flush = now_secs;
                    self.file.flush()?;
                }
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Open a new timestamped file. At most one roll per second; a
    /// same-second roll would reopen the same name.
    pub fn roll(&mut self) -> io::Result<()> {
        let now = OffsetDateTime::now_utc();
        let now_secs = now.unix_timestamp();
        if now_secs > self.last_roll {
            self.last_roll = now_secs;
            self.last_flush = now_secs;
            self.start_of_period = now_secs / ROLL_PER_SECONDS * ROLL_PER_SECONDS;
            self.file.flush()?;
            let path = log_file_name(&self.basename, now);
            self.file = open_append(&path)?;
            self.path = path;
            self.written_bytes = 0;
        }
        Ok(())
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

fn open_append(path: &PathBuf) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::with_capacity(WRITE_BUFFER_SIZE, file))
}

fn log_file_name(basename: &str, now: OffsetDateTime) -> PathBuf {
    let format = format_description!("[year][month][day]-[hour][minute][second]");
    let stamp = now
        .format(&format)
        .unwrap_or_else(|_| String::from("00000000-000000"));
    PathBuf::from(format!(
        "{}.{}.{}.{}.log",
        basename,
        stamp,
        hostname(),
        process::id(),
    ))
}

fn hostname() -> String {
    let mut buf = [0u8; 256];
    let res = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if res == 0 {
        if let Ok(name) = CStr::from_bytes_until_nul(&buf) {
            return name.to_string_lossy().into_owned();
        }
    }
    String::from("unknownhost")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn file_name_shape() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("shape_test");
        let file = LogFile::new(base.to_str().unwrap(), 64 * 1024).unwrap();
        let name = file.path().file_name().unwrap().to_str().unwrap().to_owned();
        // shape_test.YYYYmmdd-HHMMSS.<hostname>.<pid>.log
        assert!(name.starts_with("shape_test."));
        assert!(name.ends_with(&format!(".{}.log", process::id())));
        let stamp = name.split('.').nth(1).unwrap();
        assert_eq!(stamp.len(), 15);
        assert_eq!(stamp.as_bytes()[8], b'-');
        assert!(stamp
            .chars()
            .enumerate()
            .all(|(i, c)| if i == 8 { c == '-' } else { c.is_ascii_digit() }));
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("append_test");
        let mut file = LogFile::new(base.to_str().unwrap(), 64 * 1024).unwrap();
        file.append(b"hello log\n").unwrap();
        file.append(b"second line\n").unwrap();
        file.flush().unwrap();
        let content = fs::read_to_string(file.path()).unwrap();
        assert_eq!(content, "hello log\nsecond line\n");
    }

    #[test]
    fn rolls_when_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("roll_test");
        let mut file = LogFile::new(base.to_str().unwrap(), 16).unwrap();
        let first = file.path().clone();
        file.append(b"0123456789abcdef-\n").unwrap();
        // Over the roll threshold; a roll happens once the wall clock moves
        // to the next second.
        std::thread::sleep(Duration::from_millis(1100));
        file.append(b"next\n").unwrap();
        file.append(b"more\n").unwrap();
        file.flush().unwrap();
        assert_ne!(&first, file.path());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(names.len() >= 2, "expected a rolled file, got {:?}", names);
    }
}
