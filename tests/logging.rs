// No env_logger here: one of these tests installs the crate's own global
// logger, and a process only gets one.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use evio::logging::{self, AsyncLogging};

/// The files a rolling logger produced for `basename`, oldest first.
fn log_files(dir: &std::path::Path, prefix: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with(prefix))
        })
        .collect();
    files.sort();
    files
}

#[test]
fn async_round_trip_preserves_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let basename = dir.path().join("round_trip");
    let logging = AsyncLogging::with_config(
        basename.to_str().unwrap(),
        10 * 1024 * 1024,
        Duration::from_millis(100),
        64 * 1024,
    );
    logging.start().unwrap();

    let mut expected = Vec::new();
    for i in 0..1000 {
        let line = format!("record number {:04} with some ballast\n", i).into_bytes();
        logging.append(&line);
        expected.extend_from_slice(&line);
    }
    logging.stop();

    let files = log_files(dir.path(), "round_trip");
    assert_eq!(files.len(), 1, "expected a single unrolled file");
    let content = fs::read(&files[0]).unwrap();
    assert_eq!(content, expected);
}

#[test]
fn overload_drops_surplus_buffers_with_one_diagnostic() {
    let dir = tempfile::tempdir().unwrap();
    let basename = dir.path().join("drop_test");
    const BUFFER_SIZE: usize = 1024;
    let logging = AsyncLogging::with_config(
        basename.to_str().unwrap(),
        10 * 1024 * 1024,
        Duration::from_secs(1),
        BUFFER_SIZE,
    );

    // The backend is not running yet: this stalls the pipeline exactly like
    // a wedged writer, so full buffers pile up.
    let line_len = 100;
    let mut lines = Vec::new();
    for i in 0..330 {
        let mut line = format!("drop line {:04} ", i).into_bytes();
        line.resize(line_len - 1, b'.');
        line.push(b'\n');
        logging.append(&line);
        lines.push(line);
    }

    // Replay the producer arithmetic to find which lines the first two
    // buffers hold and how many buffers piled up in total.
    let mut filled = 0usize;
    let mut avail = BUFFER_SIZE;
    let mut kept = Vec::new();
    for line in &lines {
        if avail <= line.len() {
            filled += 1;
            avail = BUFFER_SIZE;
        }
        if filled < 2 {
            kept.extend_from_slice(line);
        }
        avail -= line.len();
    }
    let total_buffers = filled + 1; // the partially-filled current rides along
    assert!(total_buffers > 25, "setup did not overload the pipeline");

    logging.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    let content = loop {
        let files = log_files(dir.path(), "drop_test");
        if let Some(file) = files.first() {
            let content = fs::read(file).unwrap();
            if !content.is_empty() {
                break content;
            }
        }
        assert!(Instant::now() < deadline, "backend never wrote the file");
        thread::sleep(Duration::from_millis(50));
    };
    logging.stop();

    let content = String::from_utf8(content).unwrap();
    let (diagnostic, rest) = content.split_once('\n').unwrap();
    assert!(
        diagnostic.starts_with("Dropped log messages at "),
        "missing drop diagnostic: {:?}",
        diagnostic
    );
    assert!(
        diagnostic.ends_with(&format!("{} larger buffers", total_buffers - 2)),
        "wrong drop count: {:?}",
        diagnostic
    );
    // Exactly the first two buffers' worth of records follow, in order.
    assert_eq!(rest.as_bytes(), &kept[..]);
}

#[test]
fn facade_routes_records_through_the_async_backend() {
    let dir = tempfile::tempdir().unwrap();
    let basename = dir.path().join("facade");
    let logging = Arc::new(AsyncLogging::with_config(
        basename.to_str().unwrap(),
        10 * 1024 * 1024,
        Duration::from_millis(100),
        64 * 1024,
    ));
    logging.start().unwrap();
    logging::init_with_sink(logging.clone()).unwrap();

    log::info!("the answer is {}", 42);
    log::debug!("invisible at the default level");
    logging.stop();

    let files = log_files(dir.path(), "facade");
    assert_eq!(files.len(), 1);
    let content = String::from_utf8(fs::read(&files[0]).unwrap()).unwrap();
    assert!(content.contains("INFO"), "level missing: {:?}", content);
    assert!(content.contains("the answer is 42"));
    assert!(!content.contains("invisible"));
    assert!(content.ends_with('\n'));
}
