// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Once;
use std::time::Duration;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        env_logger::try_init().expect("unable to initialise logger");
    });
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Receive with the standard test timeout, panicking with context instead of
/// hanging the suite.
pub fn recv<T>(receiver: &Receiver<T>, what: &str) -> T {
    match receiver.recv_timeout(TIMEOUT) {
        Ok(value) => value,
        Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for {}", what),
        Err(RecvTimeoutError::Disconnected) => panic!("{} sender went away", what),
    }
}
