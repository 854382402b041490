//! Cooperative poll loops for the `watch` subcommands.
//!
//! Each watch loop runs a pass, then sleeps for its interval in short slices
//! so that a Ctrl-C (which flips the shared shutdown flag) stops it promptly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Error, Result};

const SLICE: Duration = Duration::from_millis(200);

/// Install a Ctrl-C handler that sets the returned flag.
pub fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| Error::Other(format!("Failed to install Ctrl-C handler: {}", e)))?;
    Ok(flag)
}

/// Sleep for `interval` unless shutdown is requested first.
///
/// Returns false if the loop should stop.
pub fn sleep_unless_shutdown(interval: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(SLICE.min(deadline - now));
    }
}

/// Run `tick` every `interval` until shutdown.
///
/// Returns the number of passes run.
pub fn every(interval: Duration, shutdown: &AtomicBool, mut tick: impl FnMut()) -> u64 {
    let mut passes = 0;
    while !shutdown.load(Ordering::SeqCst) {
        tick();
        passes += 1;
        if !sleep_unless_shutdown(interval, shutdown) {
            break;
        }
    }
    passes
}
