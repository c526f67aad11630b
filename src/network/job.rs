//! Network Service Thread
//!
//! Owns the dedicated thread that drives a [`NetworkManager`] at its
//! configured rate. The manager's coarse lock is the only synchronization:
//! the job calls `service()`, the application calls everything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::network::manager::NetworkManager;

/// Handle to the background service thread.
///
/// Stopping is cooperative: the flag is checked once per pass, so `stop()`
/// returns within roughly one tick.
pub struct NetworkJob {
    manager: Arc<NetworkManager>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NetworkJob {
    /// Spawn the service thread at `rate_hz` passes per second.
    pub fn start(manager: Arc<NetworkManager>, rate_hz: u32) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let tick = Duration::from_secs(1) / rate_hz.max(1);

        let thread_manager = Arc::clone(&manager);
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("emberlink-net".to_string())
            .spawn(move || {
                info!("service thread up at {} hz", rate_hz.max(1));
                while !thread_stop.load(Ordering::Relaxed) {
                    let start = Instant::now();
                    if let Err(err) = thread_manager.service(Duration::ZERO) {
                        warn!("service pass failed: {}", err);
                    }
                    // Sleep out the remainder of the tick; an overrun pass
                    // just starts the next one immediately.
                    if let Some(rest) = tick.checked_sub(start.elapsed()) {
                        std::thread::sleep(rest);
                    }
                }
                info!("service thread down");
            })?;

        Ok(Self {
            manager,
            stop,
            thread: Some(thread),
        })
    }

    /// The managed instance.
    pub fn manager(&self) -> &Arc<NetworkManager> {
        &self.manager
    }

    /// Signal the thread to stop and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("service thread panicked");
            }
        }
    }

    /// True while the thread is running.
    pub fn is_running(&self) -> bool {
        self.thread.is_some() && !self.stop.load(Ordering::Relaxed)
    }
}

impl Drop for NetworkJob {
    fn drop(&mut self) {
        self.stop();
    }
}
