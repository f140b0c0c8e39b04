// Background tick driver.
//
// Embedders call `Session::tick` from their own update loop. The standalone
// binary and the integration tests have no game loop, so `Ticker` runs one
// on a thread at a fixed period with no cab input.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::input::InputState;
use crate::session::Session;

pub struct Ticker {
    keep_running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Tick `session` every `period` until stopped or the session ends.
    pub fn spawn(session: Arc<Session>, period: Duration) -> std::io::Result<Self> {
        let keep_running = Arc::new(AtomicBool::new(true));
        let flag = keep_running.clone();
        let thread = thread::Builder::new()
            .name(format!("railnet-tick-{}", session.name()))
            .spawn(move || {
                while flag.load(Ordering::SeqCst) && session.status().is_live() {
                    session.tick(Instant::now(), InputState::default());
                    thread::sleep(period);
                }
                // One last pass so a pending abandon is applied.
                session.tick(Instant::now(), InputState::default());
            })?;
        Ok(Self {
            keep_running,
            thread: Some(thread),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
