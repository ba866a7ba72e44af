//! Background keep-alive worker shared by the network transports.
//!
//! The worker ticks on a bounded channel receive so `stop()` interrupts it
//! immediately; `close()` stops and joins it before the session is torn
//! down, so it can never poke a closed session.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;

/// Tick interval of the worker.
pub(crate) const TICK: Duration = Duration::from_secs(1);

/// Idle ticks before the no-op command goes out.
pub(crate) const IDLE_TICKS: u32 = 55;

pub(crate) struct KeepAlive {
    stop: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
    idle: Arc<AtomicU32>,
}

impl KeepAlive {
    /// Spawn the worker. `poke` issues the keep-alive no-op and returns
    /// false when the session is gone and the worker should exit.
    pub(crate) fn spawn<F>(tick: Duration, idle_ticks: u32, mut poke: F) -> Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let idle = Arc::new(AtomicU32::new(0));
        let worker_idle = Arc::clone(&idle);
        let (stop, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("ipmi-keepalive".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(tick) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if worker_idle.fetch_add(1, Ordering::Relaxed) + 1 >= idle_ticks {
                            worker_idle.store(0, Ordering::Relaxed);
                            if !poke() {
                                break;
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
            idle,
        })
    }

    /// Reset the idle counter; called on every foreground command.
    pub(crate) fn touch(&self) {
        self.idle.store(0, Ordering::Relaxed);
    }

    /// Signal the worker and join it.
    pub(crate) fn stop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn pokes_after_idle_ticks_and_stops_on_signal() {
        let pokes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&pokes);
        let mut ka = KeepAlive::spawn(Duration::from_millis(5), 3, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        })
        .expect("spawn");

        std::thread::sleep(Duration::from_millis(100));
        ka.stop();
        let seen = pokes.load(Ordering::Relaxed);
        assert!(seen >= 1, "worker never fired");

        // Joined: no further pokes after stop.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pokes.load(Ordering::Relaxed), seen);
    }

    #[test]
    fn touch_defers_the_poke() {
        let pokes = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&pokes);
        let mut ka = KeepAlive::spawn(Duration::from_millis(20), 5, move || {
            counter.fetch_add(1, Ordering::Relaxed);
            true
        })
        .expect("spawn");

        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(10));
            ka.touch();
        }
        assert_eq!(pokes.load(Ordering::Relaxed), 0);
        ka.stop();
    }

    #[test]
    fn worker_exits_when_poke_reports_gone() {
        let mut ka = KeepAlive::spawn(Duration::from_millis(5), 1, || false).expect("spawn");
        std::thread::sleep(Duration::from_millis(50));
        // The thread already exited; stop() just joins it.
        ka.stop();
    }
}
