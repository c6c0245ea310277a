//! Shutdown Coordinator (spec §5, §9 "Module-level state").
//!
//! Ground: `httproxy::init::shutdown` (`GracefulShutdown`, `InflightGuard`,
//! `ctrlc2`-driven signal task), extended with the grace-deadline race
//! required by spec §5 ("the process exits when all permits are released or
//! the grace expires").

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use anyhow::Result;
use mea::condvar::Condvar;
use mea::mutex::Mutex;

pub fn init(grace: Duration) -> Result<GracefulShutdown> {
    let ctrlc = install_signal_handler()?;
    let shutdown = GracefulShutdown::new(grace);
    spawn_signal_task(ctrlc, shutdown.clone());
    Ok(shutdown)
}

fn install_signal_handler() -> Result<ctrlc2::AsyncCtrlC> {
    let ctrlc = ctrlc2::AsyncCtrlC::new(move || {
        log::info!("shutdown signal received");
        true
    })
    .map_err(|e| anyhow::anyhow!("failed to install signal handler: {e}"))?;
    Ok(ctrlc)
}

fn spawn_signal_task(ctrlc: ctrlc2::AsyncCtrlC, shutdown: GracefulShutdown) {
    smol::spawn(async move {
        let _ = ctrlc.await;
        log::info!("shutdown requested; waiting for in-flight connections to drain");
        shutdown.initiate();
    })
    .detach();
}

#[derive(Clone)]
pub struct GracefulShutdown {
    inner: Arc<Inner>,
}

struct Inner {
    shutting_down: AtomicBool,
    inflight: AtomicU64,
    gate: Mutex<()>,
    cv: Condvar,
    grace: Duration,
}

pub struct InflightGuard {
    inner: Arc<Inner>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.cv.notify_all();
        }
    }
}

impl GracefulShutdown {
    pub fn new(grace: Duration) -> Self {
        GracefulShutdown {
            inner: Arc::new(Inner {
                shutting_down: AtomicBool::new(false),
                inflight: AtomicU64::new(0),
                gate: Mutex::new(()),
                cv: Condvar::new(),
                grace,
            }),
        }
    }

    pub fn initiate(&self) {
        if self.inner.shutting_down.swap(true, Ordering::Release) {
            return;
        }
        self.inner.cv.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    pub async fn wait_shutting_down(&self) {
        if self.is_shutting_down() {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while !self.is_shutting_down() {
            guard = self.inner.cv.wait(guard).await;
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard {
        self.inner.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            inner: self.inner.clone(),
        }
    }

    async fn wait_inflight_zero(&self) {
        if self.inner.inflight.load(Ordering::Acquire) == 0 {
            return;
        }
        let mut guard = self.inner.gate.lock().await;
        while self.inner.inflight.load(Ordering::Acquire) != 0 {
            guard = self.inner.cv.wait(guard).await;
        }
    }

    /// Waits for in-flight handlers to drain, but no longer than the
    /// configured grace period (spec §5).
    pub async fn wait_inflight_zero_with_grace(&self) {
        let grace = self.inner.grace;
        let drained = async {
            self.wait_inflight_zero().await;
            true
        };
        let timed_out = async {
            smol::Timer::after(grace).await;
            false
        };
        if !smol::future::or(drained, timed_out).await {
            let remaining = self.inner.inflight.load(Ordering::Acquire);
            log::warn!(
                "shutdown grace period ({grace:?}) expired with {remaining} connection(s) still in flight"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inflight_guard_releases_on_drop() {
        smol::block_on(async {
            let shutdown = GracefulShutdown::new(Duration::from_millis(50));
            let guard = shutdown.inflight_guard();
            assert_eq!(shutdown.inner.inflight.load(Ordering::Acquire), 1);
            drop(guard);
            shutdown.wait_inflight_zero_with_grace().await;
            assert_eq!(shutdown.inner.inflight.load(Ordering::Acquire), 0);
        });
    }

    #[test]
    fn grace_expires_with_stuck_handler() {
        smol::block_on(async {
            let shutdown = GracefulShutdown::new(Duration::from_millis(20));
            let _stuck_guard = shutdown.inflight_guard();
            let start = std::time::Instant::now();
            shutdown.wait_inflight_zero_with_grace().await;
            assert!(start.elapsed() >= Duration::from_millis(20));
        });
    }
}
