//! Continuous attendance sessions.
//!
//! A session holds the camera and runs one detection per tick, marking
//! everyone recognized as present. Ticks run back to back on a single task,
//! so two detections never overlap; ticks that fall due while one is still
//! running are skipped.

use crate::engine::{EngineError, EngineHandle, Probe};
use chrono::{DateTime, Local, Utc};
use rollcall_records::AttendanceService;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub type SharedService = Arc<Mutex<AttendanceService>>;

/// Consecutive failed ticks after which a session gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// The camera as held by one session. Dropping an unreleased lease still
/// queues a release.
struct CameraLease {
    engine: EngineHandle,
    released: bool,
}

impl CameraLease {
    async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.engine.release().await {
            tracing::warn!(error = %e, "camera release failed");
        }
    }
}

impl Drop for CameraLease {
    fn drop(&mut self) {
        if !self.released && !self.engine.release_detached() {
            tracing::warn!("could not queue camera release");
        }
    }
}

#[derive(Default)]
struct SessionCounters {
    ticks: AtomicU64,
    marked: AtomicU64,
    failures: AtomicU64,
}

struct RunningSession {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
    counters: Arc<SessionCounters>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub marked: u64,
    pub failures: u64,
}

pub struct SessionController {
    engine: EngineHandle,
    service: SharedService,
    interval: Duration,
    running: Mutex<Option<RunningSession>>,
}

impl SessionController {
    pub fn new(engine: EngineHandle, service: SharedService, interval: Duration) -> Self {
        Self {
            engine,
            service,
            interval,
            running: Mutex::new(None),
        }
    }

    /// Start a session. Returns false if one is already running.
    ///
    /// Fails without starting if the camera cannot be acquired; callers may
    /// retry once it is available.
    pub async fn start(&self) -> Result<bool, EngineError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|s| !s.task.is_finished()) {
            tracing::debug!("session already running");
            return Ok(false);
        }
        if let Some(stale) = running.take() {
            let _ = stale.task.await;
        }

        if !self.engine.acquire().await? {
            // No session is running, so nothing may hold the camera.
            tracing::error!("camera already held with no session running");
            return Err(EngineError::CameraUnavailable("camera is held by another user".into()));
        }
        let lease = CameraLease {
            engine: self.engine.clone(),
            released: false,
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let counters = Arc::new(SessionCounters::default());
        let task = tokio::spawn(run_session(
            lease,
            self.engine.clone(),
            Arc::clone(&self.service),
            self.interval,
            stop_rx,
            Arc::clone(&counters),
        ));

        *running = Some(RunningSession {
            stop: stop_tx,
            task,
            started_at: Utc::now(),
            counters,
        });
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "session started");
        Ok(true)
    }

    /// Stop the session and wait for any in-flight tick. Returns false if no
    /// session was running.
    ///
    /// The controller stays locked until the camera is released, so a
    /// concurrent `start` cannot slip in while the old lease is live.
    pub async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(session) = running.take() else {
            return false;
        };
        let was_active = !session.task.is_finished();
        let _ = session.stop.send(());
        if let Err(e) = session.task.await {
            tracing::warn!(error = %e, "session task ended abnormally");
        }

        tracing::info!(
            ticks = session.counters.ticks.load(Ordering::Relaxed),
            marked = session.counters.marked.load(Ordering::Relaxed),
            "session stopped"
        );
        was_active
    }

    pub async fn status(&self) -> SessionStatus {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(s) => SessionStatus {
                active: !s.task.is_finished(),
                started_at: Some(s.started_at),
                ticks: s.counters.ticks.load(Ordering::Relaxed),
                marked: s.counters.marked.load(Ordering::Relaxed),
                failures: s.counters.failures.load(Ordering::Relaxed),
            },
            None => SessionStatus {
                active: false,
                started_at: None,
                ticks: 0,
                marked: 0,
                failures: 0,
            },
        }
    }
}

async fn run_session(
    lease: CameraLease,
    engine: EngineHandle,
    service: SharedService,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
    counters: Arc<SessionCounters>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {
                counters.ticks.fetch_add(1, Ordering::Relaxed);
                match tick(&engine, &service).await {
                    Ok(marked) => {
                        consecutive_failures = 0;
                        counters.marked.fetch_add(marked as u64, Ordering::Relaxed);
                    }
                    Err(EngineError::ChannelClosed) => {
                        tracing::error!("engine gone; ending session");
                        break;
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        counters.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, consecutive_failures, "session tick failed");
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            tracing::error!("too many failed ticks; ending session");
                            break;
                        }
                    }
                }
            }
        }
    }

    lease.release().await;
}

/// One detection pass. Returns how many marks were applied.
async fn tick(engine: &EngineHandle, service: &SharedService) -> Result<usize, EngineError> {
    let gallery = service.lock().await.gallery();
    if gallery.is_empty() {
        return Ok(0);
    }

    let results = engine.detect(Probe::Camera, gallery).await?;
    if results.is_empty() {
        return Ok(0);
    }

    let today = Local::now().date_naive();
    let outcome = service.lock().await.record_detections(today, &results);
    tracing::debug!(date = %today, matched = results.len(), marked = outcome.applied.len(), "session tick");
    Ok(outcome.applied.len())
}
