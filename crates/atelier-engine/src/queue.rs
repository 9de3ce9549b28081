use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use atelier_contracts::request::GenerationRequest;

use crate::orchestrator::{AttemptReport, Orchestrator};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Holds at most one request parked by the quota gate and re-runs it once
/// the window can absorb a full attempt. There is no maximum queue time;
/// only [`QueueController::cancel`] drops a pending request.
pub struct QueueController {
    orchestrator: Arc<Orchestrator>,
    pending: Mutex<Option<GenerationRequest>>,
}

impl QueueController {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            pending: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs the request now. A queued result keeps it as the pending request;
    /// any other result supersedes whatever was pending.
    pub fn submit(&self, request: GenerationRequest) -> AttemptReport {
        let report = self.orchestrator.generate(&request);
        *self.lock_pending() = report.is_queued().then_some(request);
        report
    }

    /// Re-runs the pending request if the window has room for it. Returns the
    /// report of that run, or `None` when nothing ran.
    pub fn tick(&self) -> Option<AttemptReport> {
        let request = {
            let mut pending = self.lock_pending();
            if pending.is_none() || !self.orchestrator.has_capacity_for_attempt() {
                return None;
            }
            pending.take()?
        };

        tracing::info!("quota recovered; re-running queued request");
        let report = self.orchestrator.generate(&request);
        if report.is_queued() {
            let mut pending = self.lock_pending();
            if pending.is_none() {
                *pending = Some(request);
            }
        }
        Some(report)
    }

    pub fn cancel(&self) -> Option<GenerationRequest> {
        let dropped = self.lock_pending().take();
        if dropped.is_some() {
            tracing::info!("queued request cancelled");
        }
        dropped
    }

    pub fn is_queued(&self) -> bool {
        self.lock_pending().is_some()
    }

    pub fn pending(&self) -> Option<GenerationRequest> {
        self.lock_pending().clone()
    }

    /// Ticks on `interval` until nothing is pending or `timeout` elapses.
    /// Returns the last report produced by a tick.
    pub fn run_until_settled(
        &self,
        interval: Duration,
        timeout: Duration,
    ) -> Option<AttemptReport> {
        let started = Instant::now();
        let mut last = None;
        while self.is_queued() {
            if let Some(report) = self.tick() {
                last = Some(report);
                continue;
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                break;
            }
            thread::sleep(interval.min(timeout - elapsed));
        }
        last
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<GenerationRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background thread that ticks a controller on a fixed interval.
pub struct QueueTicker {
    stop_flag: Arc<AtomicBool>,
    sender: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl QueueTicker {
    pub fn spawn(
        controller: Arc<QueueController>,
        interval: Duration,
        on_report: impl Fn(AttemptReport) + Send + 'static,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<()>();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop_flag);
        let handle = thread::Builder::new()
            .name("atelier-queue-ticker".to_string())
            .spawn(move || {
                while !worker_stop.load(Ordering::SeqCst) {
                    match rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                    if worker_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Some(report) = controller.tick() {
                        on_report(report);
                    }
                }
            })?;
        Ok(Self {
            stop_flag,
            sender: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(tx) = self.sender.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QueueTicker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use atelier_contracts::outcome::OrchestratorState;
    use atelier_contracts::quota::QuotaWindow;
    use atelier_contracts::request::{AspectRatio, ImageBlob, SceneMode};

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::prompts::PromptLibrary;
    use crate::quota::QuotaTracker;
    use crate::testing::{image_response, ScriptedProvider};

    const WINDOW_MS: u64 = 60_000;

    fn controller(provider: Arc<ScriptedProvider>, clock: Arc<ManualClock>) -> QueueController {
        let orchestrator = Orchestrator::new(
            provider.client(),
            Arc::new(PromptLibrary::builtin().unwrap()),
            Arc::new(QuotaTracker::new(QuotaWindow::new(60, WINDOW_MS).unwrap())),
            clock,
        );
        QueueController::new(Arc::new(orchestrator))
    }

    fn request() -> GenerationRequest {
        GenerationRequest::scene(
            ImageBlob::png(vec![1]),
            SceneMode {
                prompt_template: "a quiet harbor".to_string(),
                scene_name: "Harbor".to_string(),
            },
            AspectRatio::Square,
            None,
        )
    }

    /// 57 records: 50 old ones that expire first, then 7 newer ones. Leaves 3
    /// slots now and 53 once the old batch leaves the window.
    fn fill_to_three_remaining(controller: &QueueController, clock: &ManualClock) {
        let quota = controller.orchestrator().quota();
        quota.record_many(clock.now_ms(), 50);
        clock.advance(10_000);
        quota.record_many(clock.now_ms(), 7);
    }

    #[test]
    fn queued_request_reruns_when_capacity_recovers() {
        let provider = ScriptedProvider::new(|_| Ok(image_response(&[1], "image/png")));
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(provider.clone(), clock.clone());
        fill_to_three_remaining(&controller, &clock);
        assert_eq!(controller.orchestrator().quota().remaining(clock.now_ms()), 3);

        let report = controller.submit(request());
        assert!(report.is_queued());
        assert!(controller.is_queued());
        assert_eq!(controller.pending(), Some(request()));
        assert!(controller.tick().is_none());
        assert!(provider.calls().is_empty());

        clock.set(WINDOW_MS);
        assert_eq!(controller.orchestrator().quota().remaining(clock.now_ms()), 53);
        let report = controller.tick().unwrap();
        assert!(matches!(report.state, OrchestratorState::Succeeded(_)));
        assert!(!controller.is_queued());
        assert_eq!(provider.calls().len(), 5);
        assert!(controller.tick().is_none());
    }

    #[test]
    fn recovery_from_three_to_ten_runs_one_attempt() {
        let provider = ScriptedProvider::new(|_| Ok(image_response(&[1], "image/png")));
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(provider.clone(), clock.clone());
        let quota = controller.orchestrator().quota();
        quota.record_many(0, 7);
        clock.set(10_000);
        quota.record_many(clock.now_ms(), 50);
        assert_eq!(quota.remaining(clock.now_ms()), 3);
        assert!(controller.submit(request()).is_queued());

        clock.set(WINDOW_MS);
        assert_eq!(quota.remaining(clock.now_ms()), 10);
        let report = controller.tick().unwrap();
        assert!(report.outcome().is_some());
        assert_eq!(provider.calls().len(), 5);
        assert_eq!(quota.remaining(clock.now_ms()), 5);
        assert!(!controller.is_queued());
    }

    #[test]
    fn tick_waits_for_a_full_attempt_of_capacity() {
        let provider = ScriptedProvider::new(|_| Ok(image_response(&[1], "image/png")));
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(provider.clone(), clock.clone());
        let quota = controller.orchestrator().quota();
        quota.record_many(0, 10);
        quota.record_many(5_000, 46);
        clock.set(5_000);
        assert!(controller.submit(request()).is_queued());

        // Oldest batch is still live one millisecond before it expires.
        clock.set(WINDOW_MS - 1);
        assert!(controller.tick().is_none());
        clock.set(WINDOW_MS);
        assert!(controller.tick().is_some());
    }

    #[test]
    fn cancel_drops_pending_request() {
        let provider = ScriptedProvider::new(|_| Ok(image_response(&[1], "image/png")));
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(provider.clone(), clock.clone());
        fill_to_three_remaining(&controller, &clock);
        controller.submit(request());

        assert_eq!(controller.cancel(), Some(request()));
        assert!(!controller.is_queued());
        clock.set(WINDOW_MS * 2);
        assert!(controller.tick().is_none());
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn successful_submit_leaves_nothing_pending() {
        let provider = ScriptedProvider::new(|_| Ok(image_response(&[1], "image/png")));
        let controller = controller(provider, Arc::new(ManualClock::new(0)));
        let report = controller.submit(request());
        assert!(report.outcome().is_some());
        assert!(!controller.is_queued());
    }

    #[test]
    fn run_until_settled_gives_up_at_timeout() {
        let provider = ScriptedProvider::new(|_| Ok(image_response(&[1], "image/png")));
        let clock = Arc::new(ManualClock::new(0));
        let controller = controller(provider, clock.clone());
        fill_to_three_remaining(&controller, &clock);
        controller.submit(request());

        let last = controller.run_until_settled(Duration::from_millis(5), Duration::from_millis(20));
        assert!(last.is_none());
        assert!(controller.is_queued());
    }

    #[test]
    fn ticker_runs_queued_request_in_background() {
        let provider = ScriptedProvider::new(|_| Ok(image_response(&[1], "image/png")));
        let clock = Arc::new(ManualClock::new(0));
        let controller = Arc::new(controller(provider, clock.clone()));
        fill_to_three_remaining(&controller, &clock);
        assert!(controller.submit(request()).is_queued());

        let (tx, rx) = mpsc::channel();
        let mut ticker = QueueTicker::spawn(
            Arc::clone(&controller),
            Duration::from_millis(5),
            move |report| {
                let _ = tx.send(report);
            },
        )
        .unwrap();
        assert!(ticker.is_running());

        clock.set(WINDOW_MS);
        let report = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(report.outcome().is_some());
        ticker.stop();
        assert!(!ticker.is_running());
        assert!(!controller.is_queued());
    }
}
