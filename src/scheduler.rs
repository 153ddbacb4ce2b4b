use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::checker::TargetChecker;
use crate::settings::Target;
use crate::store::SeenItemStore;

/// Outcome of one pass over all targets.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub targets: usize,
    pub errors: usize,
    pub new_items: usize,
}

/// Drives the checker over every target, forever, one pass per interval.
pub struct Scheduler {
    targets: Vec<Target>,
    checker: TargetChecker,
    store: SeenItemStore,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        targets: Vec<Target>,
        checker: TargetChecker,
        store: SeenItemStore,
        interval: Duration,
    ) -> Self {
        Self {
            targets,
            checker,
            store,
            interval,
        }
    }

    pub fn store(&self) -> &SeenItemStore {
        &self.store
    }

    /// Flush failures mid-run are logged; the next successful flush writes everything.
    fn flush(&self) {
        if let Err(e) = self.store.flush() {
            error!("Failed to persist seen items: {}", e);
        }
    }

    /// Check every target in configuration order, then flush once.
    ///
    /// A target's error is logged and never stops the remaining targets.
    /// Once `shutdown` fires, no further targets are started.
    pub async fn run_pass(&mut self, shutdown: &CancellationToken) -> PassReport {
        let start = Instant::now();
        let mut report = PassReport {
            targets: self.targets.len(),
            ..PassReport::default()
        };

        for target in &self.targets {
            if shutdown.is_cancelled() {
                info!(target_name = %target.name, "Shutdown requested, skipping remaining targets");
                break;
            }
            match self.checker.check(target, &mut self.store, shutdown).await {
                Ok(batch) => report.new_items += batch.len(),
                Err(e) => {
                    report.errors += 1;
                    error!(target_name = %target.name, "Check failed: {}", e);
                }
            }
        }

        self.flush();

        info!(
            targets = report.targets,
            errors = report.errors,
            new_items = report.new_items,
            seen = self.store.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pass complete"
        );
        report
    }

    /// Flush once, then alternate passes and sleeps until `shutdown` fires.
    ///
    /// Cancellation interrupts an in-flight fetch or the sleep. A notification
    /// already being sent is finished, so everything flushed was reported.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(targets = self.targets.len(), interval_secs = self.interval.as_secs(), "Bot starting");
        self.flush();

        loop {
            self.run_pass(&shutdown).await;
            if shutdown.is_cancelled() {
                info!("Shutdown requested during pass");
                break;
            }

            info!(minutes = self.interval.as_secs() / 60, "Waiting for next pass");
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.flush();
        info!(seen = self.store.len(), "Stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::checker::testing::*;
    use crate::settings;
    use crate::store::memory::MemoryBackend;

    const A: &str = "https://a.example.org/jobs/";
    const B: &str = "https://b.example.org/nabory/";

    fn links(hrefs: &[&str]) -> String {
        hrefs
            .iter()
            .map(|h| format!("<a class=\"offer\" href=\"{}\">Offer {}</a>", h, h))
            .collect()
    }

    fn live() -> CancellationToken {
        CancellationToken::new()
    }

    fn scheduler(
        fetcher: Arc<ScriptedFetcher>,
        notifier: Arc<RecordingNotifier>,
        backend: MemoryBackend,
        interval: Duration,
    ) -> Scheduler {
        let targets = vec![
            settings::target("A", A, "a.offer"),
            settings::target("B", B, "a.offer"),
        ];
        let checker = TargetChecker::new(fetchers(fetcher), notifier, "New listings");
        let store = SeenItemStore::load(Box::new(backend)).unwrap();
        Scheduler::new(targets, checker, store, interval)
    }

    #[tokio::test]
    async fn one_notification_per_target_with_only_new_items() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_page(A, &links(&["/jobs/1", "/jobs/2"]))
                .with_page(B, &links(&["/nabory/x", "/nabory/y"])),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let backend = MemoryBackend::seeded(&["https://a.example.org/jobs/1"]);
        let mut s = scheduler(fetcher, notifier.clone(), backend, Duration::from_secs(60));

        let report = s.run_pass(&live()).await;
        assert_eq!(
            report,
            PassReport {
                targets: 2,
                errors: 0,
                new_items: 3
            }
        );

        let sent = notifier.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "New listings: A (1 new)");
        assert_eq!(sent[0].1[0].id, "https://a.example.org/jobs/2");
        assert_eq!(sent[1].0, "New listings: B (2 new)");
        assert_eq!(sent[1].1.len(), 2);
    }

    #[tokio::test]
    async fn second_pass_over_unchanged_pages_finds_nothing() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_page(A, &links(&["/jobs/1"]))
                .with_page(B, &links(&["/nabory/x"])),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let mut s = scheduler(fetcher, notifier.clone(), MemoryBackend::default(), Duration::from_secs(60));

        assert_eq!(s.run_pass(&live()).await.new_items, 2);
        assert_eq!(s.run_pass(&live()).await.new_items, 0);
        assert_eq!(notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_does_not_stop_the_pass() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_page(B, &links(&["/nabory/x"])));
        let notifier = Arc::new(RecordingNotifier::default());
        let mut s = scheduler(fetcher.clone(), notifier.clone(), MemoryBackend::default(), Duration::from_secs(60));

        let report = s.run_pass(&live()).await;
        assert_eq!(report.new_items, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![A.to_string(), B.to_string()]);
        assert_eq!(notifier.sent()[0].0, "New listings: B (1 new)");
    }

    #[tokio::test]
    async fn notifier_failure_is_isolated_and_not_retried() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_page(A, &links(&["/jobs/1"]))
                .with_page(B, &links(&["/nabory/x"])),
        );
        let notifier = Arc::new(RecordingNotifier::failing_for(": A ("));
        let mut s = scheduler(fetcher, notifier.clone(), MemoryBackend::default(), Duration::from_secs(60));

        let first = s.run_pass(&live()).await;
        assert_eq!(first.errors, 1);
        assert_eq!(first.new_items, 1);
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "New listings: B (1 new)");
        assert!(s.store().contains("https://a.example.org/jobs/1"));

        let second = s.run_pass(&live()).await;
        assert_eq!(second, PassReport { targets: 2, errors: 0, new_items: 0 });
    }

    #[tokio::test]
    async fn pass_flushes_store() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_page(A, &links(&["/jobs/7"])));
        let backend = MemoryBackend::default();
        let mut s = scheduler(
            fetcher,
            Arc::new(RecordingNotifier::default()),
            backend.clone(),
            Duration::from_secs(60),
        );

        s.run_pass(&live()).await;
        assert_eq!(backend.save_count(), 1);
        assert!(backend
            .saved
            .lock()
            .unwrap()
            .contains("https://a.example.org/jobs/7"));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_repeats_on_interval_until_cancelled() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_page(A, &links(&["/jobs/1"])));
        let backend = MemoryBackend::default();
        let s = scheduler(
            fetcher.clone(),
            Arc::new(RecordingNotifier::default()),
            backend.clone(),
            Duration::from_secs(10 * 60),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(s.run(shutdown.clone()));

        // Passes at t=0, 10 and 20 minutes.
        tokio::time::sleep(Duration::from_secs(25 * 60)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // Two targets per pass.
        assert_eq!(fetcher.calls.lock().unwrap().len(), 6);
        // Startup baseline, three passes, final flush.
        assert_eq!(backend.save_count(), 5);
    }

    #[tokio::test]
    async fn failed_flush_is_written_by_next_pass() {
        let fetcher = Arc::new(ScriptedFetcher::default().with_page(A, &links(&["/jobs/1"])));
        let backend = MemoryBackend::default();
        backend.fail_next_saves(1);
        let mut s = scheduler(
            fetcher.clone(),
            Arc::new(RecordingNotifier::default()),
            backend.clone(),
            Duration::from_secs(60),
        );

        assert_eq!(s.run_pass(&live()).await.new_items, 1);
        assert_eq!(backend.save_count(), 0);
        assert!(backend.saved.lock().unwrap().is_empty());

        fetcher.set_page(A, &links(&["/jobs/1", "/jobs/2"]));
        assert_eq!(s.run_pass(&live()).await.new_items, 1);
        assert_eq!(backend.save_count(), 1);
        let saved = backend.saved.lock().unwrap();
        assert!(saved.contains("https://a.example.org/jobs/1"));
        assert!(saved.contains("https://a.example.org/jobs/2"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_notification_keeps_it_and_stops() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_page(A, &links(&["/jobs/1"]))
                .with_page(B, &links(&["/nabory/x"])),
        );
        let notifier = Arc::new(RecordingNotifier::slow(Duration::from_secs(30)));
        let backend = MemoryBackend::default();
        let s = scheduler(
            fetcher.clone(),
            notifier.clone(),
            backend.clone(),
            Duration::from_secs(10 * 60),
        );

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(s.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // A's email was in flight and completes; B is never started.
        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "New listings: A (1 new)");
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![A.to_string()]);

        let notified: Vec<String> = sent
            .iter()
            .flat_map(|(_, items)| items.iter().map(|i| i.id.clone()))
            .collect();
        let saved = backend.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved.iter().all(|id| notified.contains(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_fetch_stops_promptly_without_recording() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .with_page(A, &links(&["/jobs/1"]))
                .with_page(B, &links(&["/nabory/x"]))
                .with_delay(Duration::from_secs(30)),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let backend = MemoryBackend::default();
        let s = scheduler(
            fetcher.clone(),
            notifier.clone(),
            backend.clone(),
            Duration::from_secs(10 * 60),
        );

        let start = tokio::time::Instant::now();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(s.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(30));
        assert_eq!(*fetcher.calls.lock().unwrap(), vec![A.to_string()]);
        assert!(notifier.sent().is_empty());
        assert!(backend.saved.lock().unwrap().is_empty());
        // Startup baseline, the cut-short pass, final flush.
        assert_eq!(backend.save_count(), 3);
    }
}
