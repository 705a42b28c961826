// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-driven flushing of the line buffer.
//!
//! The scheduler is a single task that owns the flush timer. With
//! [`FlushPolicy::Debounce`] every accepted write restarts the timer, so a
//! flush happens after one quiet interval; with
//! [`FlushPolicy::FixedInterval`] it fires every interval regardless of
//! activity. In both cases an empty buffer is never flushed.
//!
//! Size-triggered batches dropped on a full delivery queue are reported with
//! a warning at most once per interval, and once more on shutdown.
//!
//! On cancellation the scheduler stops the timer, closes the buffer to new
//! writes, queues whatever was still buffered as the final batch and releases
//! the queue so the delivery worker can drain and exit.

use crate::config::FlushPolicy;
use crate::sink::Shared;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) struct FlushScheduler {
    shared: Arc<Shared>,
    interval: Duration,
    policy: FlushPolicy,
    cancel: CancellationToken,
}

impl FlushScheduler {
    pub(crate) fn new(
        shared: Arc<Shared>,
        interval: Duration,
        policy: FlushPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            interval,
            policy,
            cancel,
        }
    }

    pub(crate) async fn run(self) {
        debug!("LOKI | Flush scheduler started ({:?}, {:?})", self.policy, self.interval);
        let debounce = self.policy == FlushPolicy::Debounce;
        let mut deadline = Instant::now() + self.interval;
        let mut last_report = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = self.shared.rearm.notified(), if debounce => {
                    deadline = Instant::now() + self.interval;
                    // Steady writes keep the timer from firing.
                    if last_report.elapsed() >= self.interval {
                        self.report_drops();
                        last_report = Instant::now();
                    }
                }
                () = sleep_until(deadline) => {
                    self.fire().await;
                    last_report = Instant::now();
                    deadline = Instant::now() + self.interval;
                }
            }
        }

        self.shutdown().await;
    }

    fn report_drops(&self) {
        let dropped = self.shared.take_unreported_drops();
        if dropped > 0 {
            warn!("LOKI | Delivery queue full, dropped {dropped} batches");
        }
    }

    async fn fire(&self) {
        self.report_drops();

        let Some((lines, sender)) = self.shared.take_pending() else {
            return;
        };
        debug!("LOKI | Timer flush of {} lines", lines.len());
        if sender.send(lines).await.is_err() {
            warn!("LOKI | Delivery worker stopped, timer batch discarded");
        }
    }

    async fn shutdown(&self) {
        let (lines, sender) = self.shared.close();
        self.report_drops();
        match sender {
            Some(sender) if !lines.is_empty() => {
                debug!("LOKI | Final flush of {} lines", lines.len());
                if sender.send(lines).await.is_err() {
                    warn!("LOKI | Delivery worker stopped, final batch discarded");
                }
            }
            _ => {}
        }
        debug!("LOKI | Flush scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::LokiSink;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tracing_test::traced_test;

    const INTERVAL: Duration = Duration::from_secs(5);

    struct Harness {
        sink: LokiSink,
        rx: mpsc::Receiver<Vec<String>>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(policy: FlushPolicy, batch_size: usize) -> Harness {
        start_with_queue(policy, batch_size, 16)
    }

    fn start_with_queue(policy: FlushPolicy, batch_size: usize, capacity: usize) -> Harness {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared::new(batch_size, tx, cancel.clone()));
        let scheduler = FlushScheduler::new(Arc::clone(&shared), INTERVAL, policy, cancel.clone());
        let task = tokio::spawn(scheduler.run());
        Harness {
            sink: LokiSink::new(shared, None),
            rx,
            cancel,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_flushes_after_quiet_interval() {
        let mut h = start(FlushPolicy::Debounce, 100);
        h.sink.write_line(b"one").unwrap();

        assert!(timeout(INTERVAL - Duration::from_millis(10), h.rx.recv())
            .await
            .is_err());
        let batch = timeout(Duration::from_millis(20), h.rx.recv())
            .await
            .expect("timer should have fired")
            .unwrap();
        assert_eq!(batch, vec!["one"]);
        assert_eq!(h.sink.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_write_restarts_timer() {
        let mut h = start(FlushPolicy::Debounce, 100);
        h.sink.write_line(b"one").unwrap();
        sleep(Duration::from_secs(4)).await;
        h.sink.write_line(b"two").unwrap();

        // The first deadline (t=5s) passes without a flush.
        assert!(timeout(INTERVAL - Duration::from_millis(10), h.rx.recv())
            .await
            .is_err());
        let batch = timeout(Duration::from_millis(20), h.rx.recv())
            .await
            .expect("timer should fire one interval after the last write")
            .unwrap();
        assert_eq!(batch, vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_ignores_writes() {
        let mut h = start(FlushPolicy::FixedInterval, 100);
        h.sink.write_line(b"one").unwrap();
        sleep(Duration::from_secs(4)).await;
        h.sink.write_line(b"two").unwrap();

        let batch = timeout(Duration::from_millis(1010), h.rx.recv())
            .await
            .expect("fixed timer should fire at t=5s")
            .unwrap();
        assert_eq!(batch, vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_is_not_flushed() {
        let mut h = start(FlushPolicy::FixedInterval, 100);
        assert!(timeout(INTERVAL * 3, h.rx.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_remaining_lines_once() {
        let mut h = start(FlushPolicy::Debounce, 100);
        h.sink.write_line(b"a").unwrap();
        h.sink.write_line(b"b").unwrap();

        h.cancel.cancel();
        h.task.await.unwrap();

        assert_eq!(h.rx.recv().await.unwrap(), vec!["a", "b"]);
        // The scheduler released the queue: no further batches, ever.
        assert!(h.rx.recv().await.is_none());
        assert!(h.sink.write_line(b"late").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_empty_buffer_sends_nothing() {
        let mut h = start(FlushPolicy::Debounce, 100);
        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(h.rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_and_timer_together() {
        let mut h = start(FlushPolicy::Debounce, 2);
        h.sink.write_line(b"1").unwrap();
        h.sink.write_line(b"2").unwrap();
        h.sink.write_line(b"3").unwrap();

        assert_eq!(h.rx.recv().await.unwrap(), vec!["1", "2"]);
        let batch = timeout(INTERVAL + Duration::from_millis(10), h.rx.recv())
            .await
            .expect("timer should flush the leftover line")
            .unwrap();
        assert_eq!(batch, vec!["3"]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_drops_reported_while_writes_keep_timer_armed() {
        // Nothing drains the queue, so every batch after the first is dropped.
        let mut h = start_with_queue(FlushPolicy::Debounce, 1, 1);
        for i in 0..20 {
            h.sink.write_line(format!("line {i}").as_bytes()).unwrap();
            sleep(Duration::from_secs(1)).await;
        }

        assert_eq!(h.sink.dropped_batches(), 19);
        assert!(logs_contain("Delivery queue full"));

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.sink.dropped_batches(), 19);
        assert_eq!(h.rx.recv().await.unwrap(), vec!["line 0"]);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_shutdown_reports_unreported_drops() {
        let h = start_with_queue(FlushPolicy::Debounce, 1, 1);
        h.sink.write_line(b"kept").unwrap();
        h.sink.write_line(b"lost").unwrap();
        h.sink.write_line(b"lost too").unwrap();
        assert!(!logs_contain("Delivery queue full"));

        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(logs_contain("Delivery queue full, dropped 2 batches"));
        assert_eq!(h.sink.dropped_batches(), 2);
    }
}
