/// Leading-edge debouncer for presence recomputation.
///
/// The first trigger in a quiet period runs the action immediately; triggers
/// arriving inside the window collapse into at most one trailing run once
/// the window has been quiet. This bounds the cost of connect/disconnect
/// storms while keeping latency low for the common single-event case.
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::timeout;

pub struct Debouncer {
    tx: UnboundedSender<()>,
}

impl Debouncer {
    pub fn spawn<F, Fut>(window: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, mut rx) = unbounded_channel::<()>();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                action().await;
                let mut suppressed = false;
                loop {
                    match timeout(window, rx.recv()).await {
                        Ok(Some(())) => suppressed = true,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                if suppressed {
                    action().await;
                }
            }
        });
        Self { tx }
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn counting_debouncer(window: Duration) -> (Debouncer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let debouncer = Debouncer::spawn(window, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (debouncer, count)
    }

    #[tokio::test(start_paused = true)]
    async fn single_trigger_runs_immediately_without_trailing() {
        let (debouncer, count) = counting_debouncer(Duration::from_millis(500));

        debouncer.trigger();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "no suppressed calls, no trailing run");
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_to_leading_run_then_one_trailing() {
        let (debouncer, count) = counting_debouncer(Duration::from_millis(500));

        for _ in 0..10 {
            debouncer.trigger();
        }
        sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "exactly once until the window closes");

        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2, "one trailing run after the quiet window");
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_after_quiet_window_is_leading_again() {
        let (debouncer, count) = counting_debouncer(Duration::from_millis(500));

        debouncer.trigger();
        sleep(Duration::from_millis(600)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        debouncer.trigger();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2, "fresh quiet period runs immediately");
    }
}
