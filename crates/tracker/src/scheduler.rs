use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// One periodic stage: a named interval pushing ticks into a channel. The
/// receiving loop owns the actual work; this side only keeps time. Ticks
/// that land while a pass is still running are skipped rather than queued —
/// replaying them would stack identical passes onto a stage that is already
/// behind.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub tick: mpsc::Sender<()>,
    pub run_immediately: bool,
}

pub fn start(jobs: Vec<JobSpec>) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| tokio::spawn(tick_loop(job)))
        .collect()
}

async fn tick_loop(job: JobSpec) {
    let first_delay = if job.run_immediately {
        Duration::ZERO
    } else {
        job.interval
    };
    let mut timer = tokio::time::interval_at(Instant::now() + first_delay, job.interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        timer.tick().await;
        if job.tick.send(()).await.is_err() {
            // Receiver gone: the stage's worker loop has shut down.
            tracing::debug!(job = %job.name, "tick receiver dropped; stopping interval");
            return;
        }
        tracing::trace!(job = %job.name, "tick dispatched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_fires_jobs_at_intervals() {
        let (tx, mut rx) = mpsc::channel(16);
        let _handles = start(vec![JobSpec {
            name: "tracking_live".to_string(),
            interval: Duration::from_secs(7200),
            tick: tx,
            run_immediately: false,
        }]);

        // Ensure the spawned task is polled once so it registers its timer.
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(7199)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_ok());

        tokio::time::advance(Duration::from_secs(7200)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_can_fire_immediately() {
        let (tx, mut rx) = mpsc::channel(16);
        let _handles = start(vec![JobSpec {
            name: "discovery".to_string(),
            interval: Duration::from_secs(86400),
            tick: tx,
            run_immediately: true,
        }]);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_stops_the_job() {
        let (tx, rx) = mpsc::channel(16);
        let handles = start(vec![JobSpec {
            name: "consensus".to_string(),
            interval: Duration::from_secs(10),
            tick: tx,
            run_immediately: true,
        }]);
        drop(rx);

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        // The task must have exited after the failed send.
        assert!(handles[0].is_finished());
    }
}
