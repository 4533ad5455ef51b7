use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::stages::Pipeline;

/// Wakes the scheduler loop when an earlier deadline may exist. Cloned into
/// every place that writes a schedule row.
#[derive(Debug, Clone, Default)]
pub struct SchedulerHandle {
    notify: Arc<Notify>,
}

impl SchedulerHandle {
    #[must_use]
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    /// Re-arm the loop; called after any schedule write.
    pub fn rearm(&self) {
        self.notify.notify_one();
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Single long-lived task that sleeps until the earliest persisted deadline
/// and fires everything due. Deadlines are read back from the store on every
/// pass, which is what makes the loop restart safe.
pub async fn run_scheduler(pipeline: Arc<Pipeline>) {
    let handle = pipeline.scheduler();
    match pipeline.recover_schedules() {
        Ok(recovered) if recovered > 0 => debug!(recovered, "schedule recovery sweep done"),
        Ok(_) => {}
        Err(err) => warn!(error = %err, "schedule recovery sweep failed"),
    }
    loop {
        let next = match pipeline.next_deadline() {
            Ok(next) => next,
            Err(err) => {
                warn!(error = %err, "failed to read next deadline");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        match next {
            None => handle.notified().await,
            Some(deadline) => {
                let now = OffsetDateTime::now_utc();
                if deadline <= now {
                    pipeline.fire_due(now).await;
                    continue;
                }
                let wait = Duration::try_from(deadline - now).unwrap_or(Duration::ZERO);
                debug!(
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    "scheduler sleeping until next deadline"
                );
                tokio::select! {
                    () = handle.notified() => {}
                    () = tokio::time::sleep(wait) => {
                        pipeline.fire_due(OffsetDateTime::now_utc()).await;
                    }
                }
            }
        }
    }
}
