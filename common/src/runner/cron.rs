// Local cron table of cycle jobs

use crate::models::Job;
use crate::schedule::Timer;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Job data shared between the table and its ticker
pub type SharedJob = Arc<RwLock<Job>>;

struct CronEntry {
    timer: String,
    job: SharedJob,
    cancel: CancellationToken,
}

/// What `upsert` did with an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    /// Same timer; only the job data was refreshed
    Updated,
    Rescheduled,
}

/// Entries keyed by `Job.ID + Rule.ID`, each driven by its own ticker task
pub struct CronTable {
    entries: HashMap<String, CronEntry>,
    parent: CancellationToken,
}

impl CronTable {
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            entries: HashMap::new(),
            parent,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, entry_id: &str) -> bool {
        self.entries.contains_key(entry_id)
    }

    /// Register or refresh the entry of `job`
    ///
    /// `fire` runs on every tick with the latest job data. An unchanged
    /// timer keeps the running ticker and its phase.
    pub fn upsert<F, Fut>(&mut self, job: Job, timer: Timer, fire: F) -> Upsert
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry_id = job.entry_id();
        if let Some(entry) = self.entries.get(&entry_id) {
            if entry.timer == job.rule.timer {
                *entry.job.write().unwrap_or_else(PoisonError::into_inner) = job;
                return Upsert::Updated;
            }
        }

        let outcome = match self.entries.remove(&entry_id) {
            Some(old) => {
                old.cancel.cancel();
                Upsert::Rescheduled
            }
            None => Upsert::Added,
        };

        let cancel = self.parent.child_token();
        let timer_expr = job.rule.timer.clone();
        let shared: SharedJob = Arc::new(RwLock::new(job));
        tokio::spawn(tick(timer, shared.clone(), cancel.clone(), fire));
        info!(entry_id = %entry_id, timer = %timer_expr, outcome = ?outcome, "Cron entry registered");
        self.entries.insert(
            entry_id,
            CronEntry {
                timer: timer_expr,
                job: shared,
                cancel,
            },
        );
        outcome
    }

    pub fn remove(&mut self, entry_id: &str) -> bool {
        match self.entries.remove(entry_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(entry_id, "Cron entry removed");
                true
            }
            None => false,
        }
    }
}

impl Drop for CronTable {
    fn drop(&mut self) {
        for entry in self.entries.values() {
            entry.cancel.cancel();
        }
    }
}

async fn tick<F, Fut>(timer: Timer, job: SharedJob, cancel: CancellationToken, fire: F)
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    loop {
        let wait = match &timer {
            Timer::Every(every) => every.to_std().unwrap_or_default(),
            Timer::Cron(_) => {
                let now = Utc::now();
                let Some(next) = timer.next_after(now) else {
                    warn!("Timer has no future fire time, stopping entry");
                    return;
                };
                (next - now).to_std().unwrap_or_default()
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let current = job.read().unwrap_or_else(PoisonError::into_inner).clone();
        debug!(job_id = %current.id, "Cron entry fired");
        // Overlapping runs are allowed; the distributed lock arbitrates
        tokio::spawn(fire(current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobKind, Rule, RunMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job(timer: &str) -> Job {
        Job {
            id: "job-1".to_string(),
            task_id: "t1".to_string(),
            node_id: "n1".to_string(),
            hash: "h".to_string(),
            name: String::new(),
            command: "true".to_string(),
            stdin: String::new(),
            envs: Vec::new(),
            rule: Rule {
                id: "r1".to_string(),
                mode: RunMode::Cycle,
                timer: timer.to_string(),
                labels: HashMap::new(),
            },
            kind: JobKind::Common,
            timeout: 0,
            retry: 0,
            interval: 0,
            avg_time: 0,
            scheduler: None,
            run_status: None,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Job) -> std::future::Ready<()> + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move |_job| {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_entry_fires_until_removed() {
        let mut table = CronTable::new(CancellationToken::new());
        let (count, fire) = counter();
        let j = job("@every 10s");
        let timer = Timer::parse(&j.rule.timer).unwrap();
        assert_eq!(table.upsert(j.clone(), timer, fire), Upsert::Added);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(table.remove(&j.entry_id()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_timer_keeps_ticker_changed_timer_reschedules() {
        let mut table = CronTable::new(CancellationToken::new());
        let (count, fire) = counter();
        let j = job("@every 10s");
        table.upsert(j.clone(), Timer::parse("@every 10s").unwrap(), fire);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut changed_cmd = j.clone();
        changed_cmd.command = "false".to_string();
        let (_, fire) = counter();
        assert_eq!(
            table.upsert(changed_cmd, Timer::parse("@every 10s").unwrap(), fire),
            Upsert::Updated
        );
        // The first ticker kept its phase
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let mut slower = j.clone();
        slower.rule.timer = "@every 60s".to_string();
        let (slow_count, fire) = counter();
        assert_eq!(
            table.upsert(slower, Timer::parse("@every 60s").unwrap(), fire),
            Upsert::Rescheduled
        );
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(slow_count.load(Ordering::SeqCst), 0);
        assert_eq!(table.len(), 1);
    }
}
