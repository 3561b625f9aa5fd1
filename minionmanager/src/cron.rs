// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Cron engine driving the periodic pool refresh jobs.
//!
//! Jobs carry a firing pattern expressed as an option map over the usual
//! cron fields. A background loop checks the registered jobs once per
//! minute and fires the matching ones on the runtime; overlapping fires of
//! the same job name are suppressed.

use chrono::{DateTime, Datelike, Timelike, Utc};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Boxed async callback with pre-bound arguments.
pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Firing pattern for a cron job. Every populated field must match the
/// current time for the job to fire; at minimum `minute` is populated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    pub minute: Option<u32>,
    pub hour: Option<u32>,
    pub day_of_month: Option<u32>,
    pub month: Option<u32>,
    /// 1 = Monday .. 7 = Sunday.
    pub day_of_week: Option<u32>,
}

impl Schedule {
    /// Fire at the given minute of every hour.
    pub fn on_minute(minute: u32) -> Self {
        Schedule {
            minute: Some(minute),
            ..Default::default()
        }
    }

    pub fn matches(&self, now: &DateTime<Utc>) -> bool {
        if let Some(minute) = self.minute {
            if now.minute() != minute {
                return false;
            }
        }
        if let Some(hour) = self.hour {
            if now.hour() != hour {
                return false;
            }
        }
        if let Some(day_of_month) = self.day_of_month {
            if now.day() != day_of_month {
                return false;
            }
        }
        if let Some(month) = self.month {
            if now.month() != month {
                return false;
            }
        }
        if let Some(day_of_week) = self.day_of_week {
            if now.weekday().number_from_monday() != day_of_week {
                return false;
            }
        }
        true
    }
}

pub struct CronJob {
    pub name: String,
    pub description: String,
    pub schedule: Schedule,
    pub enabled: bool,
    callback: JobCallback,
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schedule: Schedule,
        enabled: bool,
        callback: JobCallback,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schedule,
            enabled,
            callback,
        }
    }
}

/// Process-wide job scheduler. Registration is keyed by job name, so
/// re-registering a job replaces the previous definition.
pub struct Cron {
    jobs: Mutex<HashMap<String, CronJob>>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Default for Cron {
    fn default() -> Self {
        Self::new()
    }
}

impl Cron {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn register(&self, job: CronJob) {
        debug!("Registering cron job '{}': {}", job.name, job.description);
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.name.clone(), job);
    }

    pub fn unregister(&self, name: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        if jobs.remove(name).is_some() {
            debug!("Unregistered cron job '{}'", name);
        }
    }

    /// Remove every job whose name starts with the given prefix. Used when
    /// a pool goes away and its per-minute refresh jobs must go with it.
    pub fn unregister_prefixed(&self, prefix: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|name, _| !name.starts_with(prefix));
    }

    pub fn job_names(&self) -> Vec<String> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.keys().cloned().collect()
    }

    /// Fire every enabled job whose schedule matches `now`. A job still
    /// running from an earlier fire is skipped with a warning.
    pub fn fire_matching(&self, now: DateTime<Utc>) {
        let due: Vec<(String, JobCallback)> = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.values()
                .filter(|job| job.enabled && job.schedule.matches(&now))
                .map(|job| (job.name.clone(), job.callback.clone()))
                .collect()
        };

        for (name, callback) in due {
            {
                let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
                if !running.insert(name.clone()) {
                    warn!(
                        "Cron job '{}' is still running from a previous fire. Skipping.",
                        name
                    );
                    continue;
                }
            }
            debug!("Firing cron job '{}'", name);
            let running = self.running.clone();
            tokio::spawn(async move {
                callback().await;
                let mut running = running.lock().unwrap_or_else(|e| e.into_inner());
                running.remove(&name);
            });
        }
    }

    /// Launch the minute loop on the runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let cron = Arc::clone(self);
        info!("Starting cron loop");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                cron.fire_matching(Utc::now());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, hour, minute, 0).unwrap()
    }

    #[test]
    fn test_schedule_minute_matching() {
        let schedule = Schedule::on_minute(30);
        assert!(schedule.matches(&at(0, 30)));
        assert!(schedule.matches(&at(17, 30)));
        assert!(!schedule.matches(&at(17, 31)));
    }

    #[test]
    fn test_schedule_compound_matching() {
        let schedule = Schedule {
            minute: Some(0),
            hour: Some(4),
            ..Default::default()
        };
        assert!(schedule.matches(&at(4, 0)));
        assert!(!schedule.matches(&at(5, 0)));
        assert!(!schedule.matches(&at(4, 1)));
    }

    #[test]
    fn test_empty_schedule_always_matches() {
        let schedule = Schedule::default();
        assert!(schedule.matches(&at(0, 0)));
        assert!(schedule.matches(&at(23, 59)));
    }

    #[tokio::test]
    async fn test_fire_matching_runs_due_jobs() {
        let cron = Cron::new();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = fired.clone();
        cron.register(CronJob::new(
            "job-a",
            "fires at minute 10",
            Schedule::on_minute(10),
            true,
            Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        ));
        let counter = fired.clone();
        cron.register(CronJob::new(
            "job-b",
            "fires at minute 20",
            Schedule::on_minute(20),
            true,
            Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        ));

        cron.fire_matching(at(9, 10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_jobs_do_not_fire() {
        let cron = Cron::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        cron.register(CronJob::new(
            "job-off",
            "disabled",
            Schedule::on_minute(10),
            false,
            Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        ));
        cron.fire_matching(at(9, 10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_overlapping_fires_are_suppressed() {
        let cron = Cron::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        cron.register(CronJob::new(
            "slow-job",
            "sleeps across fires",
            Schedule::on_minute(10),
            true,
            Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                })
            }),
        ));

        cron.fire_matching(at(9, 10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        // second fire lands while the first is still sleeping
        cron.fire_matching(at(10, 10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_job() {
        let cron = Cron::new();
        cron.register(CronJob::new(
            "job",
            "v1",
            Schedule::on_minute(1),
            true,
            Arc::new(|| Box::pin(async {})),
        ));
        cron.register(CronJob::new(
            "job",
            "v2",
            Schedule::on_minute(2),
            true,
            Arc::new(|| Box::pin(async {})),
        ));
        assert_eq!(cron.job_names().len(), 1);
    }
}
