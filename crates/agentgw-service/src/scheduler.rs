//! Cron-driven job scheduler.
//!
//! Jobs are declared in configuration and evaluated against wall-clock time
//! once a second. A due job runs `Service::run` in the background; a job
//! whose previous run is still in flight is skipped with a log entry, never
//! queued. Missed firings while the process was down are not backfilled;
//! `next_run` is always computed from now.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::error::{Result, ServiceError};

/// A scheduled job declaration from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Unique job name; also the log file prefix.
    pub name: String,

    /// The skill to run.
    pub skill: String,

    /// The message handed to the skill on each firing.
    pub message: String,

    /// Cron expression. Standard 5-field input is accepted and normalized.
    pub cron: String,

    /// Disabled jobs never fire.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Write each run's output to `<name>-<timestamp>.log` in the log
    /// directory.
    #[serde(default)]
    pub log_output: bool,
}

fn default_enabled() -> bool {
    true
}

/// Executes one job firing. Implemented by the service.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    /// Run `message` against `skill` to completion and return the final
    /// text.
    async fn run_job(&self, skill: &str, message: &str) -> Result<String>;
}

/// Point-in-time view of one job for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub skill: String,
    pub cron: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub in_flight: bool,
}

struct JobState {
    config: JobConfig,
    schedule: cron::Schedule,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
    in_flight: Arc<AtomicBool>,
}

/// Normalize a cron expression to the 6/7-field format the `cron` crate
/// expects, by prepending a seconds field to 5-field input.
fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_schedule(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron_expr(expr)).map_err(|e| ServiceError::Config {
        reason: format!("invalid cron expression `{expr}`: {e}"),
    })
}

fn next_run_after(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Background scheduler over the configured jobs.
pub struct Scheduler {
    jobs: Arc<RwLock<Vec<JobState>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    tick: Duration,
}

impl Scheduler {
    /// Build a scheduler from config. An invalid cron expression is a fatal
    /// configuration error.
    pub fn new(configs: Vec<JobConfig>) -> Result<Self> {
        let now = Utc::now();
        let mut jobs = Vec::with_capacity(configs.len());
        for config in configs {
            let schedule = parse_schedule(&config.cron)?;
            let next_run = next_run_after(&schedule, now);
            info!(job = %config.name, cron = %config.cron, enabled = config.enabled, "job registered");
            jobs.push(JobState {
                config,
                schedule,
                last_run: None,
                next_run,
                in_flight: Arc::new(AtomicBool::new(false)),
            });
        }

        Ok(Self {
            jobs: Arc::new(RwLock::new(jobs)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            tick: Duration::from_secs(1),
        })
    }

    /// Shrink the tick interval. Tests only.
    #[cfg(test)]
    fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Number of registered jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Snapshot of every job for status reporting.
    pub async fn jobs(&self) -> Vec<JobStatus> {
        self.jobs
            .read()
            .await
            .iter()
            .map(|j| JobStatus {
                name: j.config.name.clone(),
                skill: j.config.skill.clone(),
                cron: j.config.cron.clone(),
                enabled: j.config.enabled,
                last_run: j.last_run,
                next_run: j.next_run,
                in_flight: j.in_flight.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Whether the background loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the tick loop. Due jobs run through `runner` in the background;
    /// output lands in `log_dir` for jobs with `log_output`.
    pub fn start<R: JobRunner>(&self, runner: Arc<R>, log_dir: PathBuf) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::Startup {
                reason: "scheduler is already running".into(),
            });
        }

        std::fs::create_dir_all(&log_dir).map_err(|e| ServiceError::Startup {
            reason: format!("cannot create log directory {}: {e}", log_dir.display()),
        })?;

        let jobs = Arc::clone(&self.jobs);
        let running = Arc::clone(&self.running);
        let tick = self.tick;

        let handle = tokio::spawn(async move {
            info!("scheduler started");

            while running.load(Ordering::SeqCst) {
                let now = Utc::now();
                {
                    let mut job_list = jobs.write().await;
                    for job in job_list.iter_mut() {
                        if !job.config.enabled {
                            continue;
                        }
                        let due = job.next_run.is_some_and(|next| next <= now);
                        if !due {
                            continue;
                        }

                        job.next_run = next_run_after(&job.schedule, now);

                        if job.in_flight.swap(true, Ordering::SeqCst) {
                            // Previous firing still running: skip, never queue.
                            warn!(job = %job.config.name, "previous run still in flight, skipping firing");
                            continue;
                        }

                        job.last_run = Some(now);
                        debug!(job = %job.config.name, "job fired");

                        let runner = Arc::clone(&runner);
                        let in_flight = Arc::clone(&job.in_flight);
                        let config = job.config.clone();
                        let log_dir = log_dir.clone();
                        let fired_at = now;

                        tokio::spawn(async move {
                            let result = runner.run_job(&config.skill, &config.message).await;
                            match result {
                                Ok(output) => {
                                    info!(job = %config.name, "job completed");
                                    if config.log_output {
                                        write_job_log(&log_dir, &config.name, fired_at, &output)
                                            .await;
                                    }
                                }
                                Err(e) => {
                                    error!(job = %config.name, error = %e, "job failed");
                                }
                            }
                            in_flight.store(false, Ordering::SeqCst);
                        });
                    }
                }

                tokio::time::sleep(tick).await;
            }

            info!("scheduler stopped");
        });

        *self.handle.lock().expect("scheduler handle lock poisoned") = Some(handle);
        Ok(())
    }

    /// Stop the tick loop and wait for it to exit. In-flight job runs are
    /// left to finish on their own.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .handle
            .lock()
            .expect("scheduler handle lock poisoned")
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(error = %e, "scheduler task panicked during shutdown");
        }
    }
}

/// Write one job run's output to `<name>-<timestamp>.log`.
async fn write_job_log(log_dir: &std::path::Path, name: &str, fired_at: DateTime<Utc>, output: &str) {
    let filename = format!("{name}-{}.log", fired_at.format("%Y%m%d%H%M%S"));
    let path = log_dir.join(filename);
    if let Err(e) = tokio::fs::write(&path, output).await {
        error!(path = %path.display(), error = %e, "failed to write job log");
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingRunner {
        hits: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run_job(&self, _skill: &str, message: &str) -> Result<String> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(format!("ran: {message}"))
        }
    }

    fn every_second_job(name: &str, log_output: bool) -> JobConfig {
        JobConfig {
            name: name.into(),
            skill: "reporter".into(),
            message: "tick".into(),
            cron: "* * * * * *".into(),
            enabled: true,
            log_output,
        }
    }

    #[test]
    fn five_field_expressions_are_normalized() {
        assert_eq!(normalize_cron_expr("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron_expr("0 12 * * * *"), "0 12 * * * *");
        assert!(parse_schedule("30 9 * * 1-5").is_ok());
        assert!(parse_schedule("0 30 9 * * 1-5").is_ok());
    }

    #[test]
    fn invalid_cron_is_a_config_error() {
        let result = Scheduler::new(vec![JobConfig {
            name: "bad".into(),
            skill: "s".into(),
            message: "m".into(),
            cron: "not a cron".into(),
            enabled: true,
            log_output: false,
        }]);
        assert!(matches!(result, Err(ServiceError::Config { .. })));
    }

    #[tokio::test]
    async fn next_run_is_computed_at_registration() {
        let scheduler = Scheduler::new(vec![every_second_job("j", false)]).unwrap();
        let jobs = scheduler.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].next_run.is_some());
        assert!(jobs[0].last_run.is_none());
    }

    #[tokio::test]
    async fn due_jobs_fire_and_write_logs() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(CountingRunner {
            hits: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });

        let scheduler = Scheduler::new(vec![every_second_job("logged", true)])
            .unwrap()
            .with_tick(Duration::from_millis(100));
        scheduler
            .start(Arc::clone(&runner), dir.path().to_path_buf())
            .unwrap();

        // An every-second job must fire at least once within ~2.5s.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        scheduler.stop().await;

        assert!(runner.hits.load(Ordering::SeqCst) >= 1);

        // Give the detached run a moment to write its log.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let logs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("logged-") && n.ends_with(".log"))
            .collect();
        assert!(!logs.is_empty(), "expected a job log file");

        let content = std::fs::read_to_string(dir.path().join(&logs[0])).unwrap();
        assert_eq!(content, "ran: tick");

        let jobs = scheduler.jobs().await;
        assert!(jobs[0].last_run.is_some());
    }

    #[tokio::test]
    async fn overlapping_firings_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        // Each run takes 2.5s; the job is due every second.
        let runner = Arc::new(CountingRunner {
            hits: AtomicUsize::new(0),
            delay: Duration::from_millis(2500),
        });

        let scheduler = Scheduler::new(vec![every_second_job("slow", false)])
            .unwrap()
            .with_tick(Duration::from_millis(100));
        scheduler
            .start(Arc::clone(&runner), dir.path().to_path_buf())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(3200)).await;
        scheduler.stop().await;

        // Without the overlap guard this would be 3+.
        let hits = runner.hits.load(Ordering::SeqCst);
        assert!(
            (1..=2).contains(&hits),
            "expected overlapping firings to be skipped, saw {hits}"
        );
    }

    #[tokio::test]
    async fn disabled_jobs_never_fire() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(CountingRunner {
            hits: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });

        let mut job = every_second_job("off", false);
        job.enabled = false;

        let scheduler = Scheduler::new(vec![job])
            .unwrap()
            .with_tick(Duration::from_millis(100));
        scheduler
            .start(Arc::clone(&runner), dir.path().to_path_buf())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        scheduler.stop().await;

        assert_eq!(runner.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(CountingRunner {
            hits: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });

        let scheduler = Scheduler::new(vec![]).unwrap();
        scheduler
            .start(Arc::clone(&runner), dir.path().to_path_buf())
            .unwrap();
        assert!(scheduler.is_running());
        assert!(scheduler.start(runner, dir.path().to_path_buf()).is_err());
        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }
}
