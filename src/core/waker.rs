use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::core::brands::{Brand, BrandDirectory};

/// Spawns a detached pipeline run for one brand.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, brand: Brand) -> JoinHandle<()>;
}

/// Brand slug -> live worker task. All access goes through the internal
/// lock so overlapping ticks can never double-start a brand.
pub struct WorkerRegistry {
    inner: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Drops entries whose task finished or whose brand vanished from the
    /// latest poll. A dropped handle detaches; the task runs to completion.
    pub async fn reap(&self, live: &HashSet<String>) {
        let mut inner = self.inner.lock().await;
        inner.retain(|slug, handle| {
            let keep = !handle.is_finished() && live.contains(slug);
            if !keep {
                info!("Releasing worker slot for '{}'", slug);
            }
            keep
        });
    }

    /// Registers a worker for the slug unless a live one exists. The factory
    /// runs under the registry lock, making spawn-or-skip atomic.
    pub async fn spawn_if_absent<F>(&self, slug: &str, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.get(slug)
            && !handle.is_finished()
        {
            return false;
        }
        inner.insert(slug.to_string(), spawn());
        true
    }

    pub async fn running_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.values().filter(|h| !h.is_finished()).count()
    }
}

/// Next polling interval. Activity snaps back to the base cadence; a quiet
/// stretch beyond the threshold backs off multiplicatively up to the cap.
pub(crate) fn next_interval(
    current: Duration,
    had_activity: bool,
    since_activity: Duration,
    config: &SchedulerConfig,
) -> Duration {
    let base = Duration::from_secs(config.base_interval_secs);
    let min = Duration::from_secs(config.min_interval_secs);
    let max = Duration::from_secs(config.max_interval_secs);

    let next = if had_activity {
        base
    } else if since_activity > Duration::from_secs(config.activity_threshold_secs) {
        let scaled = current.as_secs_f64() * config.backoff_factor;
        Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
    } else {
        base
    };
    next.max(min)
}

/// The scheduler loop: polls live brands and keeps one worker per brand.
pub struct Waker {
    config: SchedulerConfig,
    directory: Arc<dyn BrandDirectory>,
    launcher: Arc<dyn WorkerLauncher>,
    registry: WorkerRegistry,
}

impl Waker {
    pub fn new(
        config: SchedulerConfig,
        directory: Arc<dyn BrandDirectory>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            directory,
            launcher,
            registry: WorkerRegistry::new(),
        }
    }

    /// One scheduling round. Returns how many workers were spawned.
    pub async fn tick(&self) -> usize {
        let brands = match self.directory.live_brands().await {
            Ok(brands) => brands,
            Err(e) => {
                warn!("Brand poll failed, treating as no brands this tick: {:#}", e);
                Vec::new()
            }
        };

        let live: HashSet<String> = brands.iter().map(|b| b.slug.clone()).collect();
        self.registry.reap(&live).await;

        let mut spawned = 0;
        for brand in brands {
            let slug = brand.slug.clone();
            let launcher = self.launcher.clone();
            if self
                .registry
                .spawn_if_absent(&slug, move || launcher.launch(brand))
                .await
            {
                info!("Spawned DJ worker for '{}'", slug);
                spawned += 1;
            } else {
                debug!("Worker for '{}' is still busy", slug);
            }
        }
        debug!("{} worker(s) registered", self.registry.running_count().await);
        spawned
    }

    /// Ticks until the shutdown token fires. Workers already launched are
    /// detached and drain on their own.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting waker (base interval {}s, backoff x{} up to {}s)",
            self.config.base_interval_secs, self.config.backoff_factor, self.config.max_interval_secs
        );
        let mut interval = Duration::from_secs(self.config.base_interval_secs);
        let mut last_activity = Instant::now();

        loop {
            debug!("Waker tick");
            let spawned = self.tick().await;
            let had_activity = spawned > 0;
            if had_activity {
                last_activity = Instant::now();
            }
            interval = next_interval(interval, had_activity, last_activity.elapsed(), &self.config);
            debug!("Sleeping for {}s", interval.as_secs());
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Waker stopping");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::brands::BrandStatus;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler_config() -> SchedulerConfig {
        SchedulerConfig {
            base_interval_secs: 180,
            min_interval_secs: 30,
            max_interval_secs: 300,
            backoff_factor: 1.5,
            activity_threshold_secs: 300,
        }
    }

    fn brand(slug: &str) -> Brand {
        Brand {
            slug: slug.to_string(),
            status: BrandStatus::OnLine,
            talkativity: None,
        }
    }

    struct ScriptedDirectory {
        rounds: Mutex<Vec<Result<Vec<Brand>>>>,
    }

    impl ScriptedDirectory {
        fn new(rounds: Vec<Result<Vec<Brand>>>) -> Self {
            Self {
                rounds: Mutex::new(rounds),
            }
        }
    }

    #[async_trait]
    impl BrandDirectory for ScriptedDirectory {
        async fn live_brands(&self) -> Result<Vec<Brand>> {
            let mut rounds = self.rounds.lock().await;
            if rounds.is_empty() {
                Ok(Vec::new())
            } else {
                rounds.remove(0)
            }
        }
    }

    struct SleepyLauncher {
        launches: AtomicUsize,
        work: Duration,
    }

    impl SleepyLauncher {
        fn new(work: Duration) -> Self {
            Self {
                launches: AtomicUsize::new(0),
                work,
            }
        }
    }

    impl WorkerLauncher for SleepyLauncher {
        fn launch(&self, _brand: Brand) -> JoinHandle<()> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let work = self.work;
            tokio::spawn(async move {
                tokio::time::sleep(work).await;
            })
        }
    }

    #[test]
    fn interval_resets_to_base_on_activity() {
        let config = scheduler_config();
        let next = next_interval(
            Duration::from_secs(270),
            true,
            Duration::from_secs(1000),
            &config,
        );
        assert_eq!(next, Duration::from_secs(180));
    }

    #[test]
    fn interval_stays_at_base_within_threshold() {
        let config = scheduler_config();
        let next = next_interval(
            Duration::from_secs(270),
            false,
            Duration::from_secs(100),
            &config,
        );
        assert_eq!(next, Duration::from_secs(180));
    }

    #[test]
    fn interval_backs_off_and_caps_when_quiet() {
        let config = scheduler_config();
        let mut interval = Duration::from_secs(config.base_interval_secs);
        let quiet = Duration::from_secs(config.activity_threshold_secs + 1);

        interval = next_interval(interval, false, quiet, &config);
        assert_eq!(interval, Duration::from_secs(270));

        // 270 * 1.5 = 405, capped at 300; stays pinned afterwards.
        interval = next_interval(interval, false, quiet, &config);
        assert_eq!(interval, Duration::from_secs(300));
        interval = next_interval(interval, false, quiet, &config);
        assert_eq!(interval, Duration::from_secs(300));
    }

    #[test]
    fn interval_never_drops_below_min() {
        let mut config = scheduler_config();
        config.base_interval_secs = 10;
        let next = next_interval(Duration::from_secs(10), true, Duration::ZERO, &config);
        assert_eq!(next, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn registry_single_flight_under_concurrency() {
        let registry = Arc::new(WorkerRegistry::new());
        let wins = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let registry = registry.clone();
            let wins = wins.clone();
            tasks.push(tokio::spawn(async move {
                let spawned = registry
                    .spawn_if_absent("aizoo", || {
                        tokio::spawn(async {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        })
                    })
                    .await;
                if spawned {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(registry.running_count().await, 1);
    }

    #[tokio::test]
    async fn registry_respawns_after_completion() {
        let registry = WorkerRegistry::new();

        assert!(registry.spawn_if_absent("aizoo", || tokio::spawn(async {})).await);
        // Give the no-op worker a moment to finish.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.spawn_if_absent("aizoo", || tokio::spawn(async {})).await);
    }

    #[tokio::test]
    async fn tick_skips_brands_with_busy_workers() {
        let directory = Arc::new(ScriptedDirectory::new(vec![
            Ok(vec![brand("aizoo"), brand("beta")]),
            Ok(vec![brand("aizoo"), brand("beta")]),
        ]));
        let launcher = Arc::new(SleepyLauncher::new(Duration::from_secs(5)));
        let waker = Waker::new(scheduler_config(), directory, launcher.clone());

        assert_eq!(waker.tick().await, 2);
        assert_eq!(waker.tick().await, 0);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn tick_survives_poll_failure() {
        let directory = Arc::new(ScriptedDirectory::new(vec![
            Err(anyhow::anyhow!("backend down")),
            Ok(vec![brand("aizoo")]),
        ]));
        let launcher = Arc::new(SleepyLauncher::new(Duration::from_secs(5)));
        let waker = Waker::new(scheduler_config(), directory, launcher);

        assert_eq!(waker.tick().await, 0);
        assert_eq!(waker.tick().await, 1);
    }

    #[tokio::test]
    async fn run_stops_once_shutdown_fires() {
        let directory = Arc::new(ScriptedDirectory::new(Vec::new()));
        let launcher = Arc::new(SleepyLauncher::new(Duration::from_millis(1)));
        let waker = Waker::new(scheduler_config(), directory, launcher);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        // One tick happens, then the loop must exit instead of sleeping.
        tokio::time::timeout(Duration::from_secs(5), waker.run(shutdown))
            .await
            .expect("waker ignored the shutdown token");
    }

    #[tokio::test]
    async fn tick_releases_depolled_brands() {
        let directory = Arc::new(ScriptedDirectory::new(vec![
            Ok(vec![brand("aizoo")]),
            Ok(Vec::new()),
            Ok(vec![brand("aizoo")]),
        ]));
        let launcher = Arc::new(SleepyLauncher::new(Duration::from_millis(10)));
        let waker = Waker::new(scheduler_config(), directory, launcher.clone());

        assert_eq!(waker.tick().await, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(waker.tick().await, 0);
        // The slot was released, so the brand's return spawns a fresh worker.
        assert_eq!(waker.tick().await, 1);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    }
}
