use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, Semaphore};

use crate::error::{AppError, Result};
use crate::services::providers::{Provider, ProviderRegistry};
use crate::services::queue::{Prepared, QueueEntry, Readiness};
use crate::utils::probe::Prober;

/// Makes an entry playable. At most one attempt per entry; concurrent callers
/// get the state of the attempt already in flight.
#[async_trait]
pub trait Prepare: Send + Sync {
    async fn prepare(&self, entry: &QueueEntry) -> Readiness;
}

pub struct Preparer {
    providers: Arc<ProviderRegistry>,
    prober: Arc<dyn Prober>,
    cache_dir: PathBuf,
    timeout: Duration,
    workers: Arc<Semaphore>,
    // One acquisition per cache path at a time
    acquiring: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Preparer {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        prober: Arc<dyn Prober>,
        cache_dir: PathBuf,
        timeout: Duration,
        workers: usize,
    ) -> Self {
        Self {
            providers,
            prober,
            cache_dir,
            timeout,
            workers: Arc::new(Semaphore::new(workers)),
            acquiring: DashMap::new(),
        }
    }

    /// Where a track's media lives once acquired.
    pub fn cache_path(&self, provider: &dyn Provider, entry: &QueueEntry) -> PathBuf {
        self.cache_dir.join(provider.cache_name(&entry.track))
    }

    async fn acquire(
        &self,
        provider: &dyn Provider,
        entry: &QueueEntry,
        dest: &Path,
    ) -> Result<()> {
        let lock = self.acquiring.entry(dest.to_path_buf()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.acquire_locked(provider, entry, dest).await
        };

        drop(lock);
        self.acquiring.remove_if(dest, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    async fn acquire_locked(
        &self,
        provider: &dyn Provider,
        entry: &QueueEntry,
        dest: &Path,
    ) -> Result<()> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            debug!("Cache hit for {}: {}", entry.track.uri, dest.display());
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let partial = dest.with_extension(format!("{}.part", entry.id));

        let acquisition = provider.acquire(&entry.track, &partial);
        let result = match tokio::time::timeout(self.timeout, acquisition).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout("acquisition")),
        };

        match result {
            Ok(()) => {
                tokio::fs::rename(&partial, dest).await?;
                Ok(())
            }
            Err(e) => {
                // Leftovers would be mistaken for a complete file next time
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }

    async fn run(&self, entry: &QueueEntry) -> Result<Prepared> {
        let provider = self.providers.for_uri(&entry.track.uri)?;
        let path = self.cache_path(provider.as_ref(), entry);

        {
            let _permit = self
                .workers
                .acquire()
                .await
                .map_err(|_| AppError::Provider("preparation pool closed".to_string()))?;
            self.acquire(provider.as_ref(), entry, &path).await?;
        }

        let info = {
            let _permit = self
                .workers
                .acquire()
                .await
                .map_err(|_| AppError::Provider("preparation pool closed".to_string()))?;
            self.prober.probe(&path).await
        };

        Ok(Prepared {
            path,
            duration: info.duration,
            loudness: info.loudness,
        })
    }
}

#[async_trait]
impl Prepare for Preparer {
    async fn prepare(&self, entry: &QueueEntry) -> Readiness {
        if !entry.try_start() {
            return entry.readiness();
        }

        match self.run(entry).await {
            Ok(prepared) => {
                info!(
                    "Prepared {} ({}s) at {}",
                    entry.track.title,
                    prepared.duration,
                    prepared.path.display()
                );
                entry.mark_ready(prepared);
                Readiness::Ready
            }
            Err(AppError::Timeout(what)) => {
                warn!("Preparing {} timed out during {}", entry.track.uri, what);
                entry.mark_failed();
                Readiness::Failed
            }
            Err(e) => {
                error!("Preparing {} failed: {}", entry.track.uri, e);
                entry.mark_failed();
                Readiness::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::models::track::ResolvedTrack;
    use crate::utils::probe::{Loudness, MediaInfo};

    struct FakeProvider {
        acquisitions: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn prefixes(&self) -> &'static [&'static str] {
            &["fake"]
        }

        async fn resolve(&self, uri: &str) -> Result<Vec<ResolvedTrack>> {
            Ok(vec![ResolvedTrack::new("fake", uri, uri)])
        }

        async fn acquire(&self, _track: &ResolvedTrack, dest: &Path) -> Result<()> {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AppError::Provider("boom".to_string()));
            }
            tokio::fs::write(dest, b"media").await?;
            Ok(())
        }
    }

    struct FixedProber;

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, _path: &Path) -> MediaInfo {
            MediaInfo {
                duration: 212,
                loudness: Loudness { max_volume: -2.0, mean_volume: -15.0 },
            }
        }
    }

    fn preparer(dir: &Path, provider: Arc<FakeProvider>, timeout: Duration) -> Preparer {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        Preparer::new(Arc::new(registry), Arc::new(FixedProber), dir.to_path_buf(), timeout, 4)
    }

    fn fake(delay: Duration, fail: bool) -> Arc<FakeProvider> {
        Arc::new(FakeProvider { acquisitions: AtomicUsize::new(0), delay, fail })
    }

    fn entry(uri: &str) -> Arc<QueueEntry> {
        QueueEntry::new(ResolvedTrack::new("fake", uri, uri))
    }

    #[tokio::test]
    async fn prepares_and_probes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fake(Duration::ZERO, false);
        let preparer = preparer(dir.path(), provider.clone(), Duration::from_secs(30));
        let e = entry("fake:one");

        assert_eq!(preparer.prepare(&e).await, Readiness::Ready);
        let prepared = e.prepared().unwrap();
        assert_eq!(prepared.duration, 212);
        assert_eq!(prepared.loudness.gain_db(), 2.0);
        assert_eq!(prepared.path, dir.path().join("fake-fake_one.audio"));
        assert!(prepared.path.exists());
    }

    #[tokio::test]
    async fn concurrent_calls_collapse_into_one_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fake(Duration::from_millis(20), false);
        let preparer = preparer(dir.path(), provider.clone(), Duration::from_secs(30));
        let e = entry("fake:two");

        let (first, second) = tokio::join!(preparer.prepare(&e), preparer.prepare(&e));
        assert_eq!(first, Readiness::Ready);
        assert_eq!(second, Readiness::Pending);
        assert_eq!(provider.acquisitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entries_for_the_same_track_share_one_download() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fake(Duration::from_millis(50), false);
        let preparer = preparer(dir.path(), provider.clone(), Duration::from_secs(30));
        let (a, b) = (entry("fake:same"), entry("fake:same"));

        let (first, second) = tokio::join!(preparer.prepare(&a), preparer.prepare(&b));
        assert_eq!(first, Readiness::Ready);
        assert_eq!(second, Readiness::Ready);
        assert_eq!(provider.acquisitions.load(Ordering::SeqCst), 1);
        assert_eq!(a.prepared().unwrap().path, b.prepared().unwrap().path);
        assert!(preparer.acquiring.is_empty());

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn existing_cache_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fake(Duration::ZERO, true);
        let preparer = preparer(dir.path(), provider.clone(), Duration::from_secs(30));
        tokio::fs::write(dir.path().join("fake-fake_cached.audio"), b"x").await.unwrap();

        assert_eq!(preparer.prepare(&entry("fake:cached")).await, Readiness::Ready);
        assert_eq!(provider.acquisitions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failure_marks_failed_and_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let preparer = preparer(dir.path(), fake(Duration::ZERO, true), Duration::from_secs(30));
        let e = entry("fake:bad");

        assert_eq!(preparer.prepare(&e).await, Readiness::Failed);
        assert_eq!(e.readiness(), Readiness::Failed);
        assert!(!dir.path().join("fake-fake_bad.audio").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_acquisition_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let provider = fake(Duration::from_secs(60), false);
        let preparer = preparer(dir.path(), provider, Duration::from_secs(30));
        let e = entry("fake:slow");

        assert_eq!(preparer.prepare(&e).await, Readiness::Failed);
        assert!(e.prepared().is_none());
    }

    #[tokio::test]
    async fn unknown_prefix_fails() {
        let dir = tempfile::tempdir().unwrap();
        let preparer = preparer(dir.path(), fake(Duration::ZERO, false), Duration::from_secs(30));
        assert_eq!(preparer.prepare(&entry("nope:x")).await, Readiness::Failed);
    }
}
