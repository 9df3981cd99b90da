//! A content-addressed, on-disk cache for function responses.
//!
//! Wraps any [`FunctionRunner`] and serves prior responses keyed by
//! `(function name, request tag)` while their declared TTL lasts. Cache
//! failures never fail the wrapped call; at worst the function runs again.

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prost::Message as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics::CacheMetrics;
use crate::proto::{CachedRunFunctionResponse, RunFunctionRequest, RunFunctionResponse};
use crate::runner::{Error, FunctionRunner};

/// What one garbage collection sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Entries removed.
    pub deleted: u64,
    /// Bytes removed.
    pub deleted_bytes: u64,
}

/// A [`FunctionRunner`] decorator that caches responses on disk.
///
/// Entries live at `<root>/<function>/<tag>` and are written atomically via
/// a temp file and rename, so a concurrent reader sees either the old entry
/// or the new one, never a torn one.
pub struct FileBackedRunner<R> {
    inner: R,
    root: PathBuf,
    max_ttl: Option<Duration>,
    metrics: CacheMetrics,
}

impl<R> FileBackedRunner<R> {
    /// Cache responses of `inner` under `root`.
    pub fn new(inner: R, root: impl Into<PathBuf>, metrics: CacheMetrics) -> Self {
        Self {
            inner,
            root: root.into(),
            max_ttl: None,
            metrics,
        }
    }

    /// Clamp every TTL a function declares to at most `max_ttl`.
    #[must_use]
    pub fn with_max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = Some(max_ttl);
        self
    }

    fn entry_path(&self, function: &str, tag: &str) -> PathBuf {
        self.root
            .join(filesystem_safe(function))
            .join(filesystem_safe(tag))
    }

    async fn read_fresh(&self, function: &str, tag: &str) -> Option<RunFunctionResponse> {
        let timer = self.metrics.time_read(function);
        let bytes = match tokio::fs::read(self.entry_path(function, tag)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                drop(timer);
                return None;
            }
            Err(e) => {
                warn!(function, tag, error = %e, "failed to read cache entry");
                self.metrics.error(function);
                drop(timer);
                return None;
            }
        };
        drop(timer);
        let entry = match CachedRunFunctionResponse::decode(bytes.as_slice()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(function, tag, error = %e, "undecodable cache entry");
                self.metrics.error(function);
                return None;
            }
        };
        if !is_fresh(&entry, Utc::now()) {
            return None;
        }
        entry.response
    }

    async fn write_entry(
        &self,
        function: &str,
        tag: &str,
        rsp: &RunFunctionResponse,
        ttl: Duration,
    ) -> std::io::Result<u64> {
        let timer = self.metrics.time_write(function);
        let deadline = Utc::now() + ttl;
        let entry = CachedRunFunctionResponse {
            deadline: Some(prost_types::Timestamp {
                seconds: deadline.timestamp(),
                nanos: deadline.timestamp_subsec_nanos() as i32,
            }),
            response: Some(rsp.clone()),
        };
        let bytes = entry.encode_to_vec();
        let len = bytes.len() as u64;

        let dir = self.root.join(filesystem_safe(function));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(filesystem_safe(tag));
        tokio::task::spawn_blocking(move || {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
        drop(timer);
        Ok(len)
    }

    /// Remove every expired entry, then every empty per-function directory.
    ///
    /// Losing a race against a concurrent writer can delete a just-renewed
    /// entry; that only costs a function re-run, so no locking is done.
    pub async fn garbage_collect(&self) -> std::io::Result<GcStats> {
        let mut stats = GcStats::default();
        let now = Utc::now();
        let mut dirs = match tokio::fs::read_dir(&self.root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e),
        };
        while let Some(dir) = dirs.next_entry().await? {
            if !dir.file_type().await?.is_dir() {
                continue;
            }
            let function = dir.file_name().to_string_lossy().into_owned();
            let mut remaining: u64 = 0;
            let mut entries = tokio::fs::read_dir(dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let keep = match tokio::fs::read(&path).await {
                    Ok(bytes) => CachedRunFunctionResponse::decode(bytes.as_slice())
                        .map(|cached| is_fresh(&cached, now))
                        .unwrap_or(false),
                    Err(_) => false,
                };
                if keep {
                    remaining += 1;
                    continue;
                }
                let bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        stats.deleted += 1;
                        stats.deleted_bytes += bytes;
                        self.metrics.deleted(&function, bytes);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(function, path = %path.display(), error = %e, "failed to delete cache entry");
                        self.metrics.error(&function);
                        remaining += 1;
                    }
                }
            }
            if remaining == 0 {
                // A concurrent write may repopulate the directory first;
                // removal simply fails and the directory stays.
                let _ = tokio::fs::remove_dir(dir.path()).await;
            }
        }
        Ok(stats)
    }

    /// Garbage collect every `every` until `cancel` fires.
    pub async fn run_garbage_collector(&self, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {
                    match self.garbage_collect().await {
                        Ok(stats) if stats.deleted > 0 => {
                            debug!(deleted = stats.deleted, bytes = stats.deleted_bytes, "cache swept");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "cache sweep failed"),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<R: FunctionRunner> FunctionRunner for FileBackedRunner<R> {
    async fn run_function(
        &self,
        function: &str,
        req: RunFunctionRequest,
    ) -> Result<RunFunctionResponse, Error> {
        let tag = req.meta.as_ref().map(|m| m.tag.clone()).unwrap_or_default();
        if tag.is_empty() {
            // Untagged requests are uncacheable either way.
            return self.inner.run_function(function, req).await;
        }

        if let Some(cached) = self.read_fresh(function, &tag).await {
            self.metrics.hit(function);
            return Ok(cached);
        }
        self.metrics.miss(function);

        let rsp = self.inner.run_function(function, req).await?;

        let Some(ttl) = rsp
            .meta
            .as_ref()
            .and_then(|m| m.ttl.as_ref())
            .and_then(proto_duration)
        else {
            return Ok(rsp);
        };
        let ttl = match self.max_ttl {
            Some(max) => ttl.min(max),
            None => ttl,
        };
        match self.write_entry(function, &tag, &rsp, ttl).await {
            Ok(bytes) => self.metrics.wrote(function, bytes),
            Err(e) => {
                warn!(function, tag, error = %e, "failed to write cache entry");
                self.metrics.error(function);
            }
        }
        Ok(rsp)
    }
}

fn is_fresh(entry: &CachedRunFunctionResponse, now: DateTime<Utc>) -> bool {
    let Some(deadline) = &entry.deadline else {
        return false;
    };
    match DateTime::from_timestamp(deadline.seconds, deadline.nanos.unsigned_abs()) {
        Some(deadline) => now < deadline,
        None => false,
    }
}

/// A positive std duration, or `None` for zero/negative/absent ones.
fn proto_duration(d: &prost_types::Duration) -> Option<Duration> {
    if d.seconds < 0 || d.nanos < 0 || (d.seconds == 0 && d.nanos == 0) {
        return None;
    }
    Some(Duration::new(d.seconds as u64, d.nanos as u32))
}

/// Keep cache keys from escaping their directory. Function names and tags
/// are DNS labels and hex respectively, so this is normally the identity.
fn filesystem_safe(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::{RequestMeta, ResponseMeta, State};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A runner that counts invocations and returns a canned response.
    struct CountingRunner {
        calls: Arc<AtomicUsize>,
        rsp: RunFunctionResponse,
    }

    #[async_trait]
    impl FunctionRunner for CountingRunner {
        async fn run_function(
            &self,
            _function: &str,
            _req: RunFunctionRequest,
        ) -> Result<RunFunctionResponse, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rsp.clone())
        }
    }

    fn tagged(tag: &str) -> RunFunctionRequest {
        RunFunctionRequest {
            meta: Some(RequestMeta {
                tag: tag.to_string(),
            }),
            ..Default::default()
        }
    }

    fn respond_with_ttl(seconds: i64) -> RunFunctionResponse {
        RunFunctionResponse {
            meta: Some(ResponseMeta {
                tag: String::new(),
                ttl: (seconds > 0).then_some(prost_types::Duration { seconds, nanos: 0 }),
            }),
            desired: Some(State::default()),
            ..Default::default()
        }
    }

    fn cache(
        rsp: RunFunctionResponse,
        root: &Path,
    ) -> (FileBackedRunner<CountingRunner>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let runner = CountingRunner {
            calls: calls.clone(),
            rsp,
        };
        (
            FileBackedRunner::new(runner, root, CacheMetrics::unregistered()),
            calls,
        )
    }

    #[tokio::test]
    async fn miss_write_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, calls) = cache(respond_with_ttl(1800), dir.path());

        let first = cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dir.path().join("fn-a").join("TAG").is_file());

        let bytes_before = std::fs::read(dir.path().join("fn-a").join("TAG")).unwrap();
        let second = cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call must be a hit");
        assert_eq!(first, second);
        let bytes_after = std::fs::read(dir.path().join("fn-a").join("TAG")).unwrap();
        assert_eq!(bytes_before, bytes_after, "hits must not rewrite entries");
        assert_eq!(cache.metrics.hit_count("fn-a"), 1);
        assert_eq!(cache.metrics.miss_count("fn-a"), 1);
    }

    #[tokio::test]
    async fn preseeded_entries_are_served() {
        let dir = tempfile::tempdir().unwrap();
        let rsp = respond_with_ttl(3600);
        let deadline = Utc::now() + Duration::from_secs(3600);
        let entry = CachedRunFunctionResponse {
            deadline: Some(prost_types::Timestamp {
                seconds: deadline.timestamp(),
                nanos: 0,
            }),
            response: Some(rsp.clone()),
        };
        std::fs::create_dir_all(dir.path().join("fn-a")).unwrap();
        std::fs::write(dir.path().join("fn-a").join("TAG"), entry.encode_to_vec()).unwrap();

        let (cache, calls) = cache(respond_with_ttl(1), dir.path());
        let got = cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        assert_eq!(got, rsp);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "wrapped runner must not run");
        assert_eq!(cache.metrics.hit_count("fn-a"), 1);
    }

    #[tokio::test]
    async fn empty_tags_bypass_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, calls) = cache(respond_with_ttl(1800), dir.path());

        cache
            .run_function("fn-a", RunFunctionRequest::default())
            .await
            .unwrap();
        cache
            .run_function("fn-a", RunFunctionRequest::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!dir.path().join("fn-a").exists(), "nothing may be written");
        assert_eq!(cache.metrics.hit_count("fn-a"), 0);
    }

    #[tokio::test]
    async fn zero_ttl_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, calls) = cache(respond_with_ttl(0), dir.path());

        cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!dir.path().join("fn-a").join("TAG").exists());
    }

    #[tokio::test]
    async fn ttl_is_clamped_to_the_configured_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = cache(respond_with_ttl(3600), dir.path());
        let cache = cache.with_max_ttl(Duration::from_secs(1));

        cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        let bytes = std::fs::read(dir.path().join("fn-a").join("TAG")).unwrap();
        let entry = CachedRunFunctionResponse::decode(bytes.as_slice()).unwrap();
        let deadline =
            DateTime::from_timestamp(entry.deadline.unwrap().seconds, 0).unwrap();
        assert!(deadline <= Utc::now() + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let dir = tempfile::tempdir().unwrap();
        let entry = CachedRunFunctionResponse {
            deadline: Some(prost_types::Timestamp {
                seconds: (Utc::now() - Duration::from_secs(60)).timestamp(),
                nanos: 0,
            }),
            response: Some(respond_with_ttl(1)),
        };
        std::fs::create_dir_all(dir.path().join("fn-a")).unwrap();
        std::fs::write(dir.path().join("fn-a").join("TAG"), entry.encode_to_vec()).unwrap();

        let (cache, calls) = cache(respond_with_ttl(0), dir.path());
        cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "expired entry must re-invoke");
    }

    #[tokio::test]
    async fn corrupt_entries_are_misses_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("fn-a")).unwrap();
        std::fs::write(dir.path().join("fn-a").join("TAG"), b"not proto").unwrap();

        let (cache, calls) = cache(respond_with_ttl(0), dir.path());
        cache.run_function("fn-a", tagged("TAG")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.metrics.error_count("fn-a"), 1);
    }

    #[tokio::test]
    async fn gc_removes_expired_entries_and_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let expired = CachedRunFunctionResponse {
            deadline: Some(prost_types::Timestamp {
                seconds: (Utc::now() - Duration::from_secs(60)).timestamp(),
                nanos: 0,
            }),
            response: None,
        };
        let fresh = CachedRunFunctionResponse {
            deadline: Some(prost_types::Timestamp {
                seconds: (Utc::now() + Duration::from_secs(3600)).timestamp(),
                nanos: 0,
            }),
            response: None,
        };
        std::fs::create_dir_all(dir.path().join("fn-old")).unwrap();
        std::fs::write(
            dir.path().join("fn-old").join("A"),
            expired.encode_to_vec(),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("fn-new")).unwrap();
        std::fs::write(dir.path().join("fn-new").join("B"), fresh.encode_to_vec()).unwrap();
        std::fs::write(dir.path().join("fn-new").join("C"), b"garbage").unwrap();

        let (cache, _) = cache(respond_with_ttl(0), dir.path());
        let stats = cache.garbage_collect().await.unwrap();
        assert_eq!(stats.deleted, 2);
        assert!(!dir.path().join("fn-old").exists(), "emptied dirs go away");
        assert!(dir.path().join("fn-new").join("B").is_file());
        assert!(!dir.path().join("fn-new").join("C").exists());
    }

    #[tokio::test]
    async fn the_collector_sweeps_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let expired = CachedRunFunctionResponse {
            deadline: Some(prost_types::Timestamp {
                seconds: (Utc::now() - Duration::from_secs(60)).timestamp(),
                nanos: 0,
            }),
            response: None,
        };
        std::fs::create_dir_all(dir.path().join("fn-a")).unwrap();
        std::fs::write(dir.path().join("fn-a").join("A"), expired.encode_to_vec()).unwrap();

        let (cache, _) = cache(respond_with_ttl(0), dir.path());
        let cache = Arc::new(cache);
        let cancel = CancellationToken::new();
        let collector = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cache
                    .run_garbage_collector(Duration::from_millis(10), cancel)
                    .await;
            })
        };

        // Wait for a sweep to land, then stop the loop.
        for _ in 0..100 {
            if !dir.path().join("fn-a").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dir.path().join("fn-a").exists());
        cancel.cancel();
        collector.await.unwrap();
    }

    #[test]
    fn unsafe_key_components_are_rewritten() {
        assert_eq!(filesystem_safe("fn-a"), "fn-a");
        assert_eq!(filesystem_safe("../../etc"), ".._.._etc");
    }
}
