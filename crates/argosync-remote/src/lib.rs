//! Remote catalog clients: list the floats published by a data assembly centre
//! and fetch their files.
//!
//! Three implementations share the [`RemoteCatalog`] contract: [`HttpRemote`]
//! for the public GDAC HTTP mirror, [`MirrorRemote`] for a local copy of the
//! same tree, and [`MemoryRemote`] with scriptable faults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use argosync_core::{FileKind, Fingerprint, RemoteError};
use argosync_storage::{HttpFetcher, RetryError, RetryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use futures::stream::{self, StreamExt};
use scraper::{Html, Selector};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "argosync-remote";

#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Data assembly centre this client reads from, e.g. `incois`.
    fn dac(&self) -> &str;

    /// Keys of every float directory currently published.
    async fn list_keys(&self) -> Result<Vec<String>, RemoteError>;

    async fn fetch_payload(&self, key: &str, kind: FileKind) -> Result<Bytes, RemoteError>;
}

/// One float as seen by the remote listing. A fingerprint that could not be
/// determined is kept as the error so the detector can skip the float.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteListing {
    pub key: String,
    pub fingerprint: Result<Fingerprint, RemoteError>,
}

/// List every float and fingerprint its core metadata file.
///
/// Failing to list the directory is an error for the whole run; failing to read
/// one float's metadata is recorded in that float's listing.
///
/// Once `shutdown` is set no further request is started: floats not yet
/// fingerprinted are left out of the result and in-flight fetches finish.
pub async fn list_entities(
    remote: &dyn RemoteCatalog,
    policy: &RetryPolicy,
    concurrency: usize,
    shutdown: &watch::Receiver<bool>,
) -> Result<Vec<RemoteListing>, RetryError> {
    if *shutdown.borrow() {
        info!(dac = remote.dac(), "shutdown requested, remote not listed");
        return Ok(Vec::new());
    }

    let label = format!("{} directory listing", remote.dac());
    let keys = policy
        .run(&label, &policy.budget(), move || remote.list_keys())
        .await?
        .value;
    info!(dac = remote.dac(), floats = keys.len(), "remote directory listed");

    let total = keys.len();
    let mut listings = stream::iter(keys)
        .take_while(|_| future::ready(!*shutdown.borrow()))
        .map(move |key| async move {
            let budget = policy.budget();
            let key_ref = key.as_str();
            let label = format!("{}/{}", key, FileKind::Meta.file_name(&key));
            let fingerprint = policy
                .run(&label, &budget, move || {
                    remote.fetch_payload(key_ref, FileKind::Meta)
                })
                .await
                .map(|meta| Fingerprint::of_bytes(&meta.value))
                .map_err(|err| {
                    warn!(key = key_ref, error = %err, "cannot fingerprint float");
                    err.last_error().clone()
                });
            RemoteListing { key, fingerprint }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;
    if listings.len() < total {
        warn!(
            dac = remote.dac(),
            skipped = total - listings.len(),
            "shutdown requested, remaining floats not fingerprinted"
        );
    }
    listings.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(listings)
}

fn is_float_key(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_digit())
}

/// Extract float directory names from an HTML directory index.
pub fn parse_directory_index(html: &str) -> Result<Vec<String>, String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").map_err(|e| e.to_string())?;
    let mut keys = document
        .select(&selector)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| href.ends_with('/'))
        .filter_map(|href| {
            let trimmed = href.trim_end_matches('/');
            let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
            is_float_key(name).then(|| name.to_string())
        })
        .collect::<Vec<_>>();
    keys.sort();
    keys.dedup();
    Ok(keys)
}

/// The public GDAC tree served over HTTP: `<base>/<dac>/<key>/<key>_<kind>.nc`.
#[derive(Debug)]
pub struct HttpRemote {
    base_url: String,
    dac: String,
    http: HttpFetcher,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, dac: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dac: dac.into(),
            http,
        }
    }

    pub fn dac_url(&self) -> String {
        format!("{}/{}/", self.base_url, self.dac)
    }

    pub fn file_url(&self, key: &str, kind: FileKind) -> String {
        format!("{}{}/{}", self.dac_url(), key, kind.file_name(key))
    }
}

#[async_trait]
impl RemoteCatalog for HttpRemote {
    fn dac(&self) -> &str {
        &self.dac
    }

    async fn list_keys(&self) -> Result<Vec<String>, RemoteError> {
        let url = self.dac_url();
        let html = self.http.get_text(&url).await?;
        parse_directory_index(&html).map_err(|detail| RemoteError::Protocol { path: url, detail })
    }

    async fn fetch_payload(&self, key: &str, kind: FileKind) -> Result<Bytes, RemoteError> {
        self.http.get_bytes(&self.file_url(key, kind)).await
    }
}

/// A local copy of the GDAC tree, e.g. produced by rsync.
#[derive(Debug, Clone)]
pub struct MirrorRemote {
    root: PathBuf,
    dac: String,
}

impl MirrorRemote {
    pub fn new(root: impl Into<PathBuf>, dac: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            dac: dac.into(),
        }
    }

    fn io_error(path: &std::path::Path, err: std::io::Error) -> RemoteError {
        let path = path.display().to_string();
        if err.kind() == std::io::ErrorKind::NotFound {
            RemoteError::NotFound { path }
        } else {
            RemoteError::Unavailable {
                path,
                detail: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl RemoteCatalog for MirrorRemote {
    fn dac(&self) -> &str {
        &self.dac
    }

    async fn list_keys(&self) -> Result<Vec<String>, RemoteError> {
        let dir = self.root.join(&self.dac);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Self::io_error(&dir, e))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && is_float_key(&name) {
                keys.push(name);
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn fetch_payload(&self, key: &str, kind: FileKind) -> Result<Bytes, RemoteError> {
        let path = self.root.join(&self.dac).join(key).join(kind.file_name(key));
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| Self::io_error(&path, e))
    }
}

#[derive(Debug, Clone)]
struct FaultPlan {
    error: RemoteError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<(String, FileKind), Bytes>,
    faults: BTreeMap<(String, FileKind), FaultPlan>,
    fetches: BTreeMap<(String, FileKind), usize>,
    listing_fault: Option<FaultPlan>,
}

/// In-process remote with scriptable failures.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    dac: String,
    state: Mutex<MemoryState>,
}

impl MemoryRemote {
    pub fn new(dac: impl Into<String>) -> Self {
        Self {
            dac: dac.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn put(&self, key: &str, kind: FileKind, bytes: impl Into<Bytes>) {
        self.state()
            .files
            .insert((key.to_string(), kind), bytes.into());
    }

    pub fn remove(&self, key: &str, kind: FileKind) {
        self.state().files.remove(&(key.to_string(), kind));
    }

    /// Fail the next `times` fetches of this file with `error`.
    pub fn fail_times(&self, key: &str, kind: FileKind, error: RemoteError, times: usize) {
        self.state().faults.insert(
            (key.to_string(), kind),
            FaultPlan {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn fail_always(&self, key: &str, kind: FileKind, error: RemoteError) {
        self.state().faults.insert(
            (key.to_string(), kind),
            FaultPlan {
                error,
                remaining: None,
            },
        );
    }

    pub fn fail_listing(&self, error: RemoteError) {
        self.state().listing_fault = Some(FaultPlan {
            error,
            remaining: None,
        });
    }

    pub fn clear_faults(&self) {
        let mut state = self.state();
        state.faults.clear();
        state.listing_fault = None;
    }

    pub fn fetch_count(&self, key: &str, kind: FileKind) -> usize {
        self.state()
            .fetches
            .get(&(key.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    /// Fetches of profile payloads, i.e. excluding metadata reads made while listing.
    pub fn payload_fetches(&self) -> usize {
        self.state()
            .fetches
            .iter()
            .filter(|((_, kind), _)| *kind != FileKind::Meta)
            .map(|(_, n)| *n)
            .sum()
    }

    fn take_fault(plan: &mut Option<FaultPlan>) -> Option<RemoteError> {
        let current = plan.as_mut()?;
        match current.remaining {
            None => Some(current.error.clone()),
            Some(0) => {
                *plan = None;
                None
            }
            Some(n) => {
                current.remaining = Some(n - 1);
                Some(current.error.clone())
            }
        }
    }
}

#[async_trait]
impl RemoteCatalog for MemoryRemote {
    fn dac(&self) -> &str {
        &self.dac
    }

    async fn list_keys(&self) -> Result<Vec<String>, RemoteError> {
        let mut state = self.state();
        if let Some(err) = Self::take_fault(&mut state.listing_fault) {
            return Err(err);
        }
        let mut keys = state
            .files
            .keys()
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        keys.dedup();
        Ok(keys)
    }

    async fn fetch_payload(&self, key: &str, kind: FileKind) -> Result<Bytes, RemoteError> {
        let id = (key.to_string(), kind);
        let mut state = self.state();
        *state.fetches.entry(id.clone()).or_default() += 1;

        let mut plan = state.faults.remove(&id);
        let fault = Self::take_fault(&mut plan);
        if let Some(plan) = plan {
            state.faults.insert(id.clone(), plan);
        }
        if let Some(err) = fault {
            debug!(key, %kind, error = %err, "injected remote fault");
            return Err(err);
        }

        state
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound {
                path: format!("{}/{}/{}", self.dac, key, kind.file_name(key)),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            unavailable_base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            attempt_timeout: Some(Duration::from_secs(1)),
            total_budget: Duration::from_secs(5),
        }
    }

    fn running() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    /// Requests shutdown from inside the `stop_after`-th metadata fetch.
    struct InterruptedRemote {
        inner: MemoryRemote,
        stop: watch::Sender<bool>,
        stop_after: usize,
        fetched: Mutex<usize>,
    }

    #[async_trait]
    impl RemoteCatalog for InterruptedRemote {
        fn dac(&self) -> &str {
            self.inner.dac()
        }

        async fn list_keys(&self) -> Result<Vec<String>, RemoteError> {
            self.inner.list_keys().await
        }

        async fn fetch_payload(&self, key: &str, kind: FileKind) -> Result<Bytes, RemoteError> {
            let fetched = {
                let mut fetched = self.fetched.lock().expect("counter");
                *fetched += 1;
                *fetched
            };
            if fetched == self.stop_after {
                self.stop.send_replace(true);
            }
            self.inner.fetch_payload(key, kind).await
        }
    }

    fn busy() -> RemoteError {
        RemoteError::Busy {
            path: "meta".into(),
            detail: "too many connections".into(),
        }
    }

    #[test]
    fn directory_index_yields_float_directories_only() {
        let html = r#"<html><body><h1>Index of /dac/incois</h1>
            <a href="?C=N;O=D">Name</a>
            <a href="/dac/">Parent Directory</a>
            <a href="2902114/">2902114/</a>
            <a href="2900226/">2900226/</a>
            <a href="/dac/incois/2902114/">dup</a>
            <a href="incois_prof.nc">incois_prof.nc</a>
            <a href="README/">README/</a>
        </body></html>"#;
        assert_eq!(
            parse_directory_index(html).expect("parse"),
            vec!["2900226".to_string(), "2902114".to_string()]
        );
    }

    #[test]
    fn http_urls_follow_gdac_layout() {
        let http = HttpFetcher::new(Default::default()).expect("client");
        let remote = HttpRemote::new("https://data-argo.ifremer.fr/dac/", "incois", http);
        assert_eq!(remote.dac_url(), "https://data-argo.ifremer.fr/dac/incois/");
        assert_eq!(
            remote.file_url("2902114", FileKind::ExtendedProfile),
            "https://data-argo.ifremer.fr/dac/incois/2902114/2902114_Sprof.nc"
        );
    }

    #[tokio::test]
    async fn listing_fingerprints_meta_and_records_unreachable_floats() {
        let remote = MemoryRemote::new("incois");
        remote.put("a", FileKind::Meta, &b"meta-a"[..]);
        remote.put("b", FileKind::Meta, &b"meta-b"[..]);
        remote.put("c", FileKind::Meta, &b"meta-c"[..]);
        remote.fail_times("a", FileKind::Meta, busy(), 2);
        remote.fail_always("b", FileKind::Meta, busy());

        let listings = list_entities(&remote, &fast_policy(), 2, &running()).await.expect("list");
        assert_eq!(listings.len(), 3);
        assert_eq!(listings[0].key, "a");
        assert_eq!(listings[0].fingerprint, Ok(Fingerprint::of_bytes(b"meta-a")));
        assert!(matches!(listings[1].fingerprint, Err(RemoteError::Busy { .. })));
        assert_eq!(listings[2].fingerprint, Ok(Fingerprint::of_bytes(b"meta-c")));
        assert_eq!(remote.fetch_count("a", FileKind::Meta), 3);
        assert_eq!(remote.fetch_count("b", FileKind::Meta), 3);
    }

    #[tokio::test]
    async fn listing_failure_is_a_run_level_error() {
        let remote = MemoryRemote::new("incois");
        remote.put("a", FileKind::Meta, &b"meta-a"[..]);
        remote.fail_listing(RemoteError::Unavailable {
            path: "incois".into(),
            detail: "connection refused".into(),
        });
        let err = list_entities(&remote, &fast_policy(), 2, &running())
            .await
            .expect_err("listing fails");
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn shutdown_before_listing_touches_nothing() {
        let remote = MemoryRemote::new("incois");
        remote.put("a", FileKind::Meta, &b"meta-a"[..]);
        let (stop, shutdown) = watch::channel(false);
        stop.send_replace(true);

        let listings = list_entities(&remote, &fast_policy(), 2, &shutdown)
            .await
            .expect("list");
        assert!(listings.is_empty());
        assert_eq!(remote.fetch_count("a", FileKind::Meta), 0);
    }

    #[tokio::test]
    async fn shutdown_during_listing_stops_fingerprinting() {
        let inner = MemoryRemote::new("incois");
        for key in ["a", "b", "c", "d", "e"] {
            inner.put(key, FileKind::Meta, format!("meta-{key}").into_bytes());
        }
        let (stop, shutdown) = watch::channel(false);
        let remote = InterruptedRemote {
            inner,
            stop,
            stop_after: 2,
            fetched: Mutex::new(0),
        };

        let listings = list_entities(&remote, &fast_policy(), 1, &shutdown)
            .await
            .expect("list");
        let keys = listings.iter().map(|l| l.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["a", "b"]);
        for key in ["c", "d", "e"] {
            assert_eq!(remote.inner.fetch_count(key, FileKind::Meta), 0, "{key}");
        }
    }

    #[tokio::test]
    async fn missing_memory_file_is_not_found() {
        let remote = MemoryRemote::new("incois");
        remote.put("a", FileKind::Profile, &b"prof"[..]);
        assert!(matches!(
            remote.fetch_payload("a", FileKind::ExtendedProfile).await,
            Err(RemoteError::NotFound { .. })
        ));
        assert_eq!(
            remote.fetch_payload("a", FileKind::Profile).await.expect("prof"),
            Bytes::from_static(b"prof")
        );
        assert_eq!(remote.payload_fetches(), 2);
    }

    #[tokio::test]
    async fn mirror_reads_local_gdac_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let float_dir = dir.path().join("incois").join("2902114");
        std::fs::create_dir_all(&float_dir).expect("mkdir");
        std::fs::create_dir_all(dir.path().join("incois").join("docs")).expect("mkdir");
        std::fs::write(float_dir.join("2902114_meta.nc"), b"meta").expect("write");

        let remote = MirrorRemote::new(dir.path(), "incois");
        assert_eq!(remote.list_keys().await.expect("list"), vec!["2902114".to_string()]);
        assert_eq!(
            remote
                .fetch_payload("2902114", FileKind::Meta)
                .await
                .expect("meta"),
            Bytes::from_static(b"meta")
        );
        assert!(matches!(
            remote.fetch_payload("2902114", FileKind::Profile).await,
            Err(RemoteError::NotFound { .. })
        ));
    }
}
