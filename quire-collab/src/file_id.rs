//! Stable file identifiers that survive renames.
//!
//! Every file and directory under the root gets an opaque id, persisted in
//! RocksDB:
//! - `ids`   : id → `{path, mtime}` (bincode)
//! - `paths` : path → id
//!
//! Paths are stored relative to the root with `/` separators. Renames are
//! inferred from raw filesystem events: within one batch, a deleted indexed
//! path whose recorded mtime equals the live mtime of an added, unindexed
//! path is treated as the same file and keeps its id.
//!
//! Lookups wait until the initial scan has reconciled the persisted table
//! with the tree, so they never observe a partial index.
//!
//! Hidden entries (any path component starting with `.`) and the ignored
//! directories are neither scanned nor indexed from events. They only get
//! ids through an explicit [`FileIdManager::index`], and keep them across
//! restarts as long as they exist.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use ignore::WalkBuilder;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::FileIdConfig;

const CF_IDS: &str = "ids";
const CF_PATHS: &str = "paths";

/// File identity errors.
#[derive(Debug, Error)]
pub enum FileIdError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(&'static str),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watcher error: {0}")]
    Watch(#[from] notify::Error),
    /// The manager was stopped while a caller waited for initialization.
    #[error("file id manager stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// Notification delivered to watchers; `path` is root-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub kind: ChangeKind,
    pub path: String,
}

impl FileChange {
    fn new(kind: ChangeKind, path: &str) -> Self {
        Self {
            kind,
            path: path.to_string(),
        }
    }
}

/// Raw filesystem event with an absolute path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

impl RawChange {
    pub fn added(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Added,
            path: path.into(),
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Modified,
            path: path.into(),
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            path: path.into(),
        }
    }
}

/// Subscription returned by [`FileIdManager::watch`].
pub struct FileWatch {
    path: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<FileChange>,
}

impl FileWatch {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next change; `None` once the subscription was removed.
    pub async fn recv(&mut self) -> Option<FileChange> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<FileChange> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    path: String,
    mtime: f64,
}

/// Paths observed in one batch, already stat'ed.
#[derive(Debug, Default)]
struct Observed {
    deleted: BTreeSet<String>,
    added: BTreeMap<String, f64>,
    modified: BTreeMap<String, f64>,
}

/// In-memory mirror of the persisted table. Mutations are staged into a
/// `WriteBatch` and become durable on `commit`.
struct Table {
    db: DB,
    entries: HashMap<String, Entry>,
    paths: BTreeMap<String, String>,
}

fn cf<'a>(db: &'a DB, name: &'static str) -> Result<&'a ColumnFamily, FileIdError> {
    db.cf_handle(name)
        .ok_or(FileIdError::MissingColumnFamily(name))
}

impl Table {
    fn open(path: &Path) -> Result<Self, FileIdError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, path, [CF_IDS, CF_PATHS])?;
        let mut table = Self {
            db,
            entries: HashMap::new(),
            paths: BTreeMap::new(),
        };
        table.load()?;
        Ok(table)
    }

    fn load(&mut self) -> Result<(), FileIdError> {
        self.entries.clear();
        self.paths.clear();
        let ids = cf(&self.db, CF_IDS)?;
        for item in self.db.iterator_cf(ids, IteratorMode::Start) {
            let (key, value) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| FileIdError::Corrupt(e.to_string()))?;
            let (entry, _): (Entry, usize) =
                bincode::serde::decode_from_slice(&value, bincode::config::standard())
                    .map_err(|e| FileIdError::Corrupt(e.to_string()))?;
            self.paths.insert(entry.path.clone(), id.clone());
            self.entries.insert(id, entry);
        }
        Ok(())
    }

    fn id_of(&self, path: &str) -> Option<String> {
        self.paths.get(path).cloned()
    }

    /// Bind `id` to `path`, displacing whatever id owned `path` before.
    fn put(
        &mut self,
        batch: &mut WriteBatch,
        id: String,
        path: String,
        mtime: f64,
    ) -> Result<(), FileIdError> {
        if let Some(owner) = self.id_of(&path) {
            if owner != id {
                self.remove_id(batch, &owner)?;
            }
        }
        if let Some(old_path) = self.entries.get(&id).map(|e| e.path.clone()) {
            if old_path != path {
                batch.delete_cf(cf(&self.db, CF_PATHS)?, old_path.as_bytes());
                self.paths.remove(&old_path);
            }
        }
        let entry = Entry {
            path: path.clone(),
            mtime,
        };
        let encoded = bincode::serde::encode_to_vec(&entry, bincode::config::standard())
            .map_err(|e| FileIdError::Corrupt(e.to_string()))?;
        batch.put_cf(cf(&self.db, CF_IDS)?, id.as_bytes(), encoded);
        batch.put_cf(cf(&self.db, CF_PATHS)?, path.as_bytes(), id.as_bytes());
        self.paths.insert(path, id.clone());
        self.entries.insert(id, entry);
        Ok(())
    }

    fn refresh(
        &mut self,
        batch: &mut WriteBatch,
        path: &str,
        mtime: f64,
    ) -> Result<bool, FileIdError> {
        match self.id_of(path) {
            Some(id) => {
                self.put(batch, id, path.to_string(), mtime)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove_id(&mut self, batch: &mut WriteBatch, id: &str) -> Result<(), FileIdError> {
        if let Some(entry) = self.entries.remove(id) {
            batch.delete_cf(cf(&self.db, CF_IDS)?, id.as_bytes());
            batch.delete_cf(cf(&self.db, CF_PATHS)?, entry.path.as_bytes());
            self.paths.remove(&entry.path);
        }
        Ok(())
    }

    /// `path` itself plus every indexed path beneath it.
    fn subtree(&self, path: &str) -> Vec<(String, String)> {
        let dir = format!("{path}/");
        let mut found: Vec<(String, String)> = self
            .paths
            .get(path)
            .map(|id| (path.to_string(), id.clone()))
            .into_iter()
            .collect();
        found.extend(
            self.paths
                .range(dir.clone()..)
                .take_while(|(p, _)| p.starts_with(&dir))
                .map(|(p, id)| (p.clone(), id.clone())),
        );
        found
    }

    fn remove_tree(&mut self, batch: &mut WriteBatch, path: &str) -> Result<usize, FileIdError> {
        let doomed = self.subtree(path);
        for (_, id) in &doomed {
            self.remove_id(batch, id)?;
        }
        Ok(doomed.len())
    }

    /// Move `from` and everything beneath it to `to`, keeping ids.
    fn relocate(&mut self, batch: &mut WriteBatch, from: &str, to: &str) -> Result<(), FileIdError> {
        for (old_path, id) in self.subtree(from) {
            let new_path = format!("{to}{}", &old_path[from.len()..]);
            let mtime = self.entries.get(&id).map(|e| e.mtime).unwrap_or_default();
            self.put(batch, id, new_path, mtime)?;
        }
        Ok(())
    }

    fn commit(&mut self, batch: WriteBatch) -> Result<(), FileIdError> {
        if let Err(e) = self.db.write(batch) {
            // Staged changes were applied to the mirror already.
            self.load()?;
            return Err(e.into());
        }
        Ok(())
    }
}

type Subscribers = HashMap<String, HashMap<u64, mpsc::UnboundedSender<FileChange>>>;

/// Persistent path ↔ id registry with a batched filesystem watch loop.
pub struct FileIdManager {
    config: FileIdConfig,
    /// The configured root plus its absolute and canonical forms.
    roots: Vec<PathBuf>,
    /// Root-relative prefixes whose events are dropped.
    ignored: Vec<String>,
    table: Mutex<Table>,
    initialized: watch::Sender<bool>,
    subscribers: Mutex<Subscribers>,
    next_subscription: AtomicU64,
    watcher: Mutex<Option<RecommendedWatcher>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl FileIdManager {
    /// Open (or create) the id table. Lookups block until [`start`] ran.
    ///
    /// [`start`]: FileIdManager::start
    pub fn new(config: FileIdConfig) -> Result<Self, FileIdError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let table = Table::open(&config.db_path)?;
        let roots = resolved(&config.root_dir);
        let mut ignored: Vec<String> = Vec::new();
        for path in std::iter::once(&config.db_path).chain(&config.ignored_paths) {
            // The directory may not exist yet, so match on the root-relative form.
            for form in resolved(path) {
                if let Some(rel) = relative_to(&roots, &form) {
                    if !ignored.contains(&rel) {
                        ignored.push(rel);
                    }
                }
            }
        }
        let (initialized, _) = watch::channel(false);
        Ok(Self {
            config,
            roots,
            ignored,
            table: Mutex::new(table),
            initialized,
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Reconcile the table with a full scan, mark the index initialized,
    /// then start the watcher if configured.
    pub async fn start(self: &Arc<Self>) -> Result<(), FileIdError> {
        let root = self.config.root_dir.clone();
        let roots = self.roots.clone();
        let ignored = self.ignored.clone();
        let scanned = tokio::task::spawn_blocking(move || scan(&root, &roots, &ignored))
            .await
            .map_err(|e| FileIdError::Io(std::io::Error::other(e)))?;

        let (unscanned, mut observed) = {
            let table = self.table.lock();
            let mut unscanned = Vec::new();
            let mut observed = Observed::default();
            for (path, id) in &table.paths {
                match scanned.get(path) {
                    None => {
                        let recorded = table.entries.get(id).map(|e| e.mtime);
                        unscanned.push((path.clone(), recorded));
                    }
                    Some(mtime) => {
                        if table.entries.get(id).is_some_and(|e| e.mtime != *mtime) {
                            observed.modified.insert(path.clone(), *mtime);
                        }
                    }
                }
            }
            for (path, mtime) in &scanned {
                if !table.paths.contains_key(path) {
                    observed.added.insert(path.clone(), *mtime);
                }
            }
            (unscanned, observed)
        };
        for (path, recorded) in unscanned {
            // Skipped entries were never scanned; keep them while they exist.
            let live = if is_skipped(&path, &self.ignored) {
                stat_mtime(&self.absolute(&path)).await
            } else {
                None
            };
            match live {
                Some(mtime) if recorded == Some(mtime) => {}
                Some(mtime) => {
                    observed.modified.insert(path, mtime);
                }
                None => {
                    observed.deleted.insert(path);
                }
            }
        }
        let changes = self.apply(observed)?;
        log::info!(
            "File id scan of {} complete: {} entries, {} reconciled",
            self.config.root_dir.display(),
            self.len(),
            changes.len()
        );
        self.initialized.send_replace(true);

        if self.config.watch_filesystem {
            self.start_watcher()?;
        }
        Ok(())
    }

    fn start_watcher(self: &Arc<Self>) -> Result<(), FileIdError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<RawChange>();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in raw_changes(event) {
                        let _ = tx.send(change);
                    }
                }
                Err(e) => log::warn!("File watcher error: {e}"),
            }
        })?;
        let watch_root = self
            .roots
            .last()
            .cloned()
            .unwrap_or_else(|| self.config.root_dir.clone());
        watcher.watch(&watch_root, RecursiveMode::Recursive)?;
        *self.watcher.lock() = Some(watcher);

        let manager = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let window = self.config.batch_window;
        self.tracker.spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = rx.recv() => match change {
                        Some(change) => change,
                        None => break,
                    },
                };
                let mut batch = vec![first];
                let deadline = tokio::time::Instant::now() + window;
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => break,
                        change = rx.recv() => match change {
                            Some(change) => batch.push(change),
                            None => break,
                        },
                    }
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.process_events(batch).await {
                    log::error!("Failed to process file events: {e}");
                }
            }
            log::debug!("File watch loop stopped");
        });
        log::info!("Watching {} for changes", watch_root.display());
        Ok(())
    }

    /// Stop the watcher and wait for the batch loop to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.watcher.lock().take();
        self.tracker.close();
        self.tracker.wait().await;
    }

    pub fn root(&self) -> &Path {
        &self.config.root_dir
    }

    /// Absolute location of a root-relative path.
    pub fn absolute(&self, path: &str) -> PathBuf {
        self.config.root_dir.join(path)
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Number of indexed paths.
    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn wait_initialized(&self) -> Result<(), FileIdError> {
        let mut rx = self.initialized.subscribe();
        let ready = rx.wait_for(|ready| *ready).await.is_ok();
        if ready {
            Ok(())
        } else {
            Err(FileIdError::Stopped)
        }
    }

    /// Id for `path`, assigning a fresh one when it is not indexed yet.
    /// `None` when the path does not exist.
    pub async fn index(&self, path: &str) -> Result<Option<String>, FileIdError> {
        self.wait_initialized().await?;
        let path = normalize(path);
        let existing = self.table.lock().id_of(&path);
        if existing.is_some() {
            return Ok(existing);
        }
        let Some(mtime) = stat_mtime(&self.absolute(&path)).await else {
            return Ok(None);
        };

        let mut table = self.table.lock();
        if let Some(id) = table.id_of(&path) {
            return Ok(Some(id));
        }
        let id = new_id();
        let mut batch = WriteBatch::default();
        table.put(&mut batch, id.clone(), path.clone(), mtime)?;
        table.commit(batch)?;
        log::debug!("Indexed {path} as {id}");
        Ok(Some(id))
    }

    pub async fn get_id(&self, path: &str) -> Result<Option<String>, FileIdError> {
        self.wait_initialized().await?;
        Ok(self.table.lock().id_of(&normalize(path)))
    }

    pub async fn get_path(&self, id: &str) -> Result<Option<String>, FileIdError> {
        self.wait_initialized().await?;
        Ok(self.table.lock().entries.get(id).map(|e| e.path.clone()))
    }

    /// Subscribe to changes of `path` (and, for directories, beneath it).
    pub fn watch(&self, path: &str) -> FileWatch {
        let path = normalize(path);
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(path.clone())
            .or_default()
            .insert(id, tx);
        FileWatch { path, id, rx }
    }

    pub fn unwatch(&self, path: &str, subscription: u64) {
        let path = normalize(path);
        let mut subscribers = self.subscribers.lock();
        if let Some(subs) = subscribers.get_mut(&path) {
            subs.remove(&subscription);
            if subs.is_empty() {
                subscribers.remove(&path);
            }
        }
    }

    /// Record an explicit rename, including everything beneath a directory.
    pub async fn moved(&self, from: &str, to: &str) -> Result<(), FileIdError> {
        self.wait_initialized().await?;
        let (from, to) = (normalize(from), normalize(to));
        let mtime = stat_mtime(&self.absolute(&to)).await;
        {
            let mut table = self.table.lock();
            let mut batch = WriteBatch::default();
            if table.id_of(&from).is_some() {
                table.relocate(&mut batch, &from, &to)?;
                if let Some(mtime) = mtime {
                    table.refresh(&mut batch, &to, mtime)?;
                }
            } else if let Some(mtime) = mtime {
                table.put(&mut batch, new_id(), to.clone(), mtime)?;
            }
            table.commit(batch)?;
        }
        self.notify(&[
            FileChange::new(ChangeKind::Deleted, &from),
            FileChange::new(ChangeKind::Added, &to),
        ]);
        Ok(())
    }

    /// Record a copy: the destination gets its own id.
    pub async fn copied(&self, from: &str, to: &str) -> Result<(), FileIdError> {
        self.wait_initialized().await?;
        let to = normalize(to);
        let Some(mtime) = stat_mtime(&self.absolute(&to)).await else {
            log::debug!("Copy destination {to} (from {from}) vanished before indexing");
            return Ok(());
        };
        {
            let mut table = self.table.lock();
            let mut batch = WriteBatch::default();
            if !table.refresh(&mut batch, &to, mtime)? {
                table.put(&mut batch, new_id(), to.clone(), mtime)?;
            }
            table.commit(batch)?;
        }
        self.notify(&[FileChange::new(ChangeKind::Added, &to)]);
        Ok(())
    }

    /// Forget `path` and everything beneath it.
    pub async fn deleted(&self, path: &str) -> Result<(), FileIdError> {
        self.wait_initialized().await?;
        let path = normalize(path);
        {
            let mut table = self.table.lock();
            let mut batch = WriteBatch::default();
            table.remove_tree(&mut batch, &path)?;
            table.commit(batch)?;
        }
        self.notify(&[FileChange::new(ChangeKind::Deleted, &path)]);
        Ok(())
    }

    /// Apply one batch of raw events: match renames by mtime, drop deleted
    /// entries, index new paths, refresh modified ones, commit, then notify
    /// watchers. Returns the notifications sent.
    pub async fn process_events(
        &self,
        batch: Vec<RawChange>,
    ) -> Result<Vec<FileChange>, FileIdError> {
        self.wait_initialized().await?;

        let mut deleted = BTreeSet::new();
        let mut added = BTreeSet::new();
        let mut modified = BTreeSet::new();
        for raw in batch {
            let Some(path) = relative_to(&self.roots, &raw.path) else {
                continue;
            };
            if is_skipped(&path, &self.ignored) {
                continue;
            }
            match raw.kind {
                ChangeKind::Added => added.insert(path),
                ChangeKind::Deleted => deleted.insert(path),
                ChangeKind::Modified => modified.insert(path),
            };
        }
        // Added and deleted within one batch cancel out.
        let both: Vec<String> = deleted.intersection(&added).cloned().collect();
        for path in both {
            deleted.remove(&path);
            added.remove(&path);
            modified.remove(&path);
        }

        let mut observed = Observed::default();
        for path in deleted {
            match stat_mtime(&self.absolute(&path)).await {
                Some(mtime) => {
                    observed.modified.insert(path, mtime);
                }
                None => {
                    observed.deleted.insert(path);
                }
            }
        }
        for path in added {
            if let Some(mtime) = stat_mtime(&self.absolute(&path)).await {
                observed.added.insert(path, mtime);
            }
        }
        for path in modified {
            if let Some(mtime) = stat_mtime(&self.absolute(&path)).await {
                observed.modified.insert(path, mtime);
            }
        }

        let changes = self.apply(observed)?;
        self.notify(&changes);
        Ok(changes)
    }

    fn apply(&self, observed: Observed) -> Result<Vec<FileChange>, FileIdError> {
        let Observed {
            deleted,
            added: mut unmatched,
            modified,
        } = observed;
        let mut changes = Vec::new();
        let mut table = self.table.lock();
        let mut batch = WriteBatch::default();

        for path in &deleted {
            changes.push(FileChange::new(ChangeKind::Deleted, path));
            let Some(id) = table.id_of(path) else {
                continue;
            };
            let recorded = table.entries.get(&id).map(|e| e.mtime);
            let partner = recorded.and_then(|mtime| {
                unmatched
                    .iter()
                    .find(|(candidate, live)| **live == mtime && !table.paths.contains_key(*candidate))
                    .map(|(candidate, _)| candidate.clone())
            });
            match partner {
                Some(to) => {
                    unmatched.remove(&to);
                    log::debug!("Rename detected: {path} -> {to} ({id})");
                    table.relocate(&mut batch, path, &to)?;
                    changes.push(FileChange::new(ChangeKind::Added, &to));
                }
                None => {
                    table.remove_tree(&mut batch, path)?;
                }
            }
        }

        for (path, mtime) in unmatched {
            changes.push(FileChange::new(ChangeKind::Added, &path));
            if !table.refresh(&mut batch, &path, mtime)? {
                table.put(&mut batch, new_id(), path, mtime)?;
            }
        }

        // Modify events never index new paths.
        for (path, mtime) in modified {
            changes.push(FileChange::new(ChangeKind::Modified, &path));
            table.refresh(&mut batch, &path, mtime)?;
        }

        table.commit(batch)?;
        Ok(changes)
    }

    fn notify(&self, changes: &[FileChange]) {
        let mut subscribers = self.subscribers.lock();
        for change in changes {
            let dir = format!("{}/", change.path);
            for (watched, subs) in subscribers.iter_mut() {
                let delivered = if *watched == change.path {
                    change.clone()
                } else if watched.starts_with(&dir) {
                    FileChange::new(change.kind, watched)
                } else {
                    continue;
                };
                subs.retain(|_, tx| tx.send(delivered.clone()).is_ok());
            }
        }
        subscribers.retain(|_, subs| !subs.is_empty());
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// `path` as given, made absolute against the working directory, and
/// canonicalized when it exists. The last entry is the most resolved one.
fn resolved(path: &Path) -> Vec<PathBuf> {
    let mut paths = vec![path.to_path_buf()];
    let absolute = std::path::absolute(path).ok();
    let canonical = std::fs::canonicalize(path).ok();
    for form in absolute.into_iter().chain(canonical) {
        if !paths.contains(&form) {
            paths.push(form);
        }
    }
    paths
}

/// Hidden entries and everything under an ignored prefix.
fn is_skipped(path: &str, ignored: &[String]) -> bool {
    path.split('/').any(|part| part.starts_with('.'))
        || ignored.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn relative_to(roots: &[PathBuf], path: &Path) -> Option<String> {
    let rel = roots.iter().find_map(|root| path.strip_prefix(root).ok())?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn mtime_of(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

async fn stat_mtime(path: &Path) -> Option<f64> {
    tokio::fs::metadata(path).await.ok().map(|meta| mtime_of(&meta))
}

/// Full recursive scan; hidden entries and ignored directories are skipped.
fn scan(root: &Path, roots: &[PathBuf], ignored: &[String]) -> BTreeMap<String, f64> {
    let filter_roots = roots.to_vec();
    let skip = ignored.to_vec();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            !relative_to(&filter_roots, entry.path()).is_some_and(|path| is_skipped(&path, &skip))
        })
        .build();

    let mut found = BTreeMap::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Scan error: {e}");
                continue;
            }
        };
        if entry.depth() == 0 {
            continue;
        }
        let Some(path) = relative_to(roots, entry.path()) else {
            continue;
        };
        match entry.metadata() {
            Ok(meta) => {
                found.insert(path, mtime_of(&meta));
            }
            Err(e) => log::debug!("Skipping {path}: {e}"),
        }
    }
    found
}

fn raw_changes(event: Event) -> Vec<RawChange> {
    let paths = event.paths;
    match event.kind {
        EventKind::Create(_) => paths.into_iter().map(RawChange::added).collect(),
        EventKind::Remove(_) => paths.into_iter().map(RawChange::deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.into_iter().map(RawChange::deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.into_iter().map(RawChange::added).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
            let mut paths = paths.into_iter();
            let from = paths.next().map(RawChange::deleted);
            let to = paths.next().map(RawChange::added);
            from.into_iter().chain(to).collect()
        }
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .into_iter()
            .map(|path| {
                if path.exists() {
                    RawChange::added(path)
                } else {
                    RawChange::deleted(path)
                }
            })
            .collect(),
        EventKind::Modify(_) => paths.into_iter().map(RawChange::modified).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
