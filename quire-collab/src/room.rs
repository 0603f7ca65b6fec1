//! One room per open document.
//!
//! ```text
//!  channel ──► session ──► SharedDocument ──► UpdateStream
//!  channel ──► session ─┘        ▲                 │
//!                                │                 ▼
//!              watcher task ─────┘          broadcaster task
//!              (FileIdManager                ├─► BroadcastGroup ─► every session
//!               notifications,               ├─► UpdateStore (append)
//!               reload on external change)   └─► debounced save (ContentsManager)
//! ```
//!
//! States: `Uninitialized → Syncing → Serving → Closing → Closed`. A room
//! is `Closing` while it has no channels and its grace timer runs; a new
//! channel brings it back to `Serving`. When the timer expires the room id
//! is reported to the registry, which stops the room under its keyed lock.
//!
//! All background work of a room lives in its own `TaskTracker` and stops
//! when the room's `CancellationToken` is cancelled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use yrs::Any;

use crate::broadcast::{BroadcastGroup, Peer};
use crate::channel::{Channel, ChannelError};
use crate::config::RoomConfig;
use crate::contents::{ContentsError, ContentsManager, FileFormat, SaveRequest};
use crate::document::{DocumentError, DocumentFactory, SharedDocument, UpdateStream};
use crate::file_id::{FileIdError, FileIdManager, FileWatch};
use crate::permissions::Permissions;
use crate::protocol::{Message, SyncMessage};
use crate::storage::{StoreError, UpdateStore};

/// Document type used by rooms that are not backed by a file.
pub const EPHEMERAL_DOC_TYPE: &str = "file";

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Contents(#[from] ContentsError),
    #[error(transparent)]
    FileId(#[from] FileIdError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("no file with id '{0}'")]
    FileNotFound(String),
    #[error("file-backed rooms need a file id manager")]
    NoFileIds,
    #[error("unsupported document type '{0}'")]
    UnsupportedType(String),
    #[error("room is closed")]
    Closed,
}

/// Parsed room id: `"{format}:{type}:{fileId}"` or any ephemeral string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoomId {
    File {
        format: FileFormat,
        doc_type: String,
        file_id: String,
    },
    Ephemeral(String),
}

impl RoomId {
    pub fn parse(id: &str) -> Self {
        let mut parts = id.splitn(3, ':');
        if let (Some(format), Some(doc_type), Some(file_id)) =
            (parts.next(), parts.next(), parts.next())
        {
            if let Some(format) = FileFormat::parse(format) {
                if !doc_type.is_empty() && !file_id.is_empty() {
                    return RoomId::File {
                        format,
                        doc_type: doc_type.to_string(),
                        file_id: file_id.to_string(),
                    };
                }
            }
        }
        RoomId::Ephemeral(id.to_string())
    }

    pub fn file(format: FileFormat, doc_type: impl Into<String>, file_id: impl Into<String>) -> Self {
        RoomId::File {
            format,
            doc_type: doc_type.into(),
            file_id: file_id.into(),
        }
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self, RoomId::File { .. })
    }

    pub fn doc_type(&self) -> &str {
        match self {
            RoomId::File { doc_type, .. } => doc_type,
            RoomId::Ephemeral(_) => EPHEMERAL_DOC_TYPE,
        }
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomId::File {
                format,
                doc_type,
                file_id,
            } => write!(f, "{}:{doc_type}:{file_id}", format.as_str()),
            RoomId::Ephemeral(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Uninitialized,
    Syncing,
    Serving,
    Closing,
    Closed,
}

/// Supplies the metadata stored next to each persisted update.
pub type MetadataProvider = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Collaborators shared by every room of a registry.
#[derive(Clone)]
pub struct RoomServices {
    pub contents: Arc<dyn ContentsManager>,
    pub store: Option<Arc<UpdateStore>>,
    pub file_ids: Option<Arc<FileIdManager>>,
    pub factory: DocumentFactory,
    pub metadata: MetadataProvider,
}

impl RoomServices {
    pub fn new(contents: Arc<dyn ContentsManager>) -> Self {
        Self {
            contents,
            store: None,
            file_ids: None,
            factory: DocumentFactory::with_defaults(),
            metadata: Arc::new(Vec::<u8>::new),
        }
    }

    pub fn with_store(mut self, store: Arc<UpdateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_file_ids(mut self, file_ids: Arc<FileIdManager>) -> Self {
        self.file_ids = Some(file_ids);
        self
    }

    pub fn with_factory(mut self, factory: DocumentFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataProvider) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Counters exposed for monitoring and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub saves: u64,
    pub skipped_saves: u64,
    pub failed_saves: u64,
    pub reloads: u64,
    pub ignored_own_writes: u64,
    pub updates_broadcast: u64,
    pub denied_updates: u64,
    pub peers: usize,
}

#[derive(Default)]
struct AtomicRoomStats {
    saves: AtomicU64,
    skipped_saves: AtomicU64,
    failed_saves: AtomicU64,
    reloads: AtomicU64,
    ignored_own_writes: AtomicU64,
    updates_broadcast: AtomicU64,
    denied_updates: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// What a file-backed room knows about its file.
struct FileState {
    path: String,
    last_modified: SystemTime,
    last_content: Value,
}

/// Grace timer of an empty room. Every attach and every timer start bumps
/// `generation`, so a report from an older timer is recognised as stale.
#[derive(Default)]
struct CloseTimer {
    generation: u64,
    token: Option<CancellationToken>,
}

/// Sent to the registry when a grace period expires: room key and timer
/// generation.
pub(crate) type IdleReport = (String, u64);

/// A channel attached to a room, ready to be served.
pub struct Session {
    peer: Peer,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl Session {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

pub struct Room {
    id: RoomId,
    key: String,
    document: Arc<SharedDocument>,
    broadcast: BroadcastGroup,
    services: RoomServices,
    config: RoomConfig,
    state: Mutex<RoomState>,
    file: AsyncMutex<Option<FileState>>,
    stats: AtomicRoomStats,
    cancel: CancellationToken,
    tracker: TaskTracker,
    /// Held across peer registration so attach and detach are ordered.
    close_timer: AsyncMutex<CloseTimer>,
    idle_tx: Option<mpsc::UnboundedSender<IdleReport>>,
}

impl Room {
    pub fn new(id: RoomId, services: RoomServices, config: RoomConfig) -> Result<Self, RoomError> {
        let doc_type = id.doc_type();
        if !services.factory.supports(doc_type) {
            return Err(RoomError::UnsupportedType(doc_type.to_string()));
        }
        let document = Arc::new(services.factory.create(doc_type)?);
        Ok(Self {
            key: id.to_string(),
            id,
            document,
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            services,
            config,
            state: Mutex::new(RoomState::Uninitialized),
            file: AsyncMutex::new(None),
            stats: AtomicRoomStats::default(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            close_timer: AsyncMutex::new(CloseTimer::default()),
            idle_tx: None,
        })
    }

    /// Report idleness to `idle_tx` and stop together with `parent`.
    pub(crate) fn supervised(
        mut self,
        idle_tx: mpsc::UnboundedSender<IdleReport>,
        parent: &CancellationToken,
    ) -> Self {
        self.idle_tx = Some(idle_tx);
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// The room id as a string; also the store partition key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> RoomState {
        *self.state.lock()
    }

    pub fn document(&self) -> &Arc<SharedDocument> {
        &self.document
    }

    /// Current repository-relative path of a file-backed room.
    pub async fn file_path(&self) -> Option<String> {
        self.file.lock().await.as_ref().map(|f| f.path.clone())
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    pub async fn is_idle(&self) -> bool {
        self.peer_count().await == 0
    }

    /// Whether the grace timer of `generation` is still the current one and
    /// the room is still empty.
    pub(crate) async fn close_pending(&self, generation: u64) -> bool {
        let timer = self.close_timer.lock().await;
        timer.generation == generation
            && timer.token.is_some()
            && self.state() == RoomState::Closing
            && self.is_idle().await
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            saves: self.stats.saves.load(Ordering::Relaxed),
            skipped_saves: self.stats.skipped_saves.load(Ordering::Relaxed),
            failed_saves: self.stats.failed_saves.load(Ordering::Relaxed),
            reloads: self.stats.reloads.load(Ordering::Relaxed),
            ignored_own_writes: self.stats.ignored_own_writes.load(Ordering::Relaxed),
            updates_broadcast: self.stats.updates_broadcast.load(Ordering::Relaxed),
            denied_updates: self.stats.denied_updates.load(Ordering::Relaxed),
            peers: self.peer_count().await,
        }
    }

    fn set_state(&self, state: RoomState) {
        *self.state.lock() = state;
    }

    fn transition(&self, from: RoomState, to: RoomState) {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
        }
    }

    /// Initialize the document and spawn the room's background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<(), RoomError> {
        self.set_state(RoomState::Syncing);
        let watch = match self.initialize().await {
            Ok(watch) => watch,
            Err(e) => {
                self.set_state(RoomState::Closed);
                return Err(e);
            }
        };

        // Replayed and baseline updates are already persisted.
        let updates = self.document.observe()?;
        self.tracker
            .spawn(Arc::clone(self).run_broadcaster(updates, self.cancel.clone()));
        if let Some(watch) = watch {
            self.tracker
                .spawn(Arc::clone(self).run_watcher(watch, self.cancel.clone()));
        }

        self.set_state(RoomState::Serving);
        log::info!("Room {} started", self.key);
        Ok(())
    }

    /// Load content for a file-backed room. The update log is replayed
    /// first; when it is missing or its content differs from the file, the
    /// file wins and a fresh baseline is persisted.
    async fn initialize(&self) -> Result<Option<FileWatch>, RoomError> {
        let RoomId::File {
            format, file_id, ..
        } = &self.id
        else {
            return Ok(None);
        };
        let file_ids = self.services.file_ids.as_ref().ok_or(RoomError::NoFileIds)?;
        let path = file_ids
            .get_path(file_id)
            .await?
            .ok_or_else(|| RoomError::FileNotFound(file_id.clone()))?;
        let watch = file_ids.watch(&path);

        let model = self.services.contents.read(&path, *format, true).await?;
        let content = model.content.unwrap_or(Value::Null);
        self.document.set_state("path", path.as_str());

        if let Some(store) = &self.services.store {
            let metadata = (self.services.metadata)();
            match store.read(&self.key).await {
                Ok(records) => {
                    for record in &records {
                        self.document.apply_update(&record.update)?;
                    }
                    if self.document.get_source() != content {
                        log::info!(
                            "Room {}: stored history diverges from {path}; reloading from file",
                            self.key
                        );
                        self.document.set_source(&content)?;
                        store
                            .write(&self.key, &self.document.full_update(), &metadata)
                            .await?;
                    } else {
                        log::debug!("Room {}: restored {} updates", self.key, records.len());
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    self.document.set_source(&content)?;
                    store
                        .write(&self.key, &self.document.full_update(), &metadata)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            self.document.set_source(&content)?;
        }

        *self.file.lock().await = Some(FileState {
            path,
            last_modified: model.last_modified,
            last_content: content,
        });
        Ok(Some(watch))
    }

    /// Broadcast and persist every update in order, and save after a quiet
    /// period. A pending save is flushed when the room stops.
    async fn run_broadcaster(self: Arc<Self>, mut updates: UpdateStream, cancel: CancellationToken) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => {
                    let Some(update) = update else { break };
                    self.publish(update).await;
                    if self.id.is_file_backed() {
                        if let Some(delay) = self.config.save_delay {
                            deadline = Some(Instant::now() + delay);
                        }
                    }
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    deadline = None;
                    self.save().await;
                }
            }
        }
        if deadline.is_some() {
            self.save().await;
        }
    }

    async fn publish(&self, update: Vec<u8>) {
        let encoded = Message::update(update.clone()).encode();
        self.broadcast.broadcast(encoded);
        bump(&self.stats.updates_broadcast);

        if !self.id.is_file_backed() {
            return;
        }
        if let Some(store) = &self.services.store {
            let metadata = (self.services.metadata)();
            if let Err(e) = store.write(&self.key, &update, &metadata).await {
                log::error!("Room {}: failed to persist update: {e}", self.key);
            }
        }
    }

    /// Write the document to disk unless nothing changed or the file was
    /// modified behind our back, in which case the file is reloaded.
    async fn save(&self) {
        let RoomId::File {
            format, doc_type, ..
        } = &self.id
        else {
            return;
        };
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };

        let content = self.document.get_source();
        if content == file.last_content {
            bump(&self.stats.skipped_saves);
            log::debug!("Room {}: content unchanged, not saving", self.key);
            return;
        }

        match self.services.contents.read(&file.path, *format, false).await {
            Ok(model) if model.last_modified > file.last_modified => {
                log::warn!(
                    "Room {}: {} changed on disk; reloading instead of saving",
                    self.key,
                    file.path
                );
                self.reload(file).await;
                return;
            }
            Ok(_) => {}
            Err(ContentsError::NotFound(_)) => {
                bump(&self.stats.failed_saves);
                log::warn!("Room {}: {} no longer exists, not saving", self.key, file.path);
                return;
            }
            Err(e) => {
                bump(&self.stats.failed_saves);
                log::error!("Room {}: failed to stat {}: {e}", self.key, file.path);
                return;
            }
        }

        let request = SaveRequest {
            path: file.path.clone(),
            content: content.clone(),
            format: *format,
            doc_type: doc_type.clone(),
        };
        match self.services.contents.write(request).await {
            Ok(model) => {
                file.last_modified = model.last_modified;
                file.last_content = content;
                bump(&self.stats.saves);
                log::info!("Room {}: saved {}", self.key, file.path);
                if self.document.get_state("dirty") != Some(Any::Bool(false)) {
                    self.document.set_state("dirty", false);
                }
            }
            Err(e) => {
                // Retried on the next change.
                bump(&self.stats.failed_saves);
                log::error!("Room {}: failed to save {}: {e}", self.key, file.path);
            }
        }
    }

    async fn reload(&self, file: &mut FileState) {
        let RoomId::File { format, .. } = &self.id else {
            return;
        };
        let model = match self.services.contents.read(&file.path, *format, true).await {
            Ok(model) => model,
            Err(e) => {
                log::warn!("Room {}: failed to reload {}: {e}", self.key, file.path);
                return;
            }
        };
        let content = model.content.unwrap_or(Value::Null);
        if let Err(e) = self.document.set_source(&content) {
            log::error!("Room {}: cannot load {}: {e}", self.key, file.path);
            return;
        }
        file.last_modified = model.last_modified;
        file.last_content = content;
        bump(&self.stats.reloads);
        log::info!("Room {}: reloaded {} from disk", self.key, file.path);
    }

    /// Follow renames of the room's file and reload it when it changes out
    /// of band. Changes no newer than our own last write are ignored.
    async fn run_watcher(self: Arc<Self>, mut watch: FileWatch, cancel: CancellationToken) {
        let (Some(file_ids), RoomId::File { file_id, .. }) = (&self.services.file_ids, &self.id)
        else {
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = watch.recv() => {
                    let Some(change) = change else { break };
                    log::trace!("Room {}: {:?} {}", self.key, change.kind, change.path);
                    while watch.try_recv().is_some() {}
                }
            }

            match file_ids.get_path(file_id).await {
                Ok(Some(path)) if path != watch.path() => {
                    log::info!("Room {}: file moved from {} to {path}", self.key, watch.path());
                    file_ids.unwatch(watch.path(), watch.id());
                    watch = file_ids.watch(&path);
                    if let Some(file) = self.file.lock().await.as_mut() {
                        file.path = path.clone();
                    }
                    self.document.set_state("path", path.as_str());
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    log::info!("Room {}: file {} was deleted", self.key, watch.path());
                    continue;
                }
                Err(e) => {
                    log::error!("Room {}: file id lookup failed: {e}", self.key);
                    continue;
                }
            }
            self.check_on_disk().await;
        }
        file_ids.unwatch(watch.path(), watch.id());
    }

    async fn check_on_disk(&self) {
        let RoomId::File { format, .. } = &self.id else {
            return;
        };
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else {
            return;
        };
        match self.services.contents.read(&file.path, *format, false).await {
            Ok(model) if model.last_modified > file.last_modified => self.reload(file).await,
            Ok(_) => {
                bump(&self.stats.ignored_own_writes);
                log::debug!("Room {}: change to {} is our own write", self.key, file.path);
            }
            Err(e) => log::debug!("Room {}: cannot stat {}: {e}", self.key, file.path),
        }
    }

    /// Register a channel. Cancels a pending close.
    pub async fn attach(&self, channel_id: &str, permissions: &Permissions) -> Session {
        let mut timer = self.close_timer.lock().await;
        timer.generation += 1;
        if let Some(token) = timer.token.take() {
            token.cancel();
        }
        self.transition(RoomState::Closing, RoomState::Serving);
        let peer = Peer::new(channel_id, permissions.can_write());
        let rx = self.broadcast.add_peer(peer.clone()).await;
        drop(timer);
        log::info!(
            "Room {}: channel {} joined{}",
            self.key,
            channel_id,
            if peer.can_write { "" } else { " (read-only)" }
        );
        Session { peer, rx }
    }

    /// Attach and serve `channel` until it disconnects or the room stops.
    pub async fn serve(
        &self,
        channel: &dyn Channel,
        permissions: &Permissions,
    ) -> Result<(), RoomError> {
        if self.state() == RoomState::Closed {
            return Err(RoomError::Closed);
        }
        let session = self.attach(channel.id(), permissions).await;
        self.run_session(session, channel).await;
        Ok(())
    }

    /// Serve an attached session. Failures end this session only.
    pub async fn run_session(&self, session: Session, channel: &dyn Channel) {
        let Session { peer, mut rx } = session;
        if let Err(e) = self.session_loop(&peer, &mut rx, channel).await {
            log::warn!("Room {}: channel {} failed: {e}", self.key, peer.channel_id);
        }
        self.detach(&peer).await;
    }

    async fn session_loop(
        &self,
        peer: &Peer,
        rx: &mut broadcast::Receiver<Arc<Vec<u8>>>,
        channel: &dyn Channel,
    ) -> Result<(), RoomError> {
        channel
            .send(Message::step1(self.document.state_vector()).encode())
            .await?;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                incoming = channel.recv() => match incoming {
                    Some(bytes) => self.handle_message(peer, channel, bytes).await?,
                    None => return Ok(()),
                },
                outgoing = rx.recv() => match outgoing {
                    Ok(bytes) => channel.send(bytes.as_ref().clone()).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!(
                            "Room {}: channel {} lagged by {skipped} messages, resyncing",
                            self.key,
                            peer.channel_id
                        );
                        self.broadcast.record_lag(skipped);
                        channel
                            .send(Message::step2(self.document.full_update()).encode())
                            .await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn handle_message(
        &self,
        peer: &Peer,
        channel: &dyn Channel,
        bytes: Vec<u8>,
    ) -> Result<(), RoomError> {
        let message = match Message::decode(&bytes) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(
                    "Room {}: undecodable message from {}: {e}",
                    self.key,
                    peer.channel_id
                );
                return Ok(());
            }
        };
        match message {
            Message::Sync(SyncMessage::Step1(state_vector)) => {
                let diff = self.document.encode_diff(&state_vector)?;
                channel.send(Message::step2(diff).encode()).await?;
            }
            Message::Sync(SyncMessage::Step2(update)) | Message::Sync(SyncMessage::Update(update)) => {
                if !peer.can_write {
                    bump(&self.stats.denied_updates);
                    log::debug!(
                        "Room {}: dropping update from read-only channel {}",
                        self.key,
                        peer.channel_id
                    );
                    return Ok(());
                }
                self.document.apply_update(&update)?;
            }
            Message::Awareness(_) => {
                // Verbatim, to everyone including the sender.
                self.broadcast.broadcast(bytes);
            }
        }
        Ok(())
    }

    async fn detach(&self, peer: &Peer) {
        let mut timer = self.close_timer.lock().await;
        let remaining = self.broadcast.remove_peer(&peer.id).await;
        log::info!(
            "Room {}: channel {} left ({remaining} remaining)",
            self.key,
            peer.channel_id
        );
        if remaining == 0 {
            self.schedule_close(&mut timer);
        }
    }

    /// Start (or restart) the grace timer after the last channel left.
    fn schedule_close(&self, timer: &mut CloseTimer) {
        let (Some(delay), Some(idle_tx)) = (self.config.cleanup_delay, self.idle_tx.clone()) else {
            return;
        };
        if self.cancel.is_cancelled() {
            return;
        }
        let token = self.cancel.child_token();
        if let Some(previous) = timer.token.replace(token.clone()) {
            previous.cancel();
        }
        timer.generation += 1;
        let generation = timer.generation;
        self.transition(RoomState::Serving, RoomState::Closing);
        let key = self.key.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    log::debug!("Room {key}: grace period expired");
                    let _ = idle_tx.send((key, generation));
                }
            }
        });
    }

    /// Cancel every background task, wait for them to finish, and mark the
    /// room closed. Attached sessions end as well.
    pub async fn stop(&self) {
        if self.state() == RoomState::Closed {
            return;
        }
        self.set_state(RoomState::Closing);
        log::info!("Room {} closing", self.key);
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.document.unobserve_all();
        self.set_state(RoomState::Closed);
        log::info!("Room {} closed", self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::contents::FsContents;
    use std::time::Duration;

    fn services(dir: &std::path::Path) -> RoomServices {
        RoomServices::new(Arc::new(FsContents::new(dir)))
    }

    #[test]
    fn test_parse_room_ids() {
        assert_eq!(
            RoomId::parse("json:notebook:abc"),
            RoomId::file(FileFormat::Json, "notebook", "abc")
        );
        assert_eq!(
            RoomId::parse("text:file:a:b"),
            RoomId::file(FileFormat::Text, "file", "a:b")
        );
        assert_eq!(RoomId::parse("chat"), RoomId::Ephemeral("chat".into()));
        assert_eq!(
            RoomId::parse("yaml:file:abc"),
            RoomId::Ephemeral("yaml:file:abc".into())
        );
        assert_eq!(RoomId::parse("json::abc"), RoomId::Ephemeral("json::abc".into()));
        assert_eq!(RoomId::parse("json:notebook:abc").to_string(), "json:notebook:abc");
    }

    #[test]
    fn test_unknown_doc_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Room::new(
            RoomId::parse("json:spreadsheet:abc"),
            services(dir.path()),
            RoomConfig::for_testing(),
        );
        assert!(matches!(result, Err(RoomError::UnsupportedType(_))));
    }

    #[tokio::test]
    async fn test_file_room_without_file_ids_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let room = Arc::new(
            Room::new(
                RoomId::parse("text:file:abc"),
                services(dir.path()),
                RoomConfig::for_testing(),
            )
            .unwrap(),
        );
        assert!(matches!(room.start().await, Err(RoomError::NoFileIds)));
        assert_eq!(room.state(), RoomState::Closed);
    }

    #[tokio::test]
    async fn test_ephemeral_room_sends_step1_and_answers_step1() {
        let dir = tempfile::tempdir().unwrap();
        let room = Arc::new(
            Room::new(RoomId::parse("scratch"), services(dir.path()), RoomConfig::for_testing())
                .unwrap(),
        );
        room.start().await.unwrap();
        assert_eq!(room.state(), RoomState::Serving);

        let (server_end, client) = MemoryChannel::pair();
        let serving = {
            let room = room.clone();
            tokio::spawn(async move {
                room.serve(&server_end, &Permissions::default()).await.unwrap();
            })
        };

        let first = Message::decode(&client.recv().await.unwrap()).unwrap();
        assert!(matches!(first, Message::Sync(SyncMessage::Step1(_))));

        let empty_sv = yrs::StateVector::default();
        let sv = yrs::updates::encoder::Encode::encode_v1(&empty_sv);
        client.send(Message::step1(sv).encode()).await.unwrap();
        let reply = Message::decode(&client.recv().await.unwrap()).unwrap();
        assert!(matches!(reply, Message::Sync(SyncMessage::Step2(_))));

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(room.peer_count().await, 0);

        room.stop().await;
        assert_eq!(room.state(), RoomState::Closed);
        assert!(matches!(
            room.serve(&MemoryChannel::pair().0, &Permissions::default()).await,
            Err(RoomError::Closed)
        ));
    }

    fn supervised_room(
        dir: &std::path::Path,
        cleanup_delay: Duration,
    ) -> (Arc<Room>, mpsc::UnboundedReceiver<IdleReport>) {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let config = RoomConfig {
            cleanup_delay: Some(cleanup_delay),
            ..RoomConfig::for_testing()
        };
        let room = Room::new(RoomId::parse("scratch"), services(dir), config)
            .unwrap()
            .supervised(idle_tx, &CancellationToken::new());
        (Arc::new(room), idle_rx)
    }

    #[tokio::test]
    async fn test_idle_report_from_replaced_timer_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let (room, mut idle_rx) = supervised_room(dir.path(), Duration::from_millis(20));
        room.start().await.unwrap();
        let permissions = Permissions::default();

        let first = room.attach("a", &permissions).await;
        room.detach(first.peer()).await;
        let (key, stale) = tokio::time::timeout(Duration::from_secs(1), idle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "scratch");
        assert!(room.close_pending(stale).await);

        // A channel comes and goes before the report is handled.
        let second = room.attach("b", &permissions).await;
        room.detach(second.peer()).await;
        assert_eq!(room.state(), RoomState::Closing);
        assert!(!room.close_pending(stale).await);

        let (_, current) = tokio::time::timeout(Duration::from_secs(1), idle_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(current > stale);
        assert!(room.close_pending(current).await);
        room.stop().await;
    }

    #[tokio::test]
    async fn test_attach_racing_last_detach_keeps_room_serving() {
        let dir = tempfile::tempdir().unwrap();
        let (room, _idle_rx) = supervised_room(dir.path(), Duration::from_secs(10));
        room.start().await.unwrap();
        let permissions = Permissions::default();

        for _ in 0..50 {
            let leaving = room.attach("x", &permissions).await;
            let (_, joined) = tokio::join!(
                room.detach(leaving.peer()),
                room.attach("y", &permissions)
            );
            assert_eq!(room.peer_count().await, 1);
            assert_eq!(room.state(), RoomState::Serving);
            room.detach(joined.peer()).await;
            assert_eq!(room.state(), RoomState::Closing);
        }
        room.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_attached_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let room = Arc::new(
            Room::new(RoomId::parse("scratch"), services(dir.path()), RoomConfig::for_testing())
                .unwrap(),
        );
        room.start().await.unwrap();
        let (server_end, _client) = MemoryChannel::pair();
        let serving = {
            let room = room.clone();
            tokio::spawn(async move { room.serve(&server_end, &Permissions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        room.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
