//! Process-wide table of live rooms.
//!
//! Creation and removal of a room id both happen under that id's
//! [`KeyedLock`] entry, so there is never more than one room per id and a
//! room that regains a channel while its removal is pending stays alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::Channel;
use crate::config::RoomConfig;
use crate::contents::FileFormat;
use crate::keyed_lock::KeyedLock;
use crate::permissions::Permissions;
use crate::room::{IdleReport, Room, RoomError, RoomId, RoomServices};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_rooms: usize,
    pub rooms_created: u64,
    pub rooms_closed: u64,
}

pub struct RoomRegistry {
    services: RoomServices,
    config: RoomConfig,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    locks: KeyedLock<String>,
    idle_tx: mpsc::UnboundedSender<IdleReport>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    rooms_created: AtomicU64,
    rooms_closed: AtomicU64,
}

impl RoomRegistry {
    /// Create the registry and spawn its supervisor, which closes rooms
    /// whose grace period expired. Must be called inside a tokio runtime.
    pub fn new(services: RoomServices, config: RoomConfig) -> Arc<Self> {
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Self {
            services,
            config,
            rooms: Mutex::new(HashMap::new()),
            locks: KeyedLock::new(),
            idle_tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            rooms_created: AtomicU64::new(0),
            rooms_closed: AtomicU64::new(0),
        });
        registry.tracker.spawn(Self::supervise(
            Arc::downgrade(&registry),
            idle_rx,
            registry.cancel.clone(),
        ));
        registry
    }

    async fn supervise(
        registry: Weak<Self>,
        mut idle_rx: mpsc::UnboundedReceiver<IdleReport>,
        cancel: CancellationToken,
    ) {
        loop {
            let (key, generation) = tokio::select! {
                _ = cancel.cancelled() => break,
                report = idle_rx.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };
            let Some(registry) = registry.upgrade() else {
                break;
            };
            registry.close_if_idle(&key, generation).await;
        }
        log::debug!("Room supervisor stopped");
    }

    /// The live room for `id`, creating and starting it when needed.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<Room>, RoomError> {
        let _guard = self.locks.lock(id.to_string()).await;
        self.get_or_create_locked(id).await
    }

    async fn get_or_create_locked(&self, id: &str) -> Result<Arc<Room>, RoomError> {
        if let Some(room) = self.get(id) {
            return Ok(room);
        }
        if self.cancel.is_cancelled() {
            return Err(RoomError::Closed);
        }

        let room = Room::new(RoomId::parse(id), self.services.clone(), self.config.clone())?
            .supervised(self.idle_tx.clone(), &self.cancel);
        let room = Arc::new(room);
        room.start().await?;

        self.rooms.lock().insert(id.to_string(), room.clone());
        self.rooms_created.fetch_add(1, Ordering::Relaxed);
        log::info!("Created room {id}");
        Ok(room)
    }

    /// Serve `channel` in room `id` until it disconnects.
    pub async fn serve(
        &self,
        id: &str,
        channel: &dyn Channel,
        permissions: Permissions,
    ) -> Result<(), RoomError> {
        let (room, session) = {
            let _guard = self.locks.lock(id.to_string()).await;
            let room = self.get_or_create_locked(id).await?;
            let session = room.attach(channel.id(), &permissions).await;
            (room, session)
        };
        room.run_session(session, channel).await;
        Ok(())
    }

    /// Room id for the file at `path`, indexing the path when needed.
    pub async fn open_session(
        &self,
        path: &str,
        format: FileFormat,
        doc_type: &str,
    ) -> Result<String, RoomError> {
        if !self.services.factory.supports(doc_type) {
            return Err(RoomError::UnsupportedType(doc_type.to_string()));
        }
        let file_ids = self.services.file_ids.as_ref().ok_or(RoomError::NoFileIds)?;
        let file_id = file_ids
            .index(path)
            .await?
            .ok_or_else(|| RoomError::FileNotFound(path.to_string()))?;
        Ok(RoomId::file(format, doc_type, file_id).to_string())
    }

    /// Close room `id` if the grace timer of `generation` expired and
    /// nobody came back since.
    async fn close_if_idle(&self, id: &str, generation: u64) -> bool {
        let _guard = self.locks.lock(id.to_string()).await;
        let Some(room) = self.get(id) else {
            return false;
        };
        if !room.close_pending(generation).await {
            log::debug!("Room {id} is in use again, keeping it");
            return false;
        }
        room.stop().await;
        self.rooms.lock().remove(id);
        self.rooms_closed.fetch_add(1, Ordering::Relaxed);
        log::info!("Removed idle room {id}");
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_rooms: self.len(),
            rooms_created: self.rooms_created.load(Ordering::Relaxed),
            rooms_closed: self.rooms_closed.load(Ordering::Relaxed),
        }
    }

    /// Stop every room and the supervisor. Later `get_or_create` calls fail.
    pub async fn shutdown(&self) {
        log::info!("Shutting down {} rooms", self.len());
        self.cancel.cancel();
        let rooms: Vec<(String, Arc<Room>)> = self.rooms.lock().drain().collect();
        for (id, room) in rooms {
            let _guard = self.locks.lock(id).await;
            room.stop().await;
            self.rooms_closed.fetch_add(1, Ordering::Relaxed);
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use crate::contents::FsContents;
    use crate::room::RoomState;
    use std::time::Duration;

    fn registry(dir: &std::path::Path, config: RoomConfig) -> Arc<RoomRegistry> {
        RoomRegistry::new(RoomServices::new(Arc::new(FsContents::new(dir))), config)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_room() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), RoomConfig::for_testing());
        let a = registry.get_or_create("lobby").await.unwrap();
        let b = registry.get_or_create("lobby").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().rooms_created, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_start_leaves_no_room() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), RoomConfig::for_testing());
        // No file id manager configured.
        assert!(registry.get_or_create("text:file:abc").await.is_err());
        assert!(registry.is_empty());
        assert!(registry.locks.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_room_is_removed_after_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), RoomConfig::for_testing());
        let (server_end, client) = MemoryChannel::pair();
        drop(client);
        registry
            .serve("lobby", &server_end, Permissions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(registry.get("lobby").is_none());
        assert_eq!(registry.stats().rooms_closed, 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_if_idle_keeps_serving_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), RoomConfig::for_testing());
        registry.get_or_create("lobby").await.unwrap();
        assert!(!registry.close_if_idle("lobby", 0).await);
        assert!(!registry.close_if_idle("missing", 0).await);
        assert_eq!(registry.len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), RoomConfig::for_testing());
        let room = registry.get_or_create("lobby").await.unwrap();
        registry.shutdown().await;
        assert_eq!(room.state(), RoomState::Closed);
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get_or_create("lobby").await,
            Err(RoomError::Closed)
        ));
    }
}
