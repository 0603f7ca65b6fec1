//! # quire-collab: Collaborative editing rooms for files on disk
//!
//! Clients edit files of a directory tree together. Each open file lives in
//! a room holding an authoritative Yrs document; rooms relay sync and
//! awareness messages, persist every update, and write the document back to
//! disk after a quiet period.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Channel    ┌──────────────┐   get_or_create   ┌──────────┐
//! │ client      │ ◄──────────► │ SyncServer   │ ────────────────► │ Registry │
//! │ (yrs doc)   │  y-protocol  │ (WebSocket)  │                   └────┬─────┘
//! └─────────────┘              └──────────────┘                        │
//!                                                                      ▼
//!        ┌────────────────┐   updates   ┌──────────────────────────────────┐
//!        │ UpdateStore    │ ◄────────── │ Room                             │
//!        │ (RocksDB)      │             │  SharedDocument + BroadcastGroup │
//!        └────────────────┘             └───────┬──────────────▲───────────┘
//!                                       save    │              │ changes
//!                                               ▼              │
//!                                  ┌──────────────────┐  ┌─────┴──────────┐
//!                                  │ ContentsManager  │  │ FileIdManager  │
//!                                  │ (files on disk)  │  │ (ids, watcher) │
//!                                  └──────────────────┘  └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: y-protocols compatible framing
//! - [`channel`]: transports (in-memory, WebSocket)
//! - [`document`]: shared documents and content models
//! - [`file_id`]: stable file ids that survive renames
//! - [`storage`]: per-room update log
//! - [`room`] / [`registry`]: room lifecycle
//! - [`server`]: WebSocket accept loop

pub mod broadcast;
pub mod channel;
pub mod config;
pub mod contents;
pub mod document;
pub mod file_id;
pub mod keyed_lock;
pub mod permissions;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Peer};
pub use channel::{Channel, ChannelError, MemoryChannel, WsChannel};
pub use config::{CollabConfig, FileIdConfig, RoomConfig, ServerConfig, StoreConfig};
pub use contents::{
    ContentsError, ContentsManager, FileFormat, FileModel, FsContents, SaveRequest,
};
pub use document::{
    ContentModel, DocumentError, DocumentFactory, NotebookModel, SharedDocument, UnicodeModel,
    UpdateStream,
};
pub use file_id::{ChangeKind, FileChange, FileIdError, FileIdManager, FileWatch, RawChange};
pub use keyed_lock::{KeyedGuard, KeyedLock};
pub use permissions::Permissions;
pub use protocol::{Message, MessageType, ProtocolError, SyncKind, SyncMessage};
pub use registry::{RegistryStats, RoomRegistry};
pub use room::{
    MetadataProvider, Room, RoomError, RoomId, RoomServices, RoomState, RoomStats, Session,
};
pub use server::{Route, ServerStats, SyncServer};
pub use storage::{StoreError, UpdateRecord, UpdateStore};
