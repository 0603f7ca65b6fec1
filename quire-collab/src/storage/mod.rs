//! Persistent storage for collaborative documents.
//!
//! ```text
//! ┌─────────────┐   updates (in order)   ┌──────────────────────────────┐
//! │ Room        │ ─────────────────────► │ UpdateStore (RocksDB)        │
//! │ broadcaster │                        │  CF "updates" path\0seq → rec │
//! └──────┬──────┘                        │  CF "meta"    version, seq    │
//!        │ on start: replay              └──────────────────────────────┘
//!        ▼
//! ┌─────────────┐
//! │ Yrs Doc     │
//! └─────────────┘
//! ```

pub mod updates;

pub use updates::{StoreError, UpdateRecord, UpdateStore};
