//! Shared document wrapper around a Yrs `Doc`.
//!
//! ```text
//! ┌──────────────────────── SharedDocument ────────────────────────┐
//! │ yrs::Doc                                                       │
//! │   ├── content (shape decided by the ContentModel)              │
//! │   │     file:     Text  "source"                               │
//! │   │     notebook: Map   "meta"  + Array "cells" (JSON cells)   │
//! │   └── Map "state"  (path, dirty, ...)                          │
//! │                                                                │
//! │ observe() ──► UpdateStream  (one v1 update per transaction)    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The merge algorithm itself belongs to Yrs; this module only maps file
//! contents (as `serde_json::Value`) onto a document shape and back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, Doc, GetString, Map, Out, ReadTxn, StateVector, Subscription, Text, Transact,
    TransactionMut, Update,
};

const SOURCE: &str = "source";
const META: &str = "meta";
const CELLS: &str = "cells";
const STATE: &str = "state";

/// Document errors.
#[derive(Debug, Clone, Error)]
pub enum DocumentError {
    #[error("failed to decode CRDT payload: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
    #[error("failed to observe document: {0}")]
    Observe(String),
    #[error("unknown document type '{0}'")]
    UnknownType(String),
    #[error("invalid content for a {doc_type} document: {reason}")]
    InvalidContent { doc_type: String, reason: String },
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

/// Maps between on-disk content and the shape of a Yrs document.
pub trait ContentModel: Send + Sync {
    /// Type name, as used in room ids (`file`, `notebook`).
    fn name(&self) -> &str;

    /// Materialize the current content.
    fn get_source(&self, doc: &Doc) -> Value;

    /// Replace the content, touching as little of the document as possible.
    fn set_source(&self, doc: &Doc, value: &Value) -> Result<(), DocumentError>;
}

/// Plain text, stored in a single Yrs text.
pub struct UnicodeModel;

impl ContentModel for UnicodeModel {
    fn name(&self) -> &str {
        "file"
    }

    fn get_source(&self, doc: &Doc) -> Value {
        let text = doc.get_or_insert_text(SOURCE);
        let txn = doc.transact();
        Value::String(text.get_string(&txn))
    }

    fn set_source(&self, doc: &Doc, value: &Value) -> Result<(), DocumentError> {
        let new = value.as_str().ok_or_else(|| DocumentError::InvalidContent {
            doc_type: self.name().to_string(),
            reason: "expected a string".to_string(),
        })?;
        let text = doc.get_or_insert_text(SOURCE);
        let mut txn = doc.transact_mut();
        let old = text.get_string(&txn);
        if old == new {
            return Ok(());
        }
        let (prefix, suffix) = common_affixes(&old, new);
        let removed = old.len() - prefix - suffix;
        if removed > 0 {
            text.remove_range(&mut txn, prefix as u32, removed as u32);
        }
        let inserted = &new[prefix..new.len() - suffix];
        if !inserted.is_empty() {
            text.insert(&mut txn, prefix as u32, inserted);
        }
        Ok(())
    }
}

/// Jupyter notebook: metadata fields in a map, cells as JSON strings in an
/// array so that concurrent cell insertions and deletions merge.
pub struct NotebookModel;

impl NotebookModel {
    fn invalid(reason: &str) -> DocumentError {
        DocumentError::InvalidContent {
            doc_type: "notebook".to_string(),
            reason: reason.to_string(),
        }
    }
}

impl ContentModel for NotebookModel {
    fn name(&self) -> &str {
        "notebook"
    }

    fn get_source(&self, doc: &Doc) -> Value {
        let meta = doc.get_or_insert_map(META);
        let cells = doc.get_or_insert_array(CELLS);
        let txn = doc.transact();

        let field = |key: &str, default: Value| {
            meta.get(&txn, key)
                .and_then(|out| out_string(&out))
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(default)
        };
        let cells: Vec<Value> = cells
            .iter(&txn)
            .filter_map(|out| out_string(&out))
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect();

        json!({
            "cells": cells,
            "metadata": field("metadata", json!({})),
            "nbformat": field("nbformat", json!(4)),
            "nbformat_minor": field("nbformat_minor", json!(5)),
        })
    }

    fn set_source(&self, doc: &Doc, value: &Value) -> Result<(), DocumentError> {
        let object = value
            .as_object()
            .ok_or_else(|| Self::invalid("expected a JSON object"))?;
        let new_cells: Vec<String> = object
            .get("cells")
            .and_then(Value::as_array)
            .ok_or_else(|| Self::invalid("missing 'cells' array"))?
            .iter()
            .map(Value::to_string)
            .collect();

        let meta = doc.get_or_insert_map(META);
        let cells = doc.get_or_insert_array(CELLS);
        let mut txn = doc.transact_mut();

        for key in ["metadata", "nbformat", "nbformat_minor"] {
            let Some(field) = object.get(key) else {
                continue;
            };
            let encoded = field.to_string();
            let current = meta.get(&txn, key).and_then(|out| out_string(&out));
            if current.as_deref() != Some(encoded.as_str()) {
                meta.insert(&mut txn, key, encoded);
            }
        }

        let old_cells: Vec<String> = cells
            .iter(&txn)
            .map(|out| out_string(&out).unwrap_or_default())
            .collect();
        let prefix = old_cells
            .iter()
            .zip(&new_cells)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_cells.len().min(new_cells.len()) - prefix;
        let suffix = old_cells
            .iter()
            .rev()
            .zip(new_cells.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let removed = old_cells.len() - prefix - suffix;
        if removed > 0 {
            cells.remove_range(&mut txn, prefix as u32, removed as u32);
        }
        for (offset, cell) in new_cells[prefix..new_cells.len() - suffix].iter().enumerate() {
            cells.insert(&mut txn, (prefix + offset) as u32, cell.clone());
        }
        Ok(())
    }
}

fn out_string(out: &Out) -> Option<String> {
    match out {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// Byte lengths of the longest common prefix and suffix of two strings,
/// both on char boundaries and never overlapping.
fn common_affixes(old: &str, new: &str) -> (usize, usize) {
    let prefix: usize = old
        .chars()
        .zip(new.chars())
        .take_while(|(a, b)| a == b)
        .map(|(a, _)| a.len_utf8())
        .sum();
    let max_suffix = old.len().min(new.len()) - prefix;
    let mut suffix = 0;
    for (a, b) in old[prefix..].chars().rev().zip(new[prefix..].chars().rev()) {
        if a != b || suffix + a.len_utf8() > max_suffix {
            break;
        }
        suffix += a.len_utf8();
    }
    (prefix, suffix)
}

/// Receiver of the v1 updates produced by every committed transaction.
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl UpdateStream {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

/// A replicated document plus the content model that gives it meaning.
pub struct SharedDocument {
    doc: Doc,
    model: Arc<dyn ContentModel>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SharedDocument {
    pub fn new(model: Arc<dyn ContentModel>) -> Self {
        Self {
            doc: Doc::new(),
            model,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn doc_type(&self) -> &str {
        self.model.name()
    }

    pub fn get_source(&self) -> Value {
        self.model.get_source(&self.doc)
    }

    pub fn set_source(&self, value: &Value) -> Result<(), DocumentError> {
        self.model.set_source(&self.doc, value)
    }

    /// Encoded state vector (payload of a sync step 1).
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything the holder of `state_vector` is missing (sync step 2).
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let sv = StateVector::decode_v1(state_vector)?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Full state as a single update.
    pub fn full_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))
    }

    /// Run `f` inside one write transaction; observers see a single update.
    pub fn transact<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&mut TransactionMut) -> T,
    {
        let mut txn = self.doc.transact_mut();
        f(&mut txn)
    }

    /// Subscribe to committed updates. The subscription lives until
    /// [`SharedDocument::unobserve_all`] is called.
    pub fn observe(&self) -> Result<UpdateStream, DocumentError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .doc
            .observe_update_v1(move |_, event| {
                let _ = tx.send(event.update.clone());
            })
            .map_err(|e| DocumentError::Observe(e.to_string()))?;
        self.subscriptions.lock().push(subscription);
        Ok(UpdateStream { rx })
    }

    pub fn unobserve_all(&self) {
        self.subscriptions.lock().clear();
    }

    /// Document-level state shared with clients (`path`, `dirty`, ...).
    pub fn set_state(&self, key: &str, value: impl Into<Any>) {
        let state = self.doc.get_or_insert_map(STATE);
        let mut txn = self.doc.transact_mut();
        state.insert(&mut txn, key, value.into());
    }

    pub fn get_state(&self, key: &str) -> Option<Any> {
        let state = self.doc.get_or_insert_map(STATE);
        let txn = self.doc.transact();
        match state.get(&txn, key) {
            Some(Out::Any(any)) => Some(any),
            _ => None,
        }
    }
}

/// Explicit registry of content models, keyed by document type.
#[derive(Clone)]
pub struct DocumentFactory {
    models: HashMap<String, Arc<dyn ContentModel>>,
}

impl Default for DocumentFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl DocumentFactory {
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    /// `file` and `notebook`.
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        factory.register(Arc::new(UnicodeModel));
        factory.register(Arc::new(NotebookModel));
        factory
    }

    pub fn register(&mut self, model: Arc<dyn ContentModel>) {
        self.models.insert(model.name().to_string(), model);
    }

    pub fn supports(&self, doc_type: &str) -> bool {
        self.models.contains_key(doc_type)
    }

    pub fn create(&self, doc_type: &str) -> Result<SharedDocument, DocumentError> {
        let model = self
            .models
            .get(doc_type)
            .ok_or_else(|| DocumentError::UnknownType(doc_type.to_string()))?;
        Ok(SharedDocument::new(model.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notebook(cells: &[&str]) -> Value {
        let cells: Vec<Value> = cells
            .iter()
            .map(|src| json!({"cell_type": "code", "source": src, "metadata": {}, "outputs": []}))
            .collect();
        json!({"cells": cells, "metadata": {"kernelspec": {"name": "python3"}}, "nbformat": 4, "nbformat_minor": 5})
    }

    #[test]
    fn test_common_affixes() {
        assert_eq!(common_affixes("hello world", "hello brave world"), (6, 5));
        assert_eq!(common_affixes("aaa", "aa"), (2, 0));
        assert_eq!(common_affixes("", "abc"), (0, 0));
        // Multibyte characters stay on boundaries.
        assert_eq!(common_affixes("héllo", "hallo"), (1, 3));
    }

    #[test]
    fn test_text_set_and_get() {
        let doc = DocumentFactory::with_defaults().create("file").unwrap();
        doc.set_source(&json!("hello world")).unwrap();
        doc.set_source(&json!("hello brave world")).unwrap();
        assert_eq!(doc.get_source(), json!("hello brave world"));
        assert!(doc.set_source(&json!(42)).is_err());
    }

    #[test]
    fn test_notebook_roundtrip() {
        let doc = DocumentFactory::with_defaults().create("notebook").unwrap();
        let nb = notebook(&["print(1)", "x = 2"]);
        doc.set_source(&nb).unwrap();
        assert_eq!(doc.get_source(), nb);

        let edited = notebook(&["print(1)", "y = 3", "x = 2"]);
        doc.set_source(&edited).unwrap();
        assert_eq!(doc.get_source(), edited);
    }

    #[test]
    fn test_notebook_rejects_non_object() {
        let doc = DocumentFactory::with_defaults().create("notebook").unwrap();
        assert!(doc.set_source(&json!("text")).is_err());
        assert!(doc.set_source(&json!({"metadata": {}})).is_err());
    }

    #[test]
    fn test_sync_between_documents() {
        let factory = DocumentFactory::with_defaults();
        let a = factory.create("file").unwrap();
        let b = factory.create("file").unwrap();
        a.set_source(&json!("shared")).unwrap();

        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_update(&diff).unwrap();
        assert_eq!(b.get_source(), json!("shared"));
        assert!(!b.full_update().is_empty());
    }

    #[tokio::test]
    async fn test_observe_emits_one_update_per_transaction() {
        let doc = DocumentFactory::with_defaults().create("file").unwrap();
        let mut updates = doc.observe().unwrap();
        doc.set_source(&json!("abc")).unwrap();
        doc.set_source(&json!("abc")).unwrap(); // no change, no update

        let first = updates.recv().await.unwrap();
        assert!(updates.try_recv().is_none());

        let replica = DocumentFactory::with_defaults().create("file").unwrap();
        replica.apply_update(&first).unwrap();
        assert_eq!(replica.get_source(), json!("abc"));

        doc.unobserve_all();
        doc.set_source(&json!("abcd")).unwrap();
        assert!(updates.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_transact_groups_mutations_into_one_update() {
        let doc = DocumentFactory::with_defaults().create("file").unwrap();
        let mut updates = doc.observe().unwrap();
        let source = doc.doc.get_or_insert_text(SOURCE);

        let len = doc.transact(|txn| {
            source.insert(txn, 0, "ab");
            source.insert(txn, 2, "cd");
            source.len(txn)
        });
        assert_eq!(len, 4);
        assert_eq!(doc.get_source(), json!("abcd"));

        let update = updates.recv().await.unwrap();
        assert!(updates.try_recv().is_none());
        let replica = DocumentFactory::with_defaults().create("file").unwrap();
        replica.apply_update(&update).unwrap();
        assert_eq!(replica.get_source(), json!("abcd"));
    }

    #[test]
    fn test_state_map() {
        let doc = DocumentFactory::with_defaults().create("file").unwrap();
        doc.set_state("path", "notes/a.txt".to_string());
        doc.set_state("dirty", false);
        assert_eq!(doc.get_state("path"), Some(Any::from("notes/a.txt".to_string())));
        assert_eq!(doc.get_state("dirty"), Some(Any::Bool(false)));
        // State does not leak into the content.
        assert_eq!(doc.get_source(), json!(""));
    }

    #[test]
    fn test_unknown_type() {
        let factory = DocumentFactory::with_defaults();
        assert!(factory.supports("notebook"));
        assert!(matches!(factory.create("spreadsheet"), Err(DocumentError::UnknownType(_))));
    }
}
