//! In-process collaboration rooms backed by Automerge documents.
//!
//! When the coordinator runs embedded in the notebook server, an open notebook
//! is hosted as a "room": an Automerge `AutoCommit` document holding the cell
//! list. Tool mutations apply as single tagged transactions, so coordinator
//! edits are distinguishable from other editors in the document history.
//!
//! ## Document schema
//!
//! ```text
//! ROOT/
//!   notebook_id: Str
//!   cells/                      ← List of Map
//!     [i]/
//!       cell_type: Str          ← "code" | "markdown" | "raw"
//!       source: Text            ← Automerge Text CRDT
//!       execution_count: Str    ← JSON-encoded i64 or "null"
//!       outputs/                ← List of Str (JSON-encoded nbformat outputs)
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use automerge::transaction::{CommitOptions, Transactable};
use automerge::{AutoCommit, AutomergeError, ObjId, ObjType, ReadDoc};
use log::debug;
use tokio::sync::broadcast;

use crate::backend::traits::{BackendError, CollabBackend, DocChange, LiveDoc};
use crate::cells::CellRecord;

/// One live notebook document, shared by every viewer of the room.
pub struct RoomDoc {
    doc: StdMutex<AutoCommit>,
    /// Notifies viewers that the document changed (best-effort).
    changed_tx: broadcast::Sender<()>,
}

impl RoomDoc {
    pub fn new(notebook_id: &str) -> Self {
        let mut doc = AutoCommit::new();
        let _ = doc.put(automerge::ROOT, "notebook_id", notebook_id);
        let _ = doc.put_object(automerge::ROOT, "cells", ObjType::List);

        let (changed_tx, _) = broadcast::channel(16);
        Self {
            doc: StdMutex::new(doc),
            changed_tx,
        }
    }

    /// Seed a room from cell records, e.g. the parsed file content at the
    /// moment the notebook was opened.
    pub fn from_records(notebook_id: &str, records: &[CellRecord]) -> Self {
        let room = Self::new(notebook_id);
        {
            let mut doc = room.doc.lock().expect("fresh doc lock");
            for (i, record) in records.iter().enumerate() {
                let _ = insert_cell_at(&mut doc, i, &record.cell_type, &record.source);
                if let Some(count) = record.execution_count {
                    let _ = write_execution_count(&mut doc, i, count);
                }
                for output in &record.outputs {
                    let _ = push_output(&mut doc, i, &output.to_string());
                }
            }
            doc.commit_with(CommitOptions::default().with_message("seed"));
        }
        room
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changed_tx.subscribe()
    }

    fn with_doc<T>(
        &self,
        f: impl FnOnce(&mut AutoCommit) -> Result<T, AutomergeError>,
    ) -> Result<T, BackendError> {
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| BackendError::Conflict("room document lock poisoned".into()))?;
        f(&mut doc).map_err(|e| BackendError::Conflict(e.to_string()))
    }
}

#[async_trait]
impl LiveDoc for RoomDoc {
    async fn cell_count(&self) -> Result<usize, BackendError> {
        self.with_doc(|doc| Ok(cells_list_id(doc).map(|id| doc.length(&id)).unwrap_or(0)))
    }

    async fn cells(&self) -> Result<Vec<CellRecord>, BackendError> {
        self.with_doc(|doc| {
            let cells_id = match cells_list_id(doc) {
                Some(id) => id,
                None => return Ok(vec![]),
            };
            let len = doc.length(&cells_id);
            Ok((0..len)
                .filter_map(|i| read_cell(doc, &cells_id, i))
                .collect())
        })
    }

    async fn cell(&self, index: usize) -> Result<Option<CellRecord>, BackendError> {
        self.with_doc(|doc| {
            let cells_id = match cells_list_id(doc) {
                Some(id) => id,
                None => return Ok(None),
            };
            if index >= doc.length(&cells_id) {
                return Ok(None);
            }
            Ok(read_cell(doc, &cells_id, index))
        })
    }

    async fn apply(&self, change: DocChange, origin: &str) -> Result<(), BackendError> {
        self.with_doc(|doc| {
            match change {
                DocChange::InsertCell {
                    index,
                    cell_type,
                    source,
                } => insert_cell_at(doc, index, &cell_type, &source)?,
                DocChange::DeleteCell { index } => {
                    let cells_id = require_cells(doc)?;
                    doc.delete(&cells_id, index)?;
                }
                DocChange::SetSource { index, source } => {
                    let cells_id = require_cells(doc)?;
                    if let Some(cell_obj) = cell_at_index(doc, &cells_id, index) {
                        if let Some(source_id) = text_id(doc, &cell_obj, "source") {
                            doc.update_text(&source_id, &source)?;
                        }
                    }
                }
                DocChange::ClearOutputs { index } => {
                    let cells_id = require_cells(doc)?;
                    if let Some(cell_obj) = cell_at_index(doc, &cells_id, index) {
                        let _ = doc.delete(&cell_obj, "outputs");
                        doc.put_object(&cell_obj, "outputs", ObjType::List)?;
                        doc.put(&cell_obj, "execution_count", "null")?;
                    }
                }
                DocChange::AppendOutput { index, output } => {
                    push_output(doc, index, &output.to_string())?;
                }
                DocChange::SetExecutionCount { index, count } => {
                    write_execution_count(doc, index, count)?;
                }
            }
            doc.commit_with(CommitOptions::default().with_message(origin));
            Ok(())
        })?;
        let _ = self.changed_tx.send(());
        Ok(())
    }

    async fn sync(&self) -> Result<(), BackendError> {
        // Viewers replicate through the room's sync protocol; nudging the
        // change channel is all that is needed to flush them.
        let _ = self.changed_tx.send(());
        Ok(())
    }
}

// ── Automerge helpers ───────────────────────────────────────────────

fn cells_list_id(doc: &AutoCommit) -> Option<ObjId> {
    doc.get(automerge::ROOT, "cells")
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            automerge::Value::Object(ObjType::List) => Some(id),
            _ => None,
        })
}

fn require_cells(doc: &AutoCommit) -> Result<ObjId, AutomergeError> {
    cells_list_id(doc).ok_or_else(|| AutomergeError::InvalidObjId("cells list not found".into()))
}

fn cell_at_index(doc: &AutoCommit, cells_id: &ObjId, index: usize) -> Option<ObjId> {
    doc.get(cells_id, index)
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            automerge::Value::Object(ObjType::Map) => Some(id),
            _ => None,
        })
}

fn text_id(doc: &AutoCommit, parent: &ObjId, key: &str) -> Option<ObjId> {
    doc.get(parent, key)
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            automerge::Value::Object(ObjType::Text) => Some(id),
            _ => None,
        })
}

fn list_id(doc: &AutoCommit, parent: &ObjId, key: &str) -> Option<ObjId> {
    doc.get(parent, key)
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            automerge::Value::Object(ObjType::List) => Some(id),
            _ => None,
        })
}

fn read_str<P: Into<automerge::Prop>>(doc: &AutoCommit, obj: &ObjId, prop: P) -> Option<String> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, _)| match value {
            automerge::Value::Scalar(s) => match s.as_ref() {
                automerge::ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        })
}

fn insert_cell_at(
    doc: &mut AutoCommit,
    index: usize,
    cell_type: &str,
    source: &str,
) -> Result<(), AutomergeError> {
    let cells_id = require_cells(doc)?;
    let len = doc.length(&cells_id);
    let index = index.min(len);

    let cell_map = doc.insert_object(&cells_id, index, ObjType::Map)?;
    doc.put(&cell_map, "cell_type", cell_type)?;
    let source_id = doc.put_object(&cell_map, "source", ObjType::Text)?;
    if !source.is_empty() {
        doc.splice_text(&source_id, 0, 0, source)?;
    }
    doc.put(&cell_map, "execution_count", "null")?;
    doc.put_object(&cell_map, "outputs", ObjType::List)?;
    Ok(())
}

fn push_output(doc: &mut AutoCommit, index: usize, output: &str) -> Result<(), AutomergeError> {
    let cells_id = require_cells(doc)?;
    if let Some(cell_obj) = cell_at_index(doc, &cells_id, index) {
        if let Some(outputs_id) = list_id(doc, &cell_obj, "outputs") {
            let len = doc.length(&outputs_id);
            doc.insert(&outputs_id, len, output)?;
        }
    }
    Ok(())
}

fn write_execution_count(
    doc: &mut AutoCommit,
    index: usize,
    count: i64,
) -> Result<(), AutomergeError> {
    let cells_id = require_cells(doc)?;
    if let Some(cell_obj) = cell_at_index(doc, &cells_id, index) {
        doc.put(&cell_obj, "execution_count", count.to_string())?;
    }
    Ok(())
}

fn read_cell(doc: &AutoCommit, cells_id: &ObjId, index: usize) -> Option<CellRecord> {
    let cell_obj = cell_at_index(doc, cells_id, index)?;
    let cell_type = read_str(doc, &cell_obj, "cell_type").unwrap_or_default();
    let execution_count = read_str(doc, &cell_obj, "execution_count")
        .and_then(|s| s.parse::<i64>().ok());

    let source = text_id(doc, &cell_obj, "source")
        .and_then(|text_id| doc.text(&text_id).ok())
        .unwrap_or_default();

    let outputs = match list_id(doc, &cell_obj, "outputs") {
        Some(outputs_id) => {
            let len = doc.length(&outputs_id);
            (0..len)
                .filter_map(|i| read_str(doc, &outputs_id, i))
                .filter_map(|s| serde_json::from_str(&s).ok())
                .collect()
        }
        None => vec![],
    };

    Some(CellRecord {
        cell_type,
        source,
        outputs,
        execution_count,
    })
}

// ── Room registry ───────────────────────────────────────────────────

/// The embedded collaboration backend: the table of open rooms.
///
/// The hosting process opens a room when an editor attaches to a notebook and
/// closes it when the last viewer leaves; the coordinator only ever asks
/// whether a room exists and mutates through its `LiveDoc` handle.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: StdMutex<HashMap<String, Arc<RoomDoc>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host-side: open (or reuse) a room seeded with the given cells.
    pub fn open_room(&self, room_id: &str, records: &[CellRecord]) -> Arc<RoomDoc> {
        let mut rooms = self.rooms.lock().expect("room registry lock");
        rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!("[rooms] Opening room {room_id}");
                Arc::new(RoomDoc::from_records(room_id, records))
            })
            .clone()
    }

    /// Host-side: close a room. Returns true if it existed.
    pub fn close_room(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.lock().expect("room registry lock");
        let existed = rooms.remove(room_id).is_some();
        if existed {
            debug!("[rooms] Closed room {room_id}");
        }
        existed
    }
}

#[async_trait]
impl CollabBackend for RoomRegistry {
    async fn has_room(&self, room_id: &str) -> Result<bool, BackendError> {
        let rooms = self
            .rooms
            .lock()
            .map_err(|_| BackendError::Room("room registry lock poisoned".into()))?;
        Ok(rooms.contains_key(room_id))
    }

    async fn get_room(&self, room_id: &str) -> Result<Arc<dyn LiveDoc>, BackendError> {
        let rooms = self
            .rooms
            .lock()
            .map_err(|_| BackendError::Room("room registry lock poisoned".into()))?;
        rooms
            .get(room_id)
            .cloned()
            .map(|room| room as Arc<dyn LiveDoc>)
            .ok_or_else(|| BackendError::Room(format!("no open room for {room_id}")))
    }
}
