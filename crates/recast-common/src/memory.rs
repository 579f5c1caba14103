//! In-process backend for tests.
//!
//! Rows live as JSON objects per table. Every write is echoed to matching
//! subscribers exactly as the realtime server would, so callers observe
//! the same save-then-echo sequence they see against the hosted backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::change::{ChangeKind, PostgresChange};
use crate::error::BackendError;
use crate::filter::RowFilter;
use crate::realtime::{ChangeFeed, ChannelConfig, Subscription};
use crate::rest::Database;
use crate::storage::{ObjectStore, UploadOptions};
use crate::table::Table;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub options: UploadOptions,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<Table, Vec<Value>>,
    next_id: i64,
    subscribers: Vec<(ChannelConfig, mpsc::UnboundedSender<PostgresChange>)>,
    objects: BTreeMap<(String, String), StoredObject>,
    failing: bool,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id = self.next_id.max(0) + 1;
        self.next_id
    }

    fn observe_id(&mut self, row: &Value) {
        if let Some(id) = row.get("id").and_then(Value::as_i64) {
            self.next_id = self.next_id.max(id);
        }
    }

    fn broadcast(&mut self, change: PostgresChange) {
        self.subscribers.retain(|(config, tx)| {
            if !config.matches(&change) {
                return !tx.is_closed();
            }
            tx.send(change.clone()).is_ok()
        });
    }

    fn upsert_one(&mut self, table: Table, mut row: Value, conflict: &[&str]) -> Value {
        let rows = self.tables.entry(table).or_default();
        let existing = rows.iter().position(|stored| {
            conflict.iter().all(|col| match row.get(*col) {
                Some(v) if !v.is_null() => stored.get(*col) == Some(v),
                _ => false,
            })
        });

        match existing {
            Some(idx) => {
                let old = rows[idx].clone();
                if let (Some(target), Some(update)) = (rows[idx].as_object_mut(), row.as_object()) {
                    for (k, v) in update {
                        target.insert(k.clone(), v.clone());
                    }
                }
                let stored = rows[idx].clone();
                let old_key = json!({ "id": old.get("id").cloned().unwrap_or(Value::Null) });
                self.broadcast(PostgresChange::new(ChangeKind::Update, table, stored.clone(), old_key));
                stored
            }
            None => {
                if row.get("id").is_none_or(Value::is_null) {
                    let id = self.allocate_id();
                    row["id"] = json!(id);
                } else {
                    self.observe_id(&row);
                }
                self.tables.entry(table).or_default().push(row.clone());
                self.broadcast(PostgresChange::new(ChangeKind::Insert, table, row.clone(), Value::Null));
                row
            }
        }
    }
}

fn unavailable() -> BackendError {
    BackendError::Status {
        status: 503,
        message: "memory backend unavailable".to_string(),
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store rows without emitting change events. Missing ids are assigned.
    pub fn seed(&self, table: Table, rows: Vec<Value>) {
        let mut state = self.lock();
        for mut row in rows {
            if row.get("id").is_none_or(Value::is_null) && table != Table::Devices {
                let id = state.allocate_id();
                row["id"] = json!(id);
            } else {
                state.observe_id(&row);
            }
            state.tables.entry(table).or_default().push(row);
        }
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    /// Make every subsequent call fail with a 503 until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Deliver a change to subscribers without touching stored rows.
    pub fn emit(&self, change: PostgresChange) {
        self.lock().broadcast(change);
    }

    /// Write a row as another client would: stored and echoed.
    pub fn write_external(&self, table: Table, row: Value) -> Value {
        self.lock().upsert_one(table, row, &["id"])
    }

    /// Delete a row as another client would: removed and echoed.
    pub fn delete_external(&self, table: Table, id: i64) {
        let mut state = self.lock();
        let rows = state.tables.entry(table).or_default();
        let before = rows.len();
        rows.retain(|row| row.get("id").and_then(Value::as_i64) != Some(id));
        if rows.len() != before {
            state.broadcast(PostgresChange::new(ChangeKind::Delete, table, Value::Null, json!({ "id": id })));
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_keys(&self) -> Vec<(String, String)> {
        self.lock().objects.keys().cloned().collect()
    }
}

#[async_trait]
impl Database for MemoryBackend {
    async fn select(&self, table: Table, filters: &[RowFilter]) -> Result<Vec<Value>, BackendError> {
        let state = self.lock();
        if state.failing {
            return Err(unavailable());
        }
        Ok(state
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        table: Table,
        rows: Value,
        on_conflict: Option<&str>,
    ) -> Result<Vec<Value>, BackendError> {
        let mut state = self.lock();
        if state.failing {
            return Err(unavailable());
        }
        let conflict: Vec<&str> = on_conflict
            .map(|cols| cols.split(',').map(str::trim).collect())
            .unwrap_or_else(|| vec!["id"]);
        let rows = match rows {
            Value::Array(rows) => rows,
            row @ Value::Object(_) => vec![row],
            other => {
                return Err(BackendError::Status {
                    status: 400,
                    message: format!("cannot upsert {}", other),
                });
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| state.upsert_one(table, row, &conflict))
            .collect())
    }

    async fn delete(&self, table: Table, filters: &[RowFilter]) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.failing {
            return Err(unavailable());
        }
        if filters.is_empty() {
            return Err(BackendError::InvalidFilter(format!(
                "refusing to delete from {} without a filter",
                table
            )));
        }
        let rows = state.tables.entry(table).or_default();
        let (removed, kept): (Vec<Value>, Vec<Value>) = rows
            .drain(..)
            .partition(|row| filters.iter().all(|f| f.matches(row)));
        *rows = kept;
        for row in removed {
            let old_key = json!({ "id": row.get("id").cloned().unwrap_or(Value::Null) });
            state.broadcast(PostgresChange::new(ChangeKind::Delete, table, Value::Null, old_key));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryBackend {
    async fn subscribe(&self, channel: ChannelConfig) -> Result<Subscription, BackendError> {
        let mut state = self.lock();
        if state.failing {
            return Err(BackendError::Realtime("memory backend unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = channel.topic();
        state.subscribers.push((channel, tx));
        Ok(Subscription::detached(topic, rx))
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: &UploadOptions,
    ) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.failing {
            return Err(unavailable());
        }
        let slot = (bucket.to_string(), key.to_string());
        if state.objects.contains_key(&slot) && !options.upsert {
            return Err(BackendError::Status {
                status: 409,
                message: format!("object {}/{} already exists", bucket, key),
            });
        }
        state.objects.insert(
            slot,
            StoredObject {
                body,
                options: options.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Binding;

    #[tokio::test]
    async fn upsert_assigns_ids_and_echoes_inserts() {
        let db = MemoryBackend::new();
        let mut sub = db
            .subscribe(ChannelConfig::new("steps").on(Binding::all(Table::Steps)))
            .await
            .unwrap();

        let stored = db
            .upsert(Table::Steps, json!({"name": "Cut", "process_id": 1}), None)
            .await
            .unwrap();
        assert_eq!(stored[0]["id"], 1);

        let echo = sub.try_recv().unwrap();
        assert_eq!(echo.kind, ChangeKind::Insert);
        assert_eq!(echo.record["name"], "Cut");
    }

    #[tokio::test]
    async fn upsert_on_conflict_columns_updates_in_place() {
        let db = MemoryBackend::new();
        db.seed(
            Table::ElementProperties,
            vec![json!({"id": 5, "element_id": 1, "step_property_id": 2, "value": "a"})],
        );
        let stored = db
            .upsert(
                Table::ElementProperties,
                json!({"element_id": 1, "step_property_id": 2, "value": "b"}),
                Some("step_property_id, element_id"),
            )
            .await
            .unwrap();
        assert_eq!(stored[0]["id"], 5);
        assert_eq!(stored[0]["value"], "b");
        assert_eq!(db.rows(Table::ElementProperties).len(), 1);
    }

    #[tokio::test]
    async fn seeded_ids_advance_the_allocator() {
        let db = MemoryBackend::new();
        db.seed(Table::Processes, vec![json!({"id": 40, "name": "Old"})]);
        let stored = db
            .upsert(Table::Processes, json!({"name": "New"}), None)
            .await
            .unwrap();
        assert_eq!(stored[0]["id"], 41);
    }

    #[tokio::test]
    async fn delete_echoes_old_key() {
        let db = MemoryBackend::new();
        db.seed(Table::Elements, vec![json!({"id": 3, "name": "E"})]);
        let mut sub = db
            .subscribe(ChannelConfig::new("elements").on(Binding::all(Table::Elements)))
            .await
            .unwrap();
        db.delete(Table::Elements, &[RowFilter::eq("id", 3)]).await.unwrap();
        assert!(db.rows(Table::Elements).is_empty());
        let echo = sub.try_recv().unwrap();
        assert_eq!(echo.kind, ChangeKind::Delete);
        assert_eq!(echo.old_record["id"], 3);
    }

    #[tokio::test]
    async fn failing_mode_rejects_everything() {
        let db = MemoryBackend::new();
        db.set_failing(true);
        assert!(db.select(Table::Steps, &[]).await.is_err());
        assert!(db.upsert(Table::Steps, json!({}), None).await.is_err());
        assert!(db.subscribe(ChannelConfig::new("x")).await.is_err());
        db.set_failing(false);
        assert!(db.select(Table::Steps, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn uploads_refuse_overwrite_unless_upsert() {
        let db = MemoryBackend::new();
        let options = UploadOptions::default();
        db.upload("raw", "run-1/a.csv", b"1".to_vec(), &options).await.unwrap();
        assert!(db.upload("raw", "run-1/a.csv", b"2".to_vec(), &options).await.is_err());
        let overwrite = UploadOptions {
            upsert: true,
            ..UploadOptions::default()
        };
        db.upload("raw", "run-1/a.csv", b"3".to_vec(), &overwrite).await.unwrap();
        assert_eq!(db.object("raw", "run-1/a.csv").unwrap().body, b"3".to_vec());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let db = MemoryBackend::new();
        let sub = db
            .subscribe(ChannelConfig::new("steps").on(Binding::all(Table::Steps)))
            .await
            .unwrap();
        assert_eq!(db.subscriber_count(), 1);
        drop(sub);
        assert_eq!(db.subscriber_count(), 0);
    }
}
