//! Row-level change events delivered over realtime channels.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::BackendError;
use crate::filter::RowFilter;
use crate::table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Which change kinds a binding listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Only(ChangeKind),
}

impl EventFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "*",
            Self::Only(kind) => kind.as_str(),
        }
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Only(k) => *k == kind,
        }
    }
}

/// Schema bindings and changes use unless configured otherwise.
pub const DEFAULT_SCHEMA: &str = "public";

/// One `postgres_changes` listener inside a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub event: EventFilter,
    pub schema: String,
    pub table: Table,
    pub filter: Option<RowFilter>,
}

impl Binding {
    pub fn all(table: Table) -> Self {
        Self {
            event: EventFilter::All,
            schema: DEFAULT_SCHEMA.to_string(),
            table,
            filter: None,
        }
    }

    pub fn on(kind: ChangeKind, table: Table) -> Self {
        Self {
            event: EventFilter::Only(kind),
            ..Self::all(table)
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn matches(&self, change: &PostgresChange) -> bool {
        change.table == self.table.as_str()
            && change.schema == self.schema
            && self.event.accepts(change.kind)
            && self
                .filter
                .as_ref()
                .is_none_or(|filter| filter.matches(change.row()))
    }

    /// Join-payload representation understood by the realtime server.
    pub fn to_json(&self) -> Value {
        let mut binding = json!({
            "event": self.event.as_str(),
            "schema": self.schema,
            "table": self.table.as_str(),
        });
        if let Some(filter) = &self.filter {
            binding["filter"] = Value::String(filter.to_string());
        }
        binding
    }
}

/// A raw change as sent by the realtime server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChange {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

impl PostgresChange {
    pub fn new(kind: ChangeKind, table: Table, record: Value, old_record: Value) -> Self {
        Self {
            kind,
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.as_str().to_string(),
            record,
            old_record,
            commit_timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    /// The row a filter applies to: the new record, or the old one for deletes.
    pub fn row(&self) -> &Value {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => &self.record,
            ChangeKind::Delete => &self.old_record,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<RowChange<T>, BackendError> {
        let decode = |value: &Value| {
            serde_json::from_value(value.clone())
                .map_err(|e| BackendError::decode(format!("{} {} row", self.table, self.kind.as_str()), e))
        };
        Ok(match self.kind {
            ChangeKind::Insert => RowChange::Insert(decode(&self.record)?),
            ChangeKind::Update => RowChange::Update(decode(&self.record)?),
            ChangeKind::Delete => RowChange::Delete(self.old_record.clone()),
        })
    }
}

/// A typed change. Deletes carry only the old record, which for most
/// tables holds nothing but the primary key.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    Insert(T),
    Update(T),
    Delete(Value),
}

impl<T> RowChange<T> {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Insert(_) => ChangeKind::Insert,
            Self::Update(_) => ChangeKind::Update,
            Self::Delete(_) => ChangeKind::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_payload() -> Value {
        json!({
            "schema": "public",
            "table": "Steps",
            "commit_timestamp": "2024-05-01T10:00:00Z",
            "type": "UPDATE",
            "record": {"id": 4, "name": "Assembly", "process_id": 1},
            "old_record": {"id": 4},
            "columns": [],
            "errors": null
        })
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct StepRow {
        id: i64,
        name: String,
    }

    #[test]
    fn decodes_server_payload() {
        let change: PostgresChange = serde_json::from_value(wire_payload()).unwrap();
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.table, "Steps");
        match change.decode::<StepRow>().unwrap() {
            RowChange::Update(row) => assert_eq!(row, StepRow { id: 4, name: "Assembly".into() }),
            other => panic!("Expected Update, got {:?}", other.kind()),
        }
    }

    #[test]
    fn delete_keeps_old_record() {
        let change = PostgresChange::new(ChangeKind::Delete, Table::Steps, Value::Null, json!({"id": 9}));
        match change.decode::<StepRow>().unwrap() {
            RowChange::Delete(old) => assert_eq!(old["id"], 9),
            other => panic!("Expected Delete, got {:?}", other.kind()),
        }
    }

    #[test]
    fn decode_reports_bad_rows() {
        let change = PostgresChange::new(ChangeKind::Insert, Table::Steps, json!({"id": "x"}), Value::Null);
        assert!(change.decode::<StepRow>().is_err());
    }

    #[test]
    fn binding_matches_table_kind_and_filter() {
        let binding = Binding::on(ChangeKind::Insert, Table::Upload)
            .with_filter(RowFilter::eq("active", true));
        let active = PostgresChange::new(ChangeKind::Insert, Table::Upload, json!({"active": true}), Value::Null);
        let inactive = PostgresChange::new(ChangeKind::Insert, Table::Upload, json!({"active": false}), Value::Null);
        let update = PostgresChange::new(ChangeKind::Update, Table::Upload, json!({"active": true}), Value::Null);
        let other_table = PostgresChange::new(ChangeKind::Insert, Table::Devices, json!({"active": true}), Value::Null);

        assert!(binding.matches(&active));
        assert!(!binding.matches(&inactive));
        assert!(!binding.matches(&update));
        assert!(!binding.matches(&other_table));
    }

    #[test]
    fn binding_only_matches_its_schema() {
        let binding = Binding::all(Table::Steps).in_schema("plant");
        let public = PostgresChange::new(ChangeKind::Insert, Table::Steps, json!({"id": 1}), Value::Null);
        let plant = PostgresChange {
            schema: "plant".into(),
            ..public.clone()
        };
        assert!(!binding.matches(&public));
        assert!(binding.matches(&plant));
        assert_eq!(binding.to_json()["schema"], "plant");
    }

    #[test]
    fn binding_json_includes_filter_only_when_set() {
        let plain = Binding::all(Table::Elements).to_json();
        assert_eq!(plain["event"], "*");
        assert_eq!(plain["table"], "Elements");
        assert!(plain.get("filter").is_none());

        let filtered = Binding::on(ChangeKind::Update, Table::Upload)
            .with_filter(RowFilter::eq("active", false))
            .to_json();
        assert_eq!(filtered["filter"], "active=eq.false");
    }
}
