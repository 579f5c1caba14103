//! Row types for every synced table.
//!
//! Field names match the database columns, so rows decode with plain serde
//! derives. Server-assigned ids are `None` until the first upsert returns.

use std::fmt;

use chrono::{DateTime, Utc};
use recast_common::{Binding, ChangeKind, Table};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A row type cached by a `Facade`.
pub trait Entity:
    Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Id: Copy
        + PartialEq
        + fmt::Display
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    const TABLE: Table;
    /// Realtime channel name.
    const CHANNEL: &'static str;
    /// Display name used in errors.
    const NAME: &'static str;

    fn id(&self) -> Option<Self::Id>;

    /// Change events the facade listens to.
    fn binding() -> Binding {
        Binding::all(Self::TABLE)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub bundle_id: Option<i64>,
    #[serde(default, skip_serializing)]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing)]
    pub updated_at: Option<String>,
}

impl Process {
    pub fn new(name: impl Into<String>, bundle_id: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.into(),
            bundle_id,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Process {
    type Id = i64;
    const TABLE: Table = Table::Processes;
    const CHANNEL: &'static str = "process-change";
    const NAME: &'static str = "Process";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub process_id: i64,
    #[serde(default)]
    pub seq_number: Option<i64>,
    #[serde(default, skip_serializing)]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing)]
    pub updated_at: Option<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, process_id: i64, seq_number: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.into(),
            process_id,
            seq_number,
            created_at: None,
            updated_at: None,
        }
    }
}

impl Entity for Step {
    type Id = i64;
    const TABLE: Table = Table::Steps;
    const CHANNEL: &'static str = "step-change";
    const NAME: &'static str = "Step";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

/// Order steps by `seq_number`, then id. Unnumbered steps go last.
pub fn sort_steps(steps: &mut [Step]) {
    steps.sort_by_key(|s| (s.seq_number.is_none(), s.seq_number, s.id));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    #[default]
    Text,
    Boolean,
    /// The value holds the id of another element.
    Reference,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyType::Text => write!(f, "text"),
            PropertyType::Boolean => write!(f, "boolean"),
            PropertyType::Reference => write!(f, "reference"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProperty {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub step_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: PropertyType,
}

impl Entity for StepProperty {
    type Id = i64;
    const TABLE: Table = Table::StepProperties;
    const CHANNEL: &'static str = "step-property-change";
    const NAME: &'static str = "Step property";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub process_id: i64,
    /// `None` once the element has passed the last step.
    #[serde(default)]
    pub current_step_id: Option<i64>,
}

impl Element {
    pub fn new(name: impl Into<String>, process_id: i64, current_step_id: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.into(),
            process_id,
            current_step_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_step_id.is_none()
    }
}

impl Entity for Element {
    type Id = i64;
    const TABLE: Table = Table::Elements;
    const CHANNEL: &'static str = "element-change";
    const NAME: &'static str = "Element";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

/// Where a property value is stored. Any tag the database holds round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageBackend(pub String);

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementProperty {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub element_id: i64,
    pub step_property_id: i64,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub storage_backend: Option<StorageBackend>,
}

impl ElementProperty {
    pub fn new(element_id: i64, step_property_id: i64, value: impl Into<String>) -> Self {
        Self {
            id: None,
            element_id,
            step_property_id,
            value: Some(value.into()),
            storage_backend: None,
        }
    }
}

impl Entity for ElementProperty {
    type Id = i64;
    const TABLE: Table = Table::ElementProperties;
    const CHANNEL: &'static str = "element-property-change";
    const NAME: &'static str = "Element property";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity for Profile {
    type Id = Uuid;
    const TABLE: Table = Table::Profiles;
    const CHANNEL: &'static str = "profiles-changes";
    const NAME: &'static str = "Profile";

    fn id(&self) -> Option<Uuid> {
        Some(self.id)
    }

    fn binding() -> Binding {
        Binding::on(ChangeKind::Update, Table::Profiles)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default, skip_serializing)]
    pub created_at: Option<String>,
}

impl Bundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            created_at: None,
        }
    }
}

impl Entity for Bundle {
    type Id = i64;
    const TABLE: Table = Table::Bundles;
    const CHANNEL: &'static str = "bundle-change";
    const NAME: &'static str = "Bundle";

    fn id(&self) -> Option<i64> {
        self.id
    }
}

/// An element together with its property rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementSnapshot {
    pub element: Element,
    pub properties: Vec<ElementProperty>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unsaved_rows_omit_id_and_server_columns() {
        let process = Process::new("Assembly", Some(3));
        let value = serde_json::to_value(&process).unwrap();
        assert_eq!(value, json!({"name": "Assembly", "bundle_id": 3}));
    }

    #[test]
    fn finished_element_serializes_null_step() {
        let element = Element {
            id: Some(7),
            name: "E-7".into(),
            process_id: 1,
            current_step_id: None,
        };
        let value = serde_json::to_value(&element).unwrap();
        assert_eq!(value["current_step_id"], serde_json::Value::Null);
        assert!(element.is_finished());
    }

    #[test]
    fn step_property_type_column_maps_to_kind() {
        let prop: StepProperty = serde_json::from_value(json!({
            "id": 1, "step_id": 2, "name": "Approved", "type": "boolean", "default_value": "true"
        }))
        .unwrap();
        assert_eq!(prop.kind, PropertyType::Boolean);

        let untyped: StepProperty =
            serde_json::from_value(json!({"id": 2, "step_id": 2, "name": "Note"})).unwrap();
        assert_eq!(untyped.kind, PropertyType::Text);
    }

    #[test]
    fn unknown_columns_are_ignored() {
        let element: Element = serde_json::from_value(json!({
            "id": 1, "name": "E", "process_id": 2, "current_step_id": 3, "created_at": "2024-01-01"
        }))
        .unwrap();
        assert_eq!(element.current_step_id, Some(3));
    }

    #[test]
    fn storage_backend_round_trips_any_tag() {
        let prop: ElementProperty = serde_json::from_value(json!({
            "id": 1, "element_id": 2, "step_property_id": 3, "value": "x", "storage_backend": "timescale"
        }))
        .unwrap();
        assert_eq!(prop.storage_backend, Some(StorageBackend("timescale".into())));
        let back = serde_json::to_value(&prop).unwrap();
        assert_eq!(back["storage_backend"], "timescale");
    }

    #[test]
    fn steps_sort_by_seq_number_then_id() {
        let mut steps = vec![
            Step { id: Some(4), ..Step::new("d", 1, None) },
            Step { id: Some(3), ..Step::new("c", 1, Some(2)) },
            Step { id: Some(1), ..Step::new("a", 1, Some(2)) },
            Step { id: Some(2), ..Step::new("b", 1, Some(1)) },
        ];
        sort_steps(&mut steps);
        let ids: Vec<_> = steps.iter().map(|s| s.id.unwrap()).collect();
        assert_eq!(ids, vec![2, 1, 3, 4]);
    }

    #[test]
    fn profile_listens_for_updates_only() {
        let binding = Profile::binding();
        assert_eq!(binding.table, Table::Profiles);
        assert!(!binding.event.accepts(ChangeKind::Insert));
        assert!(binding.event.accepts(ChangeKind::Update));
    }
}
