use std::sync::Arc;

use recast_common::Database;
use tokio::sync::watch;

use super::Facade;
use crate::errors::RecastError;
use crate::models::{Process, PropertyType};

#[derive(Clone)]
pub struct ProcessFacade {
    facade: Facade<Process>,
}

impl ProcessFacade {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            facade: Facade::new(db),
        }
    }

    pub fn facade(&self) -> &Facade<Process> {
        &self.facade
    }

    pub fn all(&self) -> Vec<Process> {
        self.facade.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Process>> {
        self.facade.subscribe()
    }

    pub fn by_id(&self, id: i64) -> Option<Process> {
        self.facade.by_id(id)
    }

    /// First process with this exact name.
    pub fn by_name(&self, name: &str) -> Option<Process> {
        self.facade.find(|p| p.name == name)
    }

    pub fn by_bundle_id(&self, bundle_id: i64) -> Vec<Process> {
        self.facade.filter(|p| p.bundle_id == Some(bundle_id))
    }

    pub async fn save(&self, process: &Process) -> Result<Process, RecastError> {
        self.facade.upsert(process, None).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RecastError> {
        self.facade.delete(id).await
    }

    /// Whether values of this type point at another element.
    pub fn is_reference(kind: PropertyType) -> bool {
        matches!(kind, PropertyType::Reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recast_common::Table;
    use recast_common::memory::MemoryBackend;
    use serde_json::json;

    async fn loaded() -> ProcessFacade {
        let db = Arc::new(MemoryBackend::new());
        db.seed(
            Table::Processes,
            vec![
                json!({"id": 1, "name": "Assembly", "bundle_id": 5}),
                json!({"id": 2, "name": "Painting", "bundle_id": 5}),
                json!({"id": 3, "name": "Assembly", "bundle_id": 6}),
                json!({"id": 4, "name": "Loose"}),
            ],
        );
        let processes = ProcessFacade::new(db);
        processes.facade().load().await;
        processes
    }

    #[tokio::test]
    async fn lookups() {
        let processes = loaded().await;
        assert_eq!(processes.by_id(2).unwrap().name, "Painting");
        assert_eq!(processes.by_name("Assembly").unwrap().id, Some(1));
        assert!(processes.by_name("Welding").is_none());
        assert_eq!(processes.by_bundle_id(5).len(), 2);
        assert!(processes.by_bundle_id(99).is_empty());
    }

    #[tokio::test]
    async fn save_assigns_id() {
        let processes = loaded().await;
        let saved = processes.save(&Process::new("Welding", None)).await.unwrap();
        assert_eq!(saved.id, Some(5));
        assert_eq!(processes.by_name("Welding"), Some(saved));
    }

    #[test]
    fn only_reference_types_are_references() {
        assert!(ProcessFacade::is_reference(PropertyType::Reference));
        assert!(!ProcessFacade::is_reference(PropertyType::Text));
        assert!(!ProcessFacade::is_reference(PropertyType::Boolean));
    }
}
