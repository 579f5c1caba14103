use std::sync::Arc;

use recast_common::Database;
use tokio::sync::watch;

use super::{Facade, StepFacade};
use crate::errors::RecastError;
use crate::models::StepProperty;

#[derive(Clone)]
pub struct StepPropertyFacade {
    facade: Facade<StepProperty>,
    steps: StepFacade,
}

impl StepPropertyFacade {
    pub fn new(db: Arc<dyn Database>, steps: StepFacade) -> Self {
        Self {
            facade: Facade::new(db),
            steps,
        }
    }

    pub fn facade(&self) -> &Facade<StepProperty> {
        &self.facade
    }

    pub fn all(&self) -> Vec<StepProperty> {
        self.facade.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<StepProperty>> {
        self.facade.subscribe()
    }

    pub fn by_id(&self, id: i64) -> Option<StepProperty> {
        self.facade.by_id(id)
    }

    pub fn by_step_id(&self, step_id: i64) -> Vec<StepProperty> {
        let mut props = self.facade.filter(|p| p.step_id == step_id);
        props.sort_by_key(|p| p.id);
        props
    }

    /// Properties of every step of a process, in step order.
    pub fn by_process_id(&self, process_id: i64) -> Vec<StepProperty> {
        self.steps
            .by_process_id(process_id)
            .into_iter()
            .filter_map(|step| step.id)
            .flat_map(|step_id| self.by_step_id(step_id))
            .collect()
    }

    pub async fn save(&self, prop: &StepProperty) -> Result<StepProperty, RecastError> {
        self.facade.upsert(prop, None).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RecastError> {
        self.facade.delete(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recast_common::Table;
    use recast_common::memory::MemoryBackend;
    use serde_json::json;

    #[tokio::test]
    async fn properties_follow_step_order() {
        let db = Arc::new(MemoryBackend::new());
        db.seed(
            Table::Steps,
            vec![
                json!({"id": 10, "name": "Second", "process_id": 1, "seq_number": 2}),
                json!({"id": 11, "name": "First", "process_id": 1, "seq_number": 1}),
            ],
        );
        db.seed(
            Table::StepProperties,
            vec![
                json!({"id": 3, "step_id": 10, "name": "c"}),
                json!({"id": 2, "step_id": 11, "name": "b"}),
                json!({"id": 1, "step_id": 11, "name": "a"}),
                json!({"id": 4, "step_id": 99, "name": "orphan"}),
            ],
        );
        let steps = StepFacade::new(db.clone());
        let props = StepPropertyFacade::new(db, steps.clone());
        steps.facade().load().await;
        props.facade().load().await;

        let names: Vec<_> = props.by_process_id(1).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(props.by_step_id(11).len(), 2);
        assert_eq!(props.by_id(4).unwrap().name, "orphan");
    }
}
