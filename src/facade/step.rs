use std::sync::Arc;

use recast_common::Database;
use tokio::sync::watch;

use super::Facade;
use crate::errors::RecastError;
use crate::models::{Step, sort_steps};

#[derive(Clone)]
pub struct StepFacade {
    facade: Facade<Step>,
}

impl StepFacade {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            facade: Facade::new(db),
        }
    }

    pub fn facade(&self) -> &Facade<Step> {
        &self.facade
    }

    pub fn all(&self) -> Vec<Step> {
        self.facade.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Step>> {
        self.facade.subscribe()
    }

    pub fn by_id(&self, id: i64) -> Option<Step> {
        self.facade.by_id(id)
    }

    /// Steps of a process in execution order.
    pub fn by_process_id(&self, process_id: i64) -> Vec<Step> {
        let mut steps = self.facade.filter(|s| s.process_id == process_id);
        sort_steps(&mut steps);
        steps
    }

    pub fn first_step(&self, process_id: i64) -> Option<Step> {
        self.by_process_id(process_id).into_iter().next()
    }

    /// The step after `step_id` in its process, or `None` at the last step.
    pub fn next_step(&self, step_id: i64) -> Option<Step> {
        let step = self.by_id(step_id)?;
        let steps = self.by_process_id(step.process_id);
        let idx = steps.iter().position(|s| s.id == Some(step_id))?;
        steps.into_iter().nth(idx + 1)
    }

    /// Index of `step_id` within its process order.
    pub fn position(&self, step_id: i64) -> Option<usize> {
        let step = self.by_id(step_id)?;
        self.by_process_id(step.process_id)
            .iter()
            .position(|s| s.id == Some(step_id))
    }

    pub async fn save(&self, step: &Step) -> Result<Step, RecastError> {
        self.facade.upsert(step, None).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RecastError> {
        self.facade.delete(id).await
    }
}
