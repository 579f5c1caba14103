use std::sync::Arc;

use recast_common::Database;
use tokio::sync::watch;

use super::Facade;
use crate::errors::RecastError;
use crate::models::ElementProperty;

/// One value per (step property, element) pair.
pub const ELEMENT_PROPERTY_CONFLICT: &str = "step_property_id,element_id";

#[derive(Clone)]
pub struct ElementPropertyFacade {
    facade: Facade<ElementProperty>,
}

impl ElementPropertyFacade {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            facade: Facade::new(db),
        }
    }

    pub fn facade(&self) -> &Facade<ElementProperty> {
        &self.facade
    }

    pub fn all(&self) -> Vec<ElementProperty> {
        self.facade.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ElementProperty>> {
        self.facade.subscribe()
    }

    pub fn by_element_id(&self, element_id: i64) -> Vec<ElementProperty> {
        self.facade.filter(|p| p.element_id == element_id)
    }

    pub fn by_step_property_id(
        &self,
        element_id: i64,
        step_property_id: i64,
    ) -> Option<ElementProperty> {
        self.facade
            .find(|p| p.element_id == element_id && p.step_property_id == step_property_id)
    }

    pub async fn save(&self, prop: &ElementProperty) -> Result<ElementProperty, RecastError> {
        self.facade
            .upsert(prop, Some(ELEMENT_PROPERTY_CONFLICT))
            .await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RecastError> {
        self.facade.delete(id).await
    }
}
