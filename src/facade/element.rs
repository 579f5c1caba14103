use std::collections::HashSet;
use std::sync::Arc;

use recast_common::{Database, RowChange};
use tokio::sync::watch;

use super::{ElementPropertyFacade, Facade, ProcessFacade, StepFacade, StepPropertyFacade};
use crate::errors::RecastError;
use crate::models::{Element, ElementProperty, ElementSnapshot, PropertyType};

/// Elements, joined on read with their property rows.
#[derive(Clone)]
pub struct ElementFacade {
    facade: Facade<Element>,
    properties: ElementPropertyFacade,
    processes: ProcessFacade,
    steps: StepFacade,
    step_properties: StepPropertyFacade,
}

impl ElementFacade {
    pub fn new(
        db: Arc<dyn Database>,
        properties: ElementPropertyFacade,
        processes: ProcessFacade,
        steps: StepFacade,
        step_properties: StepPropertyFacade,
    ) -> Self {
        Self {
            facade: Facade::new(db),
            properties,
            processes,
            steps,
            step_properties,
        }
    }

    pub fn facade(&self) -> &Facade<Element> {
        &self.facade
    }

    pub fn properties(&self) -> &ElementPropertyFacade {
        &self.properties
    }

    pub fn processes(&self) -> &ProcessFacade {
        &self.processes
    }

    pub fn steps(&self) -> &StepFacade {
        &self.steps
    }

    pub fn step_properties(&self) -> &StepPropertyFacade {
        &self.step_properties
    }

    pub fn all(&self) -> Vec<Element> {
        self.facade.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Element>> {
        self.facade.subscribe()
    }

    pub fn by_id(&self, id: i64) -> Option<Element> {
        self.facade.by_id(id)
    }

    pub fn snapshot_by_id(&self, id: i64) -> Option<ElementSnapshot> {
        self.by_id(id).map(|element| self.with_properties(element))
    }

    fn with_properties(&self, element: Element) -> ElementSnapshot {
        let properties = element
            .id
            .map(|id| self.properties.by_element_id(id))
            .unwrap_or_default();
        ElementSnapshot {
            element,
            properties,
        }
    }

    pub fn by_process_id(&self, process_id: i64) -> Vec<Element> {
        self.facade.filter(|e| e.process_id == process_id)
    }

    /// Elements currently at `step_id`; `None` selects finished elements.
    pub fn by_process_and_step(&self, process_id: i64, step_id: Option<i64>) -> Vec<Element> {
        self.facade
            .filter(|e| e.process_id == process_id && e.current_step_id == step_id)
    }

    /// Elements that have reached `step_id` or finished, each with only the
    /// properties of steps before `step_id`. `None` selects finished
    /// elements with all their properties.
    pub fn by_process_till_step(
        &self,
        process_id: i64,
        step_id: Option<i64>,
    ) -> Vec<ElementSnapshot> {
        let order: Vec<i64> = self
            .steps
            .by_process_id(process_id)
            .into_iter()
            .filter_map(|s| s.id)
            .collect();
        let index_of = |id: i64| order.iter().position(|s| *s == id);
        let target = step_id.and_then(index_of);

        self.by_process_id(process_id)
            .into_iter()
            .filter(|e| match (e.current_step_id, target) {
                (None, _) => true,
                (Some(current), Some(target)) => index_of(current).is_some_and(|idx| idx <= target),
                (Some(_), None) => false,
            })
            .map(|e| {
                let mut snapshot = self.with_properties(e);
                if let Some(target) = target {
                    snapshot.properties.retain(|prop| {
                        self.step_properties
                            .by_id(prop.step_property_id)
                            .and_then(|sp| index_of(sp.step_id))
                            .is_some_and(|idx| idx < target)
                    });
                }
                snapshot
            })
            .collect()
    }

    /// Finished elements of the first process with this name.
    pub fn finished_by_process_name(&self, process_name: &str) -> Vec<Element> {
        self.processes
            .by_name(process_name)
            .and_then(|p| p.id)
            .map(|id| self.by_process_and_step(id, None))
            .unwrap_or_default()
    }

    pub fn by_bundle_and_process_name(&self, bundle_id: i64, process_name: &str) -> Vec<Element> {
        self.processes
            .by_bundle_id(bundle_id)
            .into_iter()
            .find(|p| p.name == process_name)
            .and_then(|p| p.id)
            .map(|id| self.by_process_id(id))
            .unwrap_or_default()
    }

    /// Upsert the element, then each property with the stored element id.
    pub async fn save_element(&self, snapshot: &ElementSnapshot) -> Result<ElementSnapshot, RecastError> {
        let element = self.facade.upsert(&snapshot.element, None).await?;
        let element_id = element
            .id
            .ok_or_else(|| RecastError::Other(anyhow::anyhow!("stored element has no id")))?;

        let mut properties = Vec::with_capacity(snapshot.properties.len());
        for prop in &snapshot.properties {
            let prop = ElementProperty {
                element_id,
                ..prop.clone()
            };
            properties.push(self.properties.save(&prop).await?);
        }
        tracing::info!(element_id, properties = properties.len(), "element saved");
        Ok(ElementSnapshot {
            element,
            properties,
        })
    }

    /// New element positioned at the first step of its process.
    pub async fn create_element(&self, process_id: i64, name: &str) -> Result<Element, RecastError> {
        let first = self.steps.first_step(process_id).and_then(|s| s.id);
        let snapshot = ElementSnapshot {
            element: Element::new(name, process_id, first),
            properties: Vec::new(),
        };
        Ok(self.save_element(&snapshot).await?.element)
    }

    /// Move to the next step, or finish at the last one. Finished elements
    /// are returned unchanged.
    pub async fn advance(&self, element_id: i64) -> Result<Element, RecastError> {
        let element = self
            .by_id(element_id)
            .ok_or_else(|| RecastError::not_found("Element", element_id))?;
        let Some(current) = element.current_step_id else {
            return Ok(element);
        };
        let next = self.steps.next_step(current).and_then(|s| s.id);
        let moved = Element {
            current_step_id: next,
            ..element
        };
        self.facade.upsert(&moved, None).await
    }

    /// Reposition an element in the local cache only.
    pub fn set_current_step_local(&self, element_id: i64, step_id: Option<i64>) -> Option<Element> {
        let element = Element {
            current_step_id: step_id,
            ..self.by_id(element_id)?
        };
        self.facade.apply(RowChange::Update(element.clone()));
        Some(element)
    }

    pub async fn reload(&self) -> Vec<Element> {
        self.facade.load().await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RecastError> {
        self.facade.delete(id).await
    }

    /// Properties of an element with every reference-typed value replaced by
    /// the referenced element's properties, followed recursively. Elements
    /// already visited are skipped.
    pub fn referenced_properties(&self, element_id: i64) -> Vec<ElementProperty> {
        let mut visited = HashSet::new();
        self.collect_referenced(element_id, &mut visited)
    }

    fn collect_referenced(&self, element_id: i64, visited: &mut HashSet<i64>) -> Vec<ElementProperty> {
        if !visited.insert(element_id) || self.by_id(element_id).is_none() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for prop in self.properties.by_element_id(element_id) {
            let kind = self
                .step_properties
                .by_id(prop.step_property_id)
                .map(|sp| sp.kind)
                .unwrap_or(PropertyType::Text);
            if !ProcessFacade::is_reference(kind) {
                out.push(prop);
                continue;
            }
            let target = prop.value.as_deref().and_then(|v| v.trim().parse::<i64>().ok());
            if let Some(target) = target {
                out.extend(self.collect_referenced(target, visited));
            }
        }
        out
    }
}
