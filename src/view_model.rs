//! Denormalized per-element view models.
//!
//! `compose` joins the latest element, process, step, step-property and
//! element-property collections. `ViewModelService` re-runs it whenever any
//! of them changes and publishes only results that differ.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::errors::RecastError;
use crate::facade::ElementFacade;
use crate::models::{
    Element, ElementProperty, ElementSnapshot, Process, PropertyType, Step, StepProperty,
    StorageBackend, sort_steps,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ViewValue {
    Bool(bool),
    Text(String),
}

impl ViewValue {
    /// Booleans default to `true` only for the literal `"true"`.
    pub fn default_for(kind: PropertyType, default: Option<&str>) -> Self {
        match kind {
            PropertyType::Boolean => ViewValue::Bool(default == Some("true")),
            PropertyType::Text | PropertyType::Reference => {
                ViewValue::Text(default.unwrap_or_default().to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementViewProperty {
    #[serde(rename = "type")]
    pub kind: PropertyType,
    pub label: String,
    pub hint: Option<String>,
    pub step_prop_id: i64,
    pub step_id: i64,
    pub storage_backend: Option<StorageBackend>,
    pub default_value: ViewValue,
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementViewModel {
    pub element: Element,
    pub process: Process,
    pub current_step: Option<Step>,
    pub sorted_steps: Vec<Step>,
    pub properties: Vec<ElementViewProperty>,
    pub storage_backends: Vec<StorageBackend>,
}

/// One view model per element whose process is known, in element order.
pub fn compose(
    elements: &[Element],
    processes: &[Process],
    steps: &[Step],
    step_properties: &[StepProperty],
    element_properties: &[ElementProperty],
) -> Vec<ElementViewModel> {
    let mut steps_by_process: HashMap<i64, Vec<Step>> = HashMap::new();
    for step in steps {
        steps_by_process
            .entry(step.process_id)
            .or_default()
            .push(step.clone());
    }
    for steps in steps_by_process.values_mut() {
        sort_steps(steps);
    }

    elements
        .iter()
        .filter_map(|element| {
            let process = processes
                .iter()
                .find(|p| p.id == Some(element.process_id))?;
            let sorted_steps = steps_by_process
                .get(&element.process_id)
                .cloned()
                .unwrap_or_default();
            let current_step = element
                .current_step_id
                .and_then(|id| sorted_steps.iter().find(|s| s.id == Some(id)).cloned());

            let own_properties: Vec<&ElementProperty> = element_properties
                .iter()
                .filter(|p| element.id == Some(p.element_id))
                .collect();

            let properties: Vec<ElementViewProperty> = sorted_steps
                .iter()
                .filter_map(|s| s.id)
                .flat_map(|step_id| {
                    let mut props: Vec<&StepProperty> =
                        step_properties.iter().filter(|sp| sp.step_id == step_id).collect();
                    props.sort_by_key(|sp| sp.id);
                    props
                })
                .filter_map(|sp| {
                    let step_prop_id = sp.id?;
                    let value_row = own_properties
                        .iter()
                        .find(|p| p.step_property_id == step_prop_id);
                    Some(ElementViewProperty {
                        kind: sp.kind,
                        label: sp.name.clone(),
                        hint: sp.description.clone(),
                        step_prop_id,
                        step_id: sp.step_id,
                        storage_backend: value_row.and_then(|p| p.storage_backend.clone()),
                        default_value: ViewValue::default_for(sp.kind, sp.default_value.as_deref()),
                        value: value_row.and_then(|p| p.value.clone()),
                    })
                })
                .collect();

            let mut storage_backends: Vec<StorageBackend> = Vec::new();
            for backend in properties.iter().filter_map(|p| p.storage_backend.as_ref()) {
                if !storage_backends.contains(backend) {
                    storage_backends.push(backend.clone());
                }
            }

            Some(ElementViewModel {
                element: element.clone(),
                process: process.clone(),
                current_step,
                sorted_steps,
                properties,
                storage_backends,
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct ViewModelService {
    elements: ElementFacade,
    state: Arc<watch::Sender<Vec<ElementViewModel>>>,
}

impl ViewModelService {
    pub fn new(elements: ElementFacade) -> Self {
        let (state, _) = watch::channel(Vec::new());
        Self {
            elements,
            state: Arc::new(state),
        }
    }

    pub fn view_models(&self) -> Vec<ElementViewModel> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ElementViewModel>> {
        self.state.subscribe()
    }

    pub fn by_element_id(&self, element_id: i64) -> Option<ElementViewModel> {
        self.state
            .borrow()
            .iter()
            .find(|vm| vm.element.id == Some(element_id))
            .cloned()
    }

    /// Compose from the current caches. Returns whether the published list changed.
    pub fn recompute(&self) -> bool {
        let next = compose(
            &self.elements.all(),
            &self.elements.processes().all(),
            &self.elements.steps().all(),
            &self.elements.step_properties().all(),
            &self.elements.properties().all(),
        );
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Recompute on every upstream change until aborted.
    pub fn spawn(&self) -> JoinHandle<()> {
        let service = self.clone();
        let mut elements = self.elements.subscribe();
        let mut processes = self.elements.processes().subscribe();
        let mut steps = self.elements.steps().subscribe();
        let mut step_properties = self.elements.step_properties().subscribe();
        let mut element_properties = self.elements.properties().subscribe();

        tokio::spawn(async move {
            service.recompute();
            loop {
                let changed = tokio::select! {
                    r = elements.changed() => r,
                    r = processes.changed() => r,
                    r = steps.changed() => r,
                    r = step_properties.changed() => r,
                    r = element_properties.changed() => r,
                };
                if changed.is_err() {
                    break;
                }
                if service.recompute() {
                    tracing::trace!("view models updated");
                }
            }
        })
    }

    /// Save the element and every property that holds a non-empty value.
    pub async fn save_from_view_model(
        &self,
        view_model: &ElementViewModel,
    ) -> Result<ElementSnapshot, RecastError> {
        let element = Element {
            current_step_id: view_model.current_step.as_ref().and_then(|s| s.id),
            ..view_model.element.clone()
        };
        let element_id = element.id.unwrap_or_default();
        let properties = view_model
            .properties
            .iter()
            .filter(|p| p.value.as_deref().is_some_and(|v| !v.is_empty()))
            .map(|p| ElementProperty {
                id: None,
                element_id,
                step_property_id: p.step_prop_id,
                value: p.value.clone(),
                storage_backend: p.storage_backend.clone(),
            })
            .collect();
        self.elements
            .save_element(&ElementSnapshot {
                element,
                properties,
            })
            .await
    }

    /// Distinct storage backends used by any element of the process.
    pub fn storage_backends_by_process_id(&self, process_id: i64) -> Vec<StorageBackend> {
        let mut backends: Vec<StorageBackend> = Vec::new();
        for vm in self
            .state
            .borrow()
            .iter()
            .filter(|vm| vm.element.process_id == process_id)
        {
            for backend in &vm.storage_backends {
                if !backends.contains(backend) {
                    backends.push(backend.clone());
                }
            }
        }
        backends
    }

    /// Delete an element that has a view model. Unknown ids are a no-op.
    pub async fn delete_element(&self, element_id: i64) -> Result<(), RecastError> {
        if self.by_element_id(element_id).is_none() {
            return Ok(());
        }
        self.elements.delete(element_id).await?;
        self.recompute();
        Ok(())
    }
}
