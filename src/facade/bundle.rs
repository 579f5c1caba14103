use std::path::Path;
use std::sync::Arc;

use recast_common::Database;
use tokio::sync::watch;

use super::{Facade, ProcessFacade, StepFacade, StepPropertyFacade};
use crate::errors::RecastError;
use crate::import::{ProcessDefinition, load_definitions};
use crate::models::{Bundle, Process, Step, StepProperty};

#[derive(Clone)]
pub struct BundleFacade {
    facade: Facade<Bundle>,
    processes: ProcessFacade,
    steps: StepFacade,
    step_properties: StepPropertyFacade,
}

impl BundleFacade {
    pub fn new(
        db: Arc<dyn Database>,
        processes: ProcessFacade,
        steps: StepFacade,
        step_properties: StepPropertyFacade,
    ) -> Self {
        Self {
            facade: Facade::new(db),
            processes,
            steps,
            step_properties,
        }
    }

    pub fn facade(&self) -> &Facade<Bundle> {
        &self.facade
    }

    pub fn all(&self) -> Vec<Bundle> {
        self.facade.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Bundle>> {
        self.facade.subscribe()
    }

    pub fn by_id(&self, id: i64) -> Option<Bundle> {
        self.facade.by_id(id)
    }

    pub async fn save(&self, bundle: &Bundle) -> Result<Bundle, RecastError> {
        self.facade.upsert(bundle, None).await
    }

    pub async fn delete(&self, id: i64) -> Result<(), RecastError> {
        self.facade.delete(id).await
    }

    /// Create a bundle, then its processes, steps and step properties in
    /// file order. Steps without a `seq_number` are numbered by position.
    /// Stops at the first failed write; rows written so far remain.
    pub async fn save_processes_as_bundle(
        &self,
        name: &str,
        definitions: &[ProcessDefinition],
    ) -> Result<Bundle, RecastError> {
        if name.trim().is_empty() {
            return Err(RecastError::InvalidBundle("bundle name is empty".into()));
        }
        if definitions.is_empty() {
            return Err(RecastError::InvalidBundle("no processes defined".into()));
        }

        let bundle = self.save(&Bundle::new(name)).await?;
        let bundle_id = stored_id(bundle.id, "Bundle")?;

        for definition in definitions {
            let process = self
                .processes
                .save(&Process::new(&definition.name, Some(bundle_id)))
                .await?;
            let process_id = stored_id(process.id, "Process")?;

            for (position, step_def) in definition.steps.iter().enumerate() {
                let seq_number = step_def.seq_number.unwrap_or(position as i64 + 1);
                let step = self
                    .steps
                    .save(&Step::new(&step_def.name, process_id, Some(seq_number)))
                    .await?;
                let step_id = stored_id(step.id, "Step")?;

                for prop_def in &step_def.step_properties {
                    let prop = StepProperty {
                        id: None,
                        step_id,
                        name: prop_def.name.clone(),
                        description: prop_def.description.clone(),
                        default_value: prop_def.default_value.clone(),
                        kind: prop_def.kind,
                    };
                    self.step_properties.save(&prop).await?;
                }
            }
        }

        tracing::info!(bundle_id, name, processes = definitions.len(), "bundle saved");
        Ok(bundle)
    }

    /// Import a YAML or JSON bundle file named after its file stem.
    pub async fn import_file(&self, path: &Path) -> Result<Bundle, RecastError> {
        let (name, definitions) = load_definitions(path)?;
        self.save_processes_as_bundle(&name, &definitions).await
    }
}

fn stored_id(id: Option<i64>, entity: &'static str) -> Result<i64, RecastError> {
    id.ok_or_else(|| RecastError::Other(anyhow::anyhow!("stored {} has no id", entity)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{StepDefinition, StepPropertyDefinition};
    use crate::models::PropertyType;
    use recast_common::Table;
    use recast_common::memory::MemoryBackend;
    use tempfile::tempdir;

    fn bundles(db: &Arc<MemoryBackend>) -> BundleFacade {
        let processes = ProcessFacade::new(db.clone());
        let steps = StepFacade::new(db.clone());
        let step_properties = StepPropertyFacade::new(db.clone(), steps.clone());
        BundleFacade::new(db.clone(), processes, steps, step_properties)
    }

    fn definition() -> Vec<ProcessDefinition> {
        vec![ProcessDefinition {
            name: "Assembly".into(),
            steps: vec![
                StepDefinition {
                    name: "Cut".into(),
                    seq_number: None,
                    step_properties: vec![StepPropertyDefinition {
                        name: "Checked".into(),
                        description: None,
                        default_value: Some("true".into()),
                        kind: PropertyType::Boolean,
                    }],
                },
                StepDefinition {
                    name: "Pack".into(),
                    seq_number: None,
                    step_properties: vec![],
                },
            ],
        }]
    }

    #[tokio::test]
    async fn saves_whole_tree_in_order() {
        let db = Arc::new(MemoryBackend::new());
        let facade = bundles(&db);
        let bundle = facade
            .save_processes_as_bundle("line-3", &definition())
            .await
            .unwrap();

        let bundle_id = bundle.id.unwrap();
        let processes = db.rows(Table::Processes);
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0]["bundle_id"], bundle_id);

        let steps = facade.steps.by_process_id(processes[0]["id"].as_i64().unwrap());
        let seqs: Vec<_> = steps.iter().map(|s| (s.name.as_str(), s.seq_number)).collect();
        assert_eq!(seqs, vec![("Cut", Some(1)), ("Pack", Some(2))]);

        let props = db.rows(Table::StepProperties);
        assert_eq!(props.len(), 1);
        assert_eq!(props[0]["type"], "boolean");
        assert_eq!(props[0]["step_id"], steps[0].id.unwrap());
        assert_eq!(facade.all(), vec![bundle]);
    }

    #[tokio::test]
    async fn rejects_empty_input() {
        let db = Arc::new(MemoryBackend::new());
        let facade = bundles(&db);
        assert!(matches!(
            facade.save_processes_as_bundle("  ", &definition()).await,
            Err(RecastError::InvalidBundle(_))
        ));
        assert!(facade.save_processes_as_bundle("b", &[]).await.is_err());
        assert!(db.rows(Table::Bundles).is_empty());
    }

    #[tokio::test]
    async fn import_file_uses_stem_as_name() {
        let db = Arc::new(MemoryBackend::new());
        let facade = bundles(&db);
        let dir = tempdir().unwrap();
        let path = dir.path().join("welding.yml");
        std::fs::write(&path, "- name: Weld\n  steps:\n    - name: Seam\n").unwrap();

        let bundle = facade.import_file(&path).await.unwrap();
        assert_eq!(bundle.name, "welding");
        assert_eq!(db.rows(Table::Steps).len(), 1);
    }

    #[tokio::test]
    async fn backend_failure_is_returned() {
        let db = Arc::new(MemoryBackend::new());
        let facade = bundles(&db);
        db.set_failing(true);
        assert!(matches!(
            facade.save_processes_as_bundle("b", &definition()).await,
            Err(RecastError::Database(_))
        ));
    }
}
