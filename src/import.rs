//! Bundle definition files.
//!
//! A bundle file lists processes with their steps and step properties, as
//! YAML or JSON. Either a bare list or a `processes:` key is accepted:
//!
//! ```yaml
//! - name: Assembly
//!   steps:
//!     - name: Cut
//!       step_properties:
//!         - name: Length
//!           type: text
//!         - name: Checked
//!           type: boolean
//!           default_value: false
//! ```

use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::errors::RecastError;
use crate::models::PropertyType;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessDefinition {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default, alias = "seqNumber")]
    pub seq_number: Option<i64>,
    #[serde(default, alias = "stepProperties")]
    pub step_properties: Vec<StepPropertyDefinition>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StepPropertyDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "defaultValue", deserialize_with = "scalar_as_string")]
    pub default_value: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: PropertyType,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

fn scalar_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Scalar>::deserialize(deserializer)?;
    Ok(value.map(|v| match v {
        Scalar::Bool(b) => b.to_string(),
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Text(s) => s,
    }))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DefinitionFile {
    List(Vec<ProcessDefinition>),
    Wrapped { processes: Vec<ProcessDefinition> },
}

impl DefinitionFile {
    fn into_processes(self) -> Vec<ProcessDefinition> {
        match self {
            DefinitionFile::List(list) | DefinitionFile::Wrapped { processes: list } => list,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Result<Self, RecastError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);
        match ext.as_deref() {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(RecastError::InvalidBundle(format!(
                "{}: expected a .yaml, .yml or .json file",
                path.display()
            ))),
        }
    }
}

pub fn parse_definitions(
    content: &str,
    format: DefinitionFormat,
) -> Result<Vec<ProcessDefinition>, RecastError> {
    let file: DefinitionFile = match format {
        DefinitionFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| RecastError::InvalidBundle(e.to_string()))?,
        DefinitionFormat::Json => serde_json::from_str(content)
            .map_err(|e| RecastError::InvalidBundle(e.to_string()))?,
    };
    let processes = file.into_processes();
    validate(&processes)?;
    Ok(processes)
}

fn validate(processes: &[ProcessDefinition]) -> Result<(), RecastError> {
    if processes.is_empty() {
        return Err(RecastError::InvalidBundle("no processes defined".into()));
    }
    for process in processes {
        if process.name.trim().is_empty() {
            return Err(RecastError::InvalidBundle("process without a name".into()));
        }
        for step in &process.steps {
            if step.name.trim().is_empty() {
                return Err(RecastError::InvalidBundle(format!(
                    "step without a name in process '{}'",
                    process.name
                )));
            }
        }
    }
    Ok(())
}

/// Read a definition file. The bundle is named after the file stem.
pub fn load_definitions(path: &Path) -> Result<(String, Vec<ProcessDefinition>), RecastError> {
    let format = DefinitionFormat::from_path(path)?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.split('.').next().unwrap_or(s).to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RecastError::InvalidBundle(format!("{}: no file name", path.display())))?;
    let content = std::fs::read_to_string(path).map_err(|source| RecastError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((name, parse_definitions(&content, format)?))
}
