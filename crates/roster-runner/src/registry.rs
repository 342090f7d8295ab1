//! The fixed set of scripts the daemon may run.
//!
//! The built-in set mirrors the operator workflow (diagnostics, seeding,
//! enrollment, camera loop, attendance snapshot). A TOML file can replace it:
//!
//! ```toml
//! [[script]]
//! id = "register_face"
//! title = "Register Face"
//! description = "Enroll a person from the webcam."
//! category = "Onboarding"
//! program = "python3"
//! args = ["scripts/register_face.py"]
//!
//! [[script.params]]
//! name = "name"
//! flag = "--name"
//! required = true
//! ```

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("cannot read script registry {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid script registry: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("script id {0:?} is defined more than once")]
    DuplicateId(String),
    #[error("script registry is empty")]
    Empty,
}

/// A start parameter mapped to a command-line flag.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub flag: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    #[serde(default)]
    pub long_running: bool,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    script: Vec<ScriptSpec>,
}

/// Ordered, id-unique list of script specs.
#[derive(Debug, Clone)]
pub struct Registry {
    scripts: Vec<ScriptSpec>,
}

impl Registry {
    pub fn new(scripts: Vec<ScriptSpec>) -> Result<Self, RegistryError> {
        if scripts.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut seen = HashSet::new();
        for spec in &scripts {
            if !seen.insert(spec.id.as_str()) {
                return Err(RegistryError::DuplicateId(spec.id.clone()));
            }
        }
        Ok(Self { scripts })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, RegistryError> {
        let file: RegistryFile = toml::from_str(text)?;
        Self::new(file.script)
    }

    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// The five operator scripts, each run as `<interpreter> scripts/<id>.py`.
    pub fn builtin(interpreter: &str) -> Self {
        let script = |id: &str, title: &str, description: &str, category: &str| ScriptSpec {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            long_running: false,
            program: interpreter.to_string(),
            args: vec![format!("scripts/{id}.py")],
            params: Vec::new(),
            env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
        };

        let mut register = script(
            "register_face",
            "Register Face",
            "Launch webcam capture and enroll a person into the system.",
            "Onboarding",
        );
        register.params = vec![
            ParamSpec {
                name: "name".into(),
                flag: "--name".into(),
                required: true,
            },
            ParamSpec {
                name: "employee_id".into(),
                flag: "--employee-id".into(),
                required: false,
            },
        ];

        let mut camera = script(
            "camera_client",
            "Run Camera Client",
            "Start the edge camera pipeline and recognition loop.",
            "Operations",
        );
        camera.long_running = true;

        Self {
            scripts: vec![
                script(
                    "test_gpu",
                    "GPU Diagnostics",
                    "Validate CUDA/cuDNN and ONNX Runtime provider setup.",
                    "Onboarding",
                ),
                script(
                    "seed_db",
                    "Seed Starter Data",
                    "Insert a sample person embedding for first-run verification.",
                    "Onboarding",
                ),
                register,
                camera,
                script(
                    "show_attendance",
                    "Attendance Snapshot",
                    "Read recent attendance records directly from the database.",
                    "Operations",
                ),
            ],
        }
    }

    pub fn scripts(&self) -> &[ScriptSpec] {
        &self.scripts
    }

    pub fn into_scripts(self) -> Vec<ScriptSpec> {
        self.scripts
    }
}
