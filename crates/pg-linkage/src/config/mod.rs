//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::capability::Capabilities;
use crate::error::{LinkageError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of the configuration, used to tie run reports to a job file.
    /// The password is not part of it.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Declared capability set.
    pub fn capabilities(&self) -> Result<Capabilities> {
        Capabilities::from_names(&self.extensions)
    }

    /// Jobs to run: all of them, or the one named.
    pub fn select_jobs(&self, name: Option<&str>) -> Result<Vec<&JobConfig>> {
        match name {
            None => Ok(self.jobs.iter().collect()),
            Some(name) => self
                .jobs
                .iter()
                .find(|j| j.name == name)
                .map(|j| vec![j])
                .ok_or_else(|| LinkageError::Config(format!("no job named '{}'", name))),
        }
    }
}
