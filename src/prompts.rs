//! Versioned prompt templates for the extraction client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::utils::error::{AppError, Result};

const BUILTIN_PROMPTS: &str = include_str!("../config/prompts.toml");

/// Prompts every extraction provider needs.
pub const REQUIRED_PROMPTS: &[&str] = &["system", "extraction"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptTemplate {
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub template: String,
}

impl PromptTemplate {
    /// Substitute `{name}` placeholders. Other braces are left alone, so JSON
    /// examples inside a template survive.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        vars.iter().fold(self.template.clone(), |text, (name, value)| {
            text.replace(&format!("{{{}}}", name), value)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCatalog {
    #[serde(default = "default_version")]
    pub version: String,
    pub prompts: HashMap<String, PromptTemplate>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PromptCatalog {
    /// The templates compiled into the binary from `config/prompts.toml`.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_PROMPTS)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let catalog: PromptCatalog = toml::from_str(raw)?;
        for name in REQUIRED_PROMPTS {
            catalog.get(name)?;
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Result<&PromptTemplate> {
        self.prompts.get(name).ok_or_else(|| AppError::NotFound {
            resource: format!("prompt '{}'", name),
        })
    }
}
