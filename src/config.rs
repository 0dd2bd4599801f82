//! Configuration management for cmdrack.
//!
//! This module defines the structure of the configuration file (YAML by default,
//! TOML when the path ends in `.toml`), loads it, and turns it into a [`Catalog`]
//! of command definitions grouped by category.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::process::{CommandId, CommandSpec};

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Maximum number of log lines kept per command. Unbounded when absent.
    pub max_lines: Option<usize>,
    /// Category name -> command name -> command.
    #[serde(alias = "categories", default)]
    pub tabs: BTreeMap<String, BTreeMap<String, CommandConfig>>,
}

/// Configuration for a single command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Executable to run. Looked up on `PATH` when not a path.
    #[serde(alias = "executable")]
    pub exec: String,
    /// Arguments passed verbatim, without shell interpretation.
    #[serde(alias = "arguments", default)]
    pub args: Vec<String>,
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to parse config file {}", path.display())]
    ParseToml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("command {name:?} in category {category:?} has an empty executable")]
    EmptyExecutable { category: String, name: String },
    #[error("commands {first:?} and {second:?} resolve to the same identity {id}")]
    DuplicateIdentity {
        id: CommandId,
        first: String,
        second: String,
    },
}

/// A named group of commands, shown as one tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub commands: Vec<CommandSpec>,
}

/// The validated set of known command definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub categories: Vec<Category>,
    pub max_lines: Option<usize>,
}

impl Catalog {
    /// Builds a catalog from parsed configuration, rejecting empty executables
    /// and identity collisions.
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let mut seen: HashMap<CommandId, String> = HashMap::new();
        let mut categories = Vec::with_capacity(config.tabs.len());
        for (category, commands) in config.tabs {
            let mut specs = Vec::with_capacity(commands.len());
            for (name, command) in commands {
                if command.exec.trim().is_empty() {
                    return Err(ConfigError::EmptyExecutable {
                        category: category.clone(),
                        name,
                    });
                }
                let id = CommandId::new(&category, &name);
                let label = format!("{}/{}", category, name);
                if let Some(first) = seen.insert(id.clone(), label.clone()) {
                    return Err(ConfigError::DuplicateIdentity {
                        id,
                        first,
                        second: label,
                    });
                }
                specs.push(CommandSpec {
                    id,
                    category: category.clone(),
                    name,
                    exec: command.exec,
                    args: command.args,
                });
            }
            categories.push(Category {
                name: category,
                commands: specs,
            });
        }
        Ok(Self {
            categories,
            max_lines: config.max_lines,
        })
    }

    /// Looks up a command definition by identity.
    pub fn find(&self, id: &CommandId) -> Option<&CommandSpec> {
        self.commands().find(|spec| &spec.id == id)
    }

    /// Iterates over every command in category order.
    pub fn commands(&self) -> impl Iterator<Item = &CommandSpec> {
        self.categories.iter().flat_map(|c| c.commands.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.categories.iter().all(|c| c.commands.is_empty())
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(path, &raw)
}

/// Loads the configuration and validates it into a catalog.
pub fn load_catalog(path: &Path) -> Result<Catalog, ConfigError> {
    Catalog::from_config(load_config(path)?)
}

fn parse_config(path: &Path, raw: &str) -> Result<Config, ConfigError> {
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    if is_toml {
        return toml::from_str(raw).map_err(|source| ConfigError::ParseToml {
            path: path.to_path_buf(),
            source,
        });
    }
    serde_yaml::from_str(raw).map_err(|source| ConfigError::ParseYaml {
        path: path.to_path_buf(),
        source,
    })
}
