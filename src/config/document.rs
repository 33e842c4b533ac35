//! In-memory representation of a configuration file.
//!
//! A [`Document`] is a collection of named [`Section`]s. Each section holds
//! a collection of values of arbitrary type; generally a section is
//! associated with one plugin or subsystem, and each value corresponds to a
//! configuration option. Values keep their decoded YAML node until a typed
//! accessor forces them into a concrete type.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_yml::Value;

/// Error type for configuration reading.
#[derive(Debug)]
pub enum ConfigError {
    /// The YAML source failed to parse.
    Yaml(serde_yml::Error),
    /// The YAML parsed but does not have the section/option shape.
    InvalidDocument(String),
    /// A required section is absent.
    MissingSection { section: String },
    /// A required option is absent from its section.
    MissingOption { section: String, key: String },
    /// An option is present but could not be decoded as the expected type.
    InvalidOption {
        section: String,
        key: String,
        message: String,
    },
    /// An option decoded, but the caller's parse callback rejected it.
    ParseOption {
        section: String,
        key: String,
        message: String,
    },
    /// A plugin factory rejected its configuration.
    Plugin {
        plugin: String,
        source: Box<ConfigError>,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Yaml(e) => write!(f, "configuration file is not valid YAML: {e}"),
            ConfigError::InvalidDocument(message) => {
                write!(f, "invalid configuration document: {message}")
            }
            ConfigError::MissingSection { section } => {
                write!(f, "missing required configuration section \"{section}\"")
            }
            ConfigError::MissingOption { section, key } => write!(
                f,
                "missing required configuration option \"{key}\" in section \"{section}\""
            ),
            ConfigError::InvalidOption {
                section,
                key,
                message,
            } => write!(
                f,
                "invalid value for configuration option \"{key}\" in section \"{section}\": {message}"
            ),
            ConfigError::ParseOption {
                section,
                key,
                message,
            } => write!(
                f,
                "error parsing configuration option \"{key}\" in section \"{section}\": {message}"
            ),
            ConfigError::Plugin { plugin, source } => {
                write!(f, "traffic plugin \"{plugin}\" configuration error: {source}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A parsed configuration document: a mapping from section name to section.
#[derive(Debug, Default)]
pub struct Document {
    sections: BTreeMap<String, Section>,
}

impl Document {
    /// Returns a new, empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses YAML into a document. Each top-level property becomes a
    /// section; the properties it contains become values in that section.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let root: Value = serde_yml::from_str(yaml).map_err(ConfigError::Yaml)?;

        let mut document = Document::new();
        let mapping = match root {
            // An empty file is an empty document.
            Value::Null => return Ok(document),
            Value::Mapping(mapping) => mapping,
            _ => {
                return Err(ConfigError::InvalidDocument(
                    "top level must be a mapping of sections".to_string(),
                ))
            }
        };

        for (name, body) in mapping {
            let name = match name {
                Value::String(name) => name,
                other => {
                    return Err(ConfigError::InvalidDocument(format!(
                        "section names must be strings, found {other:?}"
                    )))
                }
            };

            let mut section = Section::new(&name);
            match body {
                // "section:" with no body is an empty section.
                Value::Null => {}
                Value::Mapping(values) => {
                    for (key, value) in values {
                        let key = match key {
                            Value::String(key) => key,
                            other => {
                                return Err(ConfigError::InvalidDocument(format!(
                                    "option names in section \"{name}\" must be strings, found {other:?}"
                                )))
                            }
                        };
                        section.set(key, value);
                    }
                }
                other => {
                    return Err(ConfigError::InvalidDocument(format!(
                        "section \"{name}\" must be a mapping, found {other:?}"
                    )))
                }
            }
            document.sections.insert(name, section);
        }

        Ok(document)
    }

    /// Returns the section with the given name. An absent section is
    /// equivalent to a section with no keys, so this always succeeds.
    pub fn section(&self, name: &str) -> Section {
        self.sections
            .get(name)
            .cloned()
            .unwrap_or_else(|| Section::new(name))
    }

    /// Returns the section with the given name, or an error if it is absent.
    pub fn required_section(&self, name: &str) -> Result<&Section, ConfigError> {
        self.sections.get(name).ok_or_else(|| ConfigError::MissingSection {
            section: name.to_string(),
        })
    }
}

/// A named collection of configuration values.
#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    values: BTreeMap<String, Value>,
}

impl Section {
    /// Returns a new, empty section.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores `value` under `key`. The value is decoded into a concrete
    /// type when a typed lookup occurs.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Returns the value for `key` decoded as a `T`, if present. An absent
    /// key yields `Ok(None)`; so does a key whose value is completely empty
    /// in the YAML source (like `foo:`), which the substitution layer
    /// produces when a variable is missing and no default was given. A
    /// present value of the wrong type is an error.
    pub fn lookup_optional<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let node = match self.values.get(key) {
            None => return Ok(None),
            Some(node) => node,
        };

        if node.is_null() {
            return Ok(None);
        }

        serde_yml::from_value(node.clone())
            .map(Some)
            .map_err(|e| ConfigError::InvalidOption {
                section: self.name.clone(),
                key: key.to_string(),
                message: e.to_string(),
            })
    }

    /// Returns the value for `key` decoded as a `T`. An absent key, or a
    /// present value of the wrong type, is an error.
    pub fn lookup_required<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.lookup_optional(key)?
            .ok_or_else(|| ConfigError::MissingOption {
                section: self.name.clone(),
                key: key.to_string(),
            })
    }

    /// Invokes `action` with the value for `key`, if present, wrapping any
    /// callback error with section/key context. An absent key is not an
    /// error and does not invoke the callback.
    pub fn parse_optional<T, F>(&self, key: &str, action: F) -> Result<(), ConfigError>
    where
        T: DeserializeOwned,
        F: FnOnce(&str, T) -> Result<(), Box<dyn std::error::Error + Send + Sync>>,
    {
        match self.lookup_optional::<T>(key)? {
            None => Ok(()),
            Some(value) => action(key, value).map_err(|e| ConfigError::ParseOption {
                section: self.name.clone(),
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Invokes `action` with the value for `key`. An absent key is an
    /// error; callback errors are wrapped with section/key context.
    pub fn parse_required<T, F>(&self, key: &str, action: F) -> Result<(), ConfigError>
    where
        T: DeserializeOwned,
        F: FnOnce(&str, T) -> Result<(), Box<dyn std::error::Error + Send + Sync>>,
    {
        let value = self.lookup_required::<T>(key)?;
        action(key, value).map_err(|e| ConfigError::ParseOption {
            section: self.name.clone(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}
