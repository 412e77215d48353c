//! Event taxonomy and schema validation
//!
//! The registry maps event names to an [`EventSchema`]. Validation is a pure
//! function of the registry and the input; it never touches storage.
//!
//! Names must be lowercase `snake_case` ASCII (1 to 64 characters) in every
//! mode. Unregistered names are rejected in [`SchemaMode::Strict`] and passed
//! through with `schema_unknown` set in [`SchemaMode::Permissive`].

use crate::error::SchemaError;
use crate::sanitizer::REDACTED;
use crate::types::{Properties, PropertyType, PropertyValue};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

const MAX_NAME_LEN: usize = 64;

/// How unregistered event names are handled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    Strict,
    #[default]
    Permissive,
}

/// Declared shape of one property
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldSchema {
    #[serde(rename = "type")]
    pub ty: PropertyType,
    #[serde(default)]
    pub required: bool,
}

impl FieldSchema {
    pub fn required(ty: PropertyType) -> Self {
        Self { ty, required: true }
    }

    pub fn optional(ty: PropertyType) -> Self {
        Self {
            ty,
            required: false,
        }
    }
}

/// Declared shape of one event
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventSchema {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSchema>,
    /// Whether properties not listed in `fields` are allowed
    #[serde(default = "default_additional_properties")]
    pub additional_properties: bool,
}

fn default_additional_properties() -> bool {
    true
}

impl Default for EventSchema {
    fn default() -> Self {
        Self {
            fields: BTreeMap::new(),
            additional_properties: true,
        }
    }
}

impl EventSchema {
    /// Add a field declaration (builder style)
    pub fn field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    /// Reject properties that are not declared
    pub fn closed(mut self) -> Self {
        self.additional_properties = false;
        self
    }
}

/// Output of a successful validation
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    pub name: String,
    pub properties: Properties,
    pub schema_unknown: bool,
}

/// Registered event schemas
#[derive(Debug, Clone, Default)]
pub struct Registry {
    mode: SchemaMode,
    schemas: HashMap<String, EventSchema>,
}

impl Registry {
    pub fn new(mode: SchemaMode) -> Self {
        Self {
            mode,
            schemas: HashMap::new(),
        }
    }

    /// Build a registry from the `[taxonomy]` config section
    pub fn from_config(config: &crate::config::TaxonomyConfig) -> Self {
        let mut registry = Self::new(config.mode);
        for (name, schema) in &config.events {
            registry.register(name.clone(), schema.clone());
        }
        registry
    }

    pub fn mode(&self) -> SchemaMode {
        self.mode
    }

    /// Register or replace a schema
    pub fn register(&mut self, name: impl Into<String>, schema: EventSchema) {
        let name = name.into();
        if !is_valid_name(&name) {
            tracing::warn!(name = %name, "Registering schema under a name track() will reject");
        }
        self.schemas.insert(name, schema);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Validate an event against its schema
    pub fn validate(
        &self,
        name: &str,
        properties: Properties,
    ) -> Result<ValidatedEvent, SchemaError> {
        if !is_valid_name(name) {
            return Err(SchemaError::InvalidName {
                name: name.to_string(),
            });
        }

        let Some(schema) = self.schemas.get(name) else {
            return match self.mode {
                SchemaMode::Strict => Err(SchemaError::UnknownEvent {
                    name: name.to_string(),
                }),
                SchemaMode::Permissive => Ok(ValidatedEvent {
                    name: name.to_string(),
                    properties,
                    schema_unknown: true,
                }),
            };
        };

        check_properties(schema, &properties)?;

        Ok(ValidatedEvent {
            name: name.to_string(),
            properties,
            schema_unknown: false,
        })
    }
}

fn check_properties(schema: &EventSchema, properties: &Properties) -> Result<(), SchemaError> {
    for (field, field_schema) in &schema.fields {
        match properties.get(field) {
            Some(value) if !satisfies(value, field_schema.ty) => {
                return Err(SchemaError::TypeMismatch {
                    field: field.clone(),
                    expected: field_schema.ty.to_string(),
                    actual: value.kind().to_string(),
                });
            }
            Some(_) => {}
            None if field_schema.required => {
                return Err(SchemaError::MissingField {
                    field: field.clone(),
                });
            }
            None => {}
        }
    }

    if !schema.additional_properties {
        if let Some(extra) = properties.keys().find(|k| !schema.fields.contains_key(*k)) {
            return Err(SchemaError::UnexpectedField {
                field: extra.clone(),
            });
        }
    }

    Ok(())
}

/// A redacted value stands in for whatever type was declared.
fn satisfies(value: &PropertyValue, expected: PropertyType) -> bool {
    value.kind() == expected || value.as_str() == Some(REDACTED)
}

fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_NAME_LEN
        && bytes[0].is_ascii_lowercase()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'_')
}
