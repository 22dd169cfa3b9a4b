// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric definitions, their validation and the split into application-reported and
//! OS-read metrics.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::constants::{EXTERNAL_METRIC_PREFIX, MAX_METRIC_NAME_LEN};
use crate::errors::{ConfigError, ValidationError};
use crate::proc::{self, ExternalField, ProcSource};

/// A metric as it is written by users, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    #[serde(rename = "Name", alias = "name", default)]
    pub name: String,
    #[serde(rename = "Type", alias = "type", default)]
    pub value_type: String,
}

impl MetricDefinition {
    pub fn new(name: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: value_type.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Float,
}

impl ValueType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "int" => Some(Self::Int),
            "float" => Some(Self::Float),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the value of a metric comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Reported by the instrumented application through the collector.
    Internal,
    /// Read by the agent from the OS process statistics.
    External(ExternalField),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSpec {
    pub name: String,
    pub kind: MetricKind,
    pub value_type: ValueType,
}

impl MetricSpec {
    pub fn is_internal(&self) -> bool {
        self.kind == MetricKind::Internal
    }

    pub fn definition(&self) -> MetricDefinition {
        MetricDefinition::new(self.name.clone(), self.value_type.as_str())
    }
}

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

/// Checks metric definitions in index order and returns the first violation.
pub fn validate(definitions: &[MetricDefinition]) -> Result<(), ValidationError> {
    if definitions.is_empty() {
        return Err(ValidationError::EmptySet);
    }
    let max = i32::MAX as usize;
    if definitions.len() >= max {
        return Err(ValidationError::TooManyMetrics { max });
    }

    let mut seen: FnvHashMap<&str, usize> = FnvHashMap::default();
    for (index, definition) in definitions.iter().enumerate() {
        let name = definition.name.as_str();
        if name.is_empty() {
            return Err(ValidationError::MissingName { index });
        }
        if name.len() > MAX_METRIC_NAME_LEN {
            return Err(ValidationError::NameTooLong {
                index,
                name: name.to_string(),
            });
        }
        if !name.chars().all(is_valid_name_char) {
            return Err(ValidationError::InvalidNameChars {
                index,
                name: name.to_string(),
            });
        }
        if let Some(first) = seen.get(name) {
            return Err(ValidationError::DuplicateName {
                index,
                name: name.to_string(),
                first: *first,
            });
        }
        if definition.value_type.is_empty() {
            return Err(ValidationError::MissingType {
                index,
                name: name.to_string(),
            });
        }
        if ValueType::parse(&definition.value_type).is_none() {
            return Err(ValidationError::UnknownType {
                index,
                name: name.to_string(),
                value_type: definition.value_type.clone(),
            });
        }
        seen.insert(name, index);
    }

    Ok(())
}

/// The validated, ordered metrics of a run.
///
/// The position of a metric is its column in every [`crate::message::Sample`]. Internal
/// metrics additionally get a slot in the shared counter array, numbered by their order
/// among internal metrics.
#[derive(Debug, Clone)]
pub struct MetricSet {
    specs: Vec<MetricSpec>,
    internal: Vec<usize>,
    external: Vec<(usize, ExternalField)>,
}

impl MetricSet {
    pub fn new(definitions: &[MetricDefinition]) -> Result<Self, ValidationError> {
        validate(definitions)?;

        let mut specs = Vec::with_capacity(definitions.len());
        let mut internal = Vec::new();
        let mut external = Vec::new();

        for (index, definition) in definitions.iter().enumerate() {
            // validate() already rejected unknown types
            let value_type = ValueType::parse(&definition.value_type).unwrap_or(ValueType::Float);
            let kind = if definition.name.starts_with(EXTERNAL_METRIC_PREFIX) {
                let field = proc::lookup(&definition.name).ok_or_else(|| {
                    ValidationError::UnknownExternalMetric {
                        index,
                        name: definition.name.clone(),
                    }
                })?;
                external.push((index, field));
                MetricKind::External(field)
            } else {
                internal.push(index);
                MetricKind::Internal
            };

            specs.push(MetricSpec {
                name: definition.name.clone(),
                kind,
                value_type,
            });
        }

        Ok(Self {
            specs,
            internal,
            external,
        })
    }

    pub fn specs(&self) -> &[MetricSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Sample positions of the internal metrics, in counter slot order.
    pub fn internal(&self) -> &[usize] {
        &self.internal
    }

    pub fn external(&self) -> &[(usize, ExternalField)] {
        &self.external
    }

    pub fn internal_count(&self) -> usize {
        self.internal.len()
    }

    /// The OS sources that have to be read on every tick, each exactly once.
    pub fn sources(&self) -> BTreeSet<ProcSource> {
        self.external.iter().map(|(_, field)| field.source).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.iter().map(|spec| spec.name.as_str())
    }

    pub fn definitions(&self) -> Vec<MetricDefinition> {
        self.specs.iter().map(MetricSpec::definition).collect()
    }
}

/// Parses the inline `name,type;name,type` form.
pub fn parse_definitions(raw: &str) -> Result<Vec<MetricDefinition>, ConfigError> {
    raw.split(';')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let mut fields = part.split(',');
            match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(value_type), None) => Ok(MetricDefinition::new(
                    name.trim().to_string(),
                    value_type.trim().to_string(),
                )),
                _ => Err(ConfigError::MetricsDefinition(part.to_string())),
            }
        })
        .collect()
}

/// Reads a JSON file holding `[{"Name": "...", "Type": "int"}]`.
pub fn load_definitions(path: &Path) -> Result<Vec<MetricDefinition>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::MetricsFile {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_json::from_str(&contents)?)
}
