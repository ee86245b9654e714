use crate::error::{ModelError, ModelResult};
use crate::utils::compact;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;

/// A typed array stored in a group, with the names of its dimensions.
/// An empty `dims` list means a scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Array {
    Double { dims: Vec<String>, data: Vec<f64> },
    Uint { dims: Vec<String>, data: Vec<u64> },
    Text { dims: Vec<String>, data: Vec<String> },
}

impl Array {
    pub fn dims(&self) -> &[String] {
        match self {
            Array::Double { dims, .. }
            | Array::Uint { dims, .. }
            | Array::Text { dims, .. } => dims,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Array::Double { data, .. } => data.len(),
            Array::Uint { data, .. } => data.len(),
            Array::Text { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn dim_names(dims: &[&str]) -> Vec<String> {
    dims.iter().map(|d| d.to_string()).collect()
}

/// Hierarchical container of named dimensions, typed arrays and
/// sub-groups, persisted as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Group {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    dims: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    vars: BTreeMap<String, Array>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    groups: BTreeMap<String, Group>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dim(&mut self, name: &str, value: usize) {
        self.dims.insert(name.to_string(), value);
    }

    pub fn dim(&self, name: &str) -> Option<usize> {
        self.dims.get(name).copied()
    }

    pub fn require_dim(&self, name: &str) -> ModelResult<usize> {
        self.dim(name)
            .ok_or_else(|| ModelError::MissingMandatoryField(name.to_string()))
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn var(&self, name: &str) -> Option<&Array> {
        self.vars.get(name)
    }

    pub fn put_double(&mut self, name: &str, dims: &[&str], data: Vec<f64>) {
        self.vars.insert(
            name.to_string(),
            Array::Double {
                dims: dim_names(dims),
                data,
            },
        );
    }

    pub fn put_uint(&mut self, name: &str, dims: &[&str], data: Vec<usize>) {
        self.vars.insert(
            name.to_string(),
            Array::Uint {
                dims: dim_names(dims),
                data: data.into_iter().map(|v| v as u64).collect(),
            },
        );
    }

    pub fn put_text(&mut self, name: &str, dims: &[&str], data: Vec<String>) {
        self.vars.insert(
            name.to_string(),
            Array::Text {
                dims: dim_names(dims),
                data,
            },
        );
    }

    /// Reads a floating point array. Integer arrays are widened.
    pub fn double(&self, name: &str) -> ModelResult<Option<Vec<f64>>> {
        match self.vars.get(name) {
            None => Ok(None),
            Some(Array::Double { data, .. }) => Ok(Some(data.clone())),
            Some(Array::Uint { data, .. }) => {
                Ok(Some(data.iter().map(|v| *v as f64).collect()))
            }
            Some(Array::Text { .. }) => Err(ModelError::UnsupportedOperation(
                format!("'{name}' holds text, expected numbers"),
            )),
        }
    }

    pub fn require_double(&self, name: &str) -> ModelResult<Vec<f64>> {
        self.double(name)?
            .ok_or_else(|| ModelError::MissingMandatoryField(name.to_string()))
    }

    pub fn uint(&self, name: &str) -> ModelResult<Option<Vec<usize>>> {
        match self.vars.get(name) {
            None => Ok(None),
            Some(Array::Uint { data, .. }) => {
                Ok(Some(data.iter().map(|v| *v as usize).collect()))
            }
            Some(_) => Err(ModelError::UnsupportedOperation(format!(
                "'{name}' does not hold unsigned integers"
            ))),
        }
    }

    pub fn require_uint(&self, name: &str) -> ModelResult<Vec<usize>> {
        self.uint(name)?
            .ok_or_else(|| ModelError::MissingMandatoryField(name.to_string()))
    }

    pub fn text(&self, name: &str) -> ModelResult<Option<Vec<String>>> {
        match self.vars.get(name) {
            None => Ok(None),
            Some(Array::Text { data, .. }) => Ok(Some(data.clone())),
            Some(_) => Err(ModelError::UnsupportedOperation(format!(
                "'{name}' does not hold text"
            ))),
        }
    }

    pub fn add_group(&mut self, name: &str, group: Group) {
        self.groups.insert(name.to_string(), group);
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn require_group(&self, name: &str) -> ModelResult<&Group> {
        self.group(name)
            .ok_or_else(|| ModelError::MissingMandatoryField(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Layout {
    dims: Vec<String>,
    len: usize,
    integer: bool,
}

/// What a group looked like when a block was read from it: the
/// dimensions it gave and the shape of every array. Serializers check it
/// so that optional fields are written back only when they were read,
/// in the compact form they were read in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layouts {
    dims: BTreeSet<String>,
    arrays: BTreeMap<String, Layout>,
}

impl Layouts {
    pub fn of(group: &Group) -> Self {
        Self {
            dims: group.dims.keys().cloned().collect(),
            arrays: group
                .vars
                .iter()
                .map(|(name, array)| {
                    let layout = Layout {
                        dims: array.dims().to_vec(),
                        len: array.len(),
                        integer: matches!(array, Array::Uint { .. }),
                    };
                    (name.clone(), layout)
                })
                .collect(),
        }
    }

    pub fn has_dim(&self, name: &str) -> bool {
        self.dims.contains(name)
    }

    pub fn has_array(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    /// The dimensions `name` was read with, or `default`
    pub fn dims_or<'a>(&'a self, name: &str, default: &[&'a str]) -> Vec<&'a str> {
        match self.arrays.get(name) {
            Some(layout) => layout.dims.iter().map(String::as_str).collect(),
            None => default.to_vec(),
        }
    }

    /// Writes `values` under `name`. An array that was read goes back in
    /// the layout it had while the values still expand from it; anything
    /// else is written in full over `dims`.
    pub fn put_double(&self, group: &mut Group, name: &str, dims: &[&str], values: &[f64]) {
        let Some(layout) = self.arrays.get(name) else {
            group.put_double(name, dims, values.to_vec());
            return;
        };
        let Some(data) = compact(values, layout.len) else {
            group.put_double(name, dims, values.to_vec());
            return;
        };
        let read_dims: Vec<&str> = layout.dims.iter().map(String::as_str).collect();
        if layout.integer && data.iter().all(|v| *v >= 0.0 && v.fract() == 0.0) {
            group.put_uint(name, &read_dims, data.iter().map(|v| *v as usize).collect());
        } else {
            group.put_double(name, &read_dims, data);
        }
    }
}

pub fn read_group(filepath: &str) -> ModelResult<Group> {
    let contents = fs::read_to_string(filepath)?;
    let parsed: Group = serde_json::from_str(&contents)?;
    Ok(parsed)
}

pub fn write_group(group: &Group, filepath: &str) -> ModelResult<()> {
    let contents = serde_json::to_string_pretty(group)?;
    fs::write(filepath, contents)?;
    Ok(())
}
