//! Annotation classes and their YAML file.
//!
//! The file keeps the layout `classes: {<name>: {color: [r, g, b]}}` and adds
//! an `id` per class plus a top-level `next_id`. Files written without ids
//! load with ids handed out in file order, which matches label files that
//! were written with positional class ids.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ClassId, Color};

pub const DEFAULT_CLASS_NAME: &str = "Default";
pub const DEFAULT_COLOR: Color = [255, 0, 0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEntry {
    pub id: ClassId,
    pub name: String,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable {
    entries: Vec<ClassEntry>,
    next_id: ClassId,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClassFile {
    #[serde(default)]
    classes: IndexMap<String, ClassFileEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_id: Option<ClassId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClassFileEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<ClassId>,
    #[serde(default = "default_color")]
    color: Color,
}

fn default_color() -> Color {
    DEFAULT_COLOR
}

impl Default for ClassTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.entries.push(ClassEntry {
            id: 0,
            name: DEFAULT_CLASS_NAME.to_string(),
            color: DEFAULT_COLOR,
        });
        table.next_id = 1;
        table
    }
}

impl ClassTable {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassEntry> {
        self.entries.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get(&self, id: ClassId) -> Option<&ClassEntry> {
        self.entries.iter().find(|c| c.id == id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ClassEntry> {
        self.entries.iter().find(|c| c.name == name)
    }

    /// Dense index of the class in display order.
    pub fn position(&self, id: ClassId) -> Option<usize> {
        self.entries.iter().position(|c| c.id == id)
    }

    pub fn add(&mut self, name: &str, color: Color) -> Result<ClassId> {
        let name = validate_name(name)?;
        if self.by_name(name).is_some() {
            return Err(Error::validation(format!("class `{name}` already exists")));
        }
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or_else(ids_exhausted)?;
        self.entries.push(ClassEntry {
            id,
            name: name.to_string(),
            color,
        });
        Ok(id)
    }

    /// Renaming keeps the id, so boxes of this class keep their meaning.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let new = validate_name(new)?;
        if old != new && self.by_name(new).is_some() {
            return Err(Error::validation(format!("class `{new}` already exists")));
        }
        let entry = self.entry_mut(old)?;
        entry.name = new.to_string();
        Ok(())
    }

    pub fn set_color(&mut self, name: &str, color: Color) -> Result<()> {
        self.entry_mut(name)?.color = color;
        Ok(())
    }

    /// Removes a class. Its id is retired and never handed out again.
    pub fn remove(&mut self, name: &str) -> Result<ClassEntry> {
        let idx = self
            .entries
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| unknown_class(name))?;
        Ok(self.entries.remove(idx))
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut ClassEntry> {
        self.entries
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| unknown_class(name))
    }

    pub fn from_yaml(content: &str, path: &Path) -> Result<Self> {
        let file: ClassFile = serde_yaml::from_str(content).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

        let mut seen = HashSet::new();
        for entry in file.classes.values() {
            if let Some(id) = entry.id {
                if !seen.insert(id) {
                    return Err(Error::validation(format!(
                        "{}: class id {id} is used twice",
                        path.display()
                    )));
                }
            }
        }

        let after_max = match seen.iter().max() {
            Some(m) => m.checked_add(1).ok_or_else(ids_exhausted)?,
            None => 0,
        };
        let mut next_id = after_max.max(file.next_id.unwrap_or(0));

        let mut entries = Vec::with_capacity(file.classes.len());
        for (name, entry) in file.classes {
            let id = match entry.id {
                Some(id) => id,
                None => {
                    let id = next_id;
                    next_id = id.checked_add(1).ok_or_else(ids_exhausted)?;
                    id
                }
            };
            entries.push(ClassEntry {
                id,
                name,
                color: entry.color,
            });
        }

        Ok(Self { entries, next_id })
    }

    /// `path` only names the destination in errors.
    pub fn to_yaml(&self, path: &Path) -> Result<String> {
        let file = ClassFile {
            classes: self
                .entries
                .iter()
                .map(|c| {
                    (
                        c.name.clone(),
                        ClassFileEntry {
                            id: Some(c.id),
                            color: c.color,
                        },
                    )
                })
                .collect(),
            next_id: Some(self.next_id),
        };
        serde_yaml::to_string(&file).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&content, path)
    }

    /// Missing file means a fresh project: start from the single default class.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No class file at {}, using the default class", path.display());
            return Ok(Self::default());
        }
        let table = Self::load(path)?;
        if table.is_empty() {
            warn!("Class file {} lists no classes", path.display());
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        fs::write(path, self.to_yaml(path)?).map_err(|e| Error::io(path, e))?;
        info!("Saved {} classes to {}", self.len(), path.display());
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::validation("class name must not be empty"));
    }
    Ok(name)
}

fn ids_exhausted() -> Error {
    Error::validation("no class ids left")
}

fn unknown_class(name: &str) -> Error {
    Error::validation(format!("no class named `{name}`"))
}

/// Parses `r,g,b` as typed on the command line.
pub fn parse_color(s: &str) -> Result<Color> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [r, g, b] = parts.as_slice() else {
        return Err(Error::validation(format!("color `{s}` must be r,g,b")));
    };
    let channel = |v: &str| {
        v.parse::<u8>()
            .map_err(|_| Error::validation(format!("color channel `{v}` is not 0-255")))
    };
    Ok([channel(*r)?, channel(*g)?, channel(*b)?])
}
