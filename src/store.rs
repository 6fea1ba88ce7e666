// src/store.rs
//! Path-addressed persistent state.
//!
//! A thin facade over a JSON tree: `set_path` mutates in memory and
//! marks the store dirty, `save` flushes atomically (write-temp,
//! rename). Inputs and groups write here on every change; periodic
//! timers in the service decide when the disk is actually touched.

use std::fs;
use std::path::PathBuf;

use log::debug;
use serde_json::{Map, Value};

use crate::error::{Result, VigilError};

pub struct StateStore {
    path: Option<PathBuf>,
    root: Value,
    dirty: bool,
}

impl StateStore {
    /// Open a store backed by `path`, loading existing content if the
    /// file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let root = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| VigilError::State(format!("cannot parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path),
            root,
            dirty: false,
        })
    }

    /// A store with no backing file. `save` only clears the dirty flag.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            root: Value::Object(Map::new()),
            dirty: false,
        }
    }

    pub fn get_path(&self, segments: &[&str]) -> Option<&Value> {
        let mut node = &self.root;
        for seg in segments {
            node = node.as_object()?.get(*seg)?;
        }
        Some(node)
    }

    pub fn get_bool(&self, segments: &[&str], default: bool) -> bool {
        self.get_path(segments)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    /// Set a value, creating intermediate objects as needed. A non-object
    /// intermediate node is replaced.
    pub fn set_path(&mut self, segments: &[&str], value: Value) {
        let (last, parents) = segments.split_last().expect("set_path needs a key");
        let mut node = &mut self.root;
        for seg in parents {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            node = node
                .as_object_mut()
                .expect("just coerced to object")
                .entry(seg.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let obj = node.as_object_mut().expect("just coerced to object");
        if obj.get(*last) != Some(&value) {
            obj.insert(last.to_string(), value);
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Flush to disk if anything changed since the last save. Writes a
    /// sibling temp file first and renames it into place so a crash
    /// mid-write never corrupts the previous state.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(path) = &self.path {
            let tmp = path.with_extension("tmp");
            let text = serde_json::to_string_pretty(&self.root)
                .map_err(|e| VigilError::State(e.to_string()))?;
            fs::write(&tmp, text)?;
            fs::rename(&tmp, path)?;
            debug!("State saved to {}", path.display());
        }
        self.dirty = false;
        Ok(())
    }
}
