//! Unit configuration registry: one JSON file per unit under
//! `<vault>/.modules/`.
//!
//! A unit description must carry at least `name` and `script`; `script` is
//! canonicalized on ingestion. The serialized form is marked with
//! `is_unit_config=true` and re-read verbatim (no re-validation, so a vault
//! moved between hosts still loads). Unknown keys are preserved and handed
//! to the handler command line as `--key=value` flags.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::error;
use serde_json::{Map, Value};

use crate::error::{Result, VaultError};

pub const MODULES_DIR: &str = ".modules";
const MODULE_EXT: &str = ".json";

/// Keys with dedicated meaning; everything else is passed through.
const KEY_NAME: &str = "name";
const KEY_SCRIPT: &str = "script";
const KEY_HOME: &str = "home";
const KEY_MARKER: &str = "is_unit_config";

#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    data: Map<String, Value>,
}

impl Unit {
    /// Build a unit from a description map (validates and canonicalizes
    /// unless the map is already a serialized config).
    pub fn from_map(data: Map<String, Value>) -> Result<Unit> {
        let mut unit = Unit { data: Map::new() };
        unit.update(data)?;
        unit.data
            .insert(KEY_MARKER.to_string(), Value::Bool(true));
        Ok(unit)
    }

    pub fn read(path: &Path) -> Result<Unit> {
        let text = fs::read_to_string(path).map_err(|e| VaultError::io("read", path, e))?;
        let data: Map<String, Value> = serde_json::from_str(&text).map_err(|e| {
            VaultError::config(format!("malformed unit config {}: {}", path.display(), e))
        })?;
        Unit::from_map(data)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut text = serde_json::to_string_pretty(&self.data)
            .map_err(|e| VaultError::config(format!("serialize unit: {}", e)))?;
        text.push('\n');
        fs::write(path, text).map_err(|e| VaultError::io("write", path, e))
    }

    /// Merge `data` in; returns true when any field changed or was added.
    pub fn update(&mut self, mut data: Map<String, Value>) -> Result<bool> {
        let serialized = matches!(data.get(KEY_MARKER), Some(Value::Bool(true)));
        if !serialized {
            let name = str_field(&data, KEY_NAME);
            let script = str_field(&data, KEY_SCRIPT);
            if name.is_empty() || script.is_empty() {
                return Err(VaultError::config(
                    "unit description must contain name and script",
                ));
            }
            let canonical = fs::canonicalize(script)
                .map_err(|e| VaultError::io("canonicalize", script, e))?;
            data.insert(
                KEY_SCRIPT.to_string(),
                Value::String(canonical.to_string_lossy().into_owned()),
            );
        }

        let mut updated = false;
        for (key, value) in data {
            if self.data.get(&key) != Some(&value) {
                self.data.insert(key, value);
                updated = true;
            }
        }
        Ok(updated)
    }

    pub fn name(&self) -> &str {
        str_field(&self.data, KEY_NAME)
    }

    pub fn script(&self) -> &str {
        str_field(&self.data, KEY_SCRIPT)
    }

    pub fn home(&self) -> Option<&str> {
        match self.data.get(KEY_HOME) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }

    /// Unit-specific keys forwarded to the handler.
    pub fn passthrough(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter().filter(|(key, _)| {
            !matches!(key.as_str(), KEY_NAME | KEY_SCRIPT | KEY_HOME | KEY_MARKER)
        })
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.data
    }
}

fn str_field<'a>(data: &'a Map<String, Value>, key: &str) -> &'a str {
    match data.get(key) {
        Some(Value::String(s)) => s,
        _ => "",
    }
}

/// Directory-backed registry of units.
#[derive(Debug, Clone)]
pub struct Registry {
    dir: PathBuf,
    units: BTreeMap<String, Unit>,
}

impl Registry {
    /// Load every `*.json` entry; a malformed file is logged and skipped so
    /// that a partially corrupt vault stays usable.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Registry> {
        let dir = dir.into();
        let mut units = BTreeMap::new();
        if dir.exists() {
            let entries =
                fs::read_dir(&dir).map_err(|e| VaultError::io("readdir", &dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| VaultError::io("readdir", &dir, e))?;
                let path = entry.path();
                if path.extension().map(|e| e == "json") != Some(true) {
                    continue;
                }
                match Unit::read(&path) {
                    Ok(unit) => {
                        units.insert(unit.name().to_string(), unit);
                    }
                    Err(e) => {
                        error!("units: loading {} failed: {}", path.display(), e);
                    }
                }
            }
        }
        Ok(Registry { dir, units })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, MODULE_EXT))
    }

    pub fn get(&self, name: &str) -> Option<&Unit> {
        self.units.get(name)
    }

    pub fn units(&self) -> &BTreeMap<String, Unit> {
        &self.units
    }

    /// Register or update a unit from a description map. Returns true iff
    /// anything changed (only then is the JSON file rewritten).
    pub fn set(&mut self, data: Map<String, Value>) -> Result<bool> {
        let unit = Unit::from_map(data.clone())?;
        let name = unit.name().to_string();
        let config_path = self.path_of(&name);

        let updated;
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|e| VaultError::io("mkdir", &self.dir, e))?;
            self.units.insert(name.clone(), unit);
            updated = true;
        } else if let Some(existing) = self.units.get_mut(&name) {
            updated = existing.update(data)?;
        } else if config_path.exists() {
            // On-disk but not loaded (e.g. written by another tool).
            let mut actual = Unit::read(&config_path)?;
            updated = actual.update(data)?;
            self.units.insert(name.clone(), actual);
        } else {
            self.units.insert(name.clone(), unit);
            updated = true;
        }

        if updated {
            self.units[&name].write(&config_path)?;
        }
        Ok(updated)
    }

    /// Delete a unit's JSON file. Returns the deleted file name, or None if
    /// the unit was not present.
    pub fn remove(&mut self, name: &str) -> Result<Option<String>> {
        let path = self.path_of(name);
        if !path.exists() {
            return Ok(None);
        }
        fs::remove_file(&path).map_err(|e| VaultError::io("unlink", &path, e))?;
        self.units.remove(name);
        Ok(Some(format!("{}{}", name, MODULE_EXT)))
    }
}
