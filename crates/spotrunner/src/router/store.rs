use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tempfile::NamedTempFile;

use crate::Map;
use crate::router::profile::is_valid_profile_name;

/// Profile configuration store. Profiles are JSON documents keyed by their name.
pub trait ProfileStore: Send + Sync {
    fn get(&self, name: &str) -> crate::Result<Option<Value>>;

    fn list(&self) -> crate::Result<Vec<String>>;

    fn put(&self, name: &str, document: &Value) -> crate::Result<()>;

    /// Replaces the image of an existing profile. Returns false if there is no such profile.
    fn set_image_id(&self, name: &str, image_id: &str) -> crate::Result<bool> {
        let Some(mut document) = self.get(name)? else {
            return Ok(false);
        };
        match document.as_object_mut() {
            Some(object) => {
                object.insert("imageId".to_string(), Value::String(image_id.to_string()));
            }
            None => {
                return Err(crate::Error::StoreError(format!(
                    "Profile `{name}` is not a JSON object"
                )));
            }
        }
        self.put(name, &document)?;
        Ok(true)
    }
}

pub type ProfileStoreRef = Arc<dyn ProfileStore>;

fn check_name(name: &str) -> crate::Result<()> {
    if is_valid_profile_name(name) {
        Ok(())
    } else {
        Err(crate::Error::StoreError(format!("Invalid profile name `{name}`")))
    }
}

/// Stores profiles as `<name>.json` files in a directory.
pub struct DirProfileStore {
    directory: PathBuf,
}

impl DirProfileStore {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.json"))
    }
}

impl ProfileStore for DirProfileStore {
    fn get(&self, name: &str) -> crate::Result<Option<Value>> {
        if !is_valid_profile_name(name) {
            return Ok(None);
        }
        let path = self.profile_path(name);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let document = serde_json::from_slice(&data).map_err(|e| {
            crate::Error::DeserializationError(format!("{}: {e}", path.display()))
        })?;
        Ok(Some(document))
    }

    fn list(&self) -> crate::Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(error) => return Err(error.into()),
        };
        let mut names = vec![];
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_profile_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// The document is written into a temporary file first and then moved over the old one,
    /// so readers never see a partially written profile.
    fn put(&self, name: &str, document: &Value) -> crate::Result<()> {
        check_name(name)?;
        std::fs::create_dir_all(&self.directory)?;
        let mut file = NamedTempFile::new_in(&self.directory)?;
        serde_json::to_writer_pretty(&mut file, document)?;
        file.as_file().sync_all()?;
        file.persist(self.profile_path(name))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<Map<String, Value>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, name: &str) -> crate::Result<Option<Value>> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        Ok(profiles.get(name).cloned())
    }

    fn list(&self) -> crate::Result<Vec<String>> {
        let profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = profiles.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn put(&self, name: &str, document: &Value) -> crate::Result<()> {
        check_name(name)?;
        let mut profiles = self.profiles.lock().unwrap_or_else(|e| e.into_inner());
        profiles.insert(name.to_string(), document.clone());
        Ok(())
    }
}
