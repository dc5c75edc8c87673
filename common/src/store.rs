use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::{ConfigField, NetworkConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One file per network field under a filesystem root.
///
/// Writes are plain overwrites. A crash mid-write can leave a truncated value; the
/// recovery path is the provisioning form, so no atomic rename is attempted.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    root: PathBuf,
}

impl ConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, field: ConfigField) -> PathBuf {
        self.root.join(field.file_name())
    }

    pub fn load(&self) -> NetworkConfig {
        let mut config = NetworkConfig::default();
        for field in ConfigField::ALL {
            config.set(field, self.read_field(field));
        }

        info!(
            "loaded network config: ssid=`{}` ip=`{}` gateway=`{}`",
            config.network_name, config.local_address, config.gateway_address
        );
        config
    }

    pub fn save(&self, field: ConfigField, value: &str) -> Result<(), StoreError> {
        let path = self.path_for(field);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        }

        fs::write(&path, value).map_err(|source| StoreError::Write {
            path: path.clone(),
            source,
        })?;

        if field.is_secret() {
            info!("{} written (value hidden)", path.display());
        } else {
            info!("{} written: `{value}`", path.display());
        }
        Ok(())
    }

    pub fn save_all(&self, config: &NetworkConfig) -> Result<(), StoreError> {
        for field in ConfigField::ALL {
            self.save(field, config.get(field))?;
        }
        Ok(())
    }

    /// Removes every stored field. The device is expected to restart afterwards.
    pub fn clear(&self) -> Result<(), StoreError> {
        warn!("clearing stored network config");
        for field in ConfigField::ALL {
            let path = self.path_for(field);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Remove { path, source }),
            }
        }
        Ok(())
    }

    fn read_field(&self, field: ConfigField) -> String {
        let path = self.path_for(field);
        match fs::read_to_string(&path) {
            Ok(raw) => first_line(&raw).to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("{} not present", path.display());
                String::new()
            }
            Err(err) => {
                warn!("failed to read {}: {err}", path.display());
                String::new()
            }
        }
    }
}

fn first_line(raw: &str) -> &str {
    raw.lines().next().unwrap_or_default().trim_end_matches('\r')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScratchDir;
    use pretty_assertions::assert_eq;

    fn home_config() -> NetworkConfig {
        NetworkConfig {
            network_name: "Home".to_string(),
            credential: "secret".to_string(),
            local_address: "192.168.1.50".to_string(),
            gateway_address: "192.168.1.1".to_string(),
        }
    }

    #[test]
    fn missing_files_load_as_empty() {
        let dir = ScratchDir::new("store-missing");
        let store = ConfigStore::new(dir.path());

        assert_eq!(store.load(), NetworkConfig::default());
    }

    #[test]
    fn every_field_survives_a_reload() {
        let dir = ScratchDir::new("store-roundtrip");
        let store = ConfigStore::new(dir.path());
        store.save_all(&home_config()).unwrap();

        // A second store over the same root stands in for a reboot.
        let reloaded = ConfigStore::new(dir.path()).load();
        assert_eq!(reloaded, home_config());
    }

    #[test]
    fn save_overwrites_previous_value() {
        let dir = ScratchDir::new("store-overwrite");
        let store = ConfigStore::new(dir.path());
        store.save(ConfigField::NetworkName, "OldNetwork").unwrap();
        store.save(ConfigField::NetworkName, "New").unwrap();

        assert_eq!(store.load().network_name, "New");
    }

    #[test]
    fn only_the_first_line_is_kept() {
        let dir = ScratchDir::new("store-lines");
        let store = ConfigStore::new(dir.path());
        std::fs::write(store.path_for(ConfigField::LocalAddress), "10.0.0.7\r\nstray\n").unwrap();

        assert_eq!(store.load().local_address, "10.0.0.7");
    }

    #[test]
    fn clear_leaves_an_empty_config() {
        let dir = ScratchDir::new("store-clear");
        let store = ConfigStore::new(dir.path());
        store.save_all(&home_config()).unwrap();

        store.clear().unwrap();
        store.clear().unwrap();

        assert_eq!(ConfigStore::new(dir.path()).load(), NetworkConfig::default());
    }
}
