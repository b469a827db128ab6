//! Server configuration.

use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP the fabric listener binds to; the TCP auth channel uses the same
    /// interface on port + 1.
    pub listen_ip: String,
    /// Persistent memory mount points storing segment data. Empty keeps the
    /// data in plain memory.
    pub nvdimm_mount_paths: Vec<String>,
    /// Opaque resource string handed to the storage backend driver.
    pub storage_resource_file: String,
    /// Enforce the single writer / many readers mapping discipline.
    pub consistency_check: bool,
    /// Spin on the completion queue instead of blocking.
    pub active_polling: bool,
    /// Validate the id/key pair of every application message.
    pub client_auth: bool,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen_ip: String::new(),
            nvdimm_mount_paths: Vec::new(),
            storage_resource_file: "storage_resource_file.rc".to_string(),
            consistency_check: true,
            active_polling: false,
            client_auth: true,
        }
    }
}

impl ServerConfig {
    /// Presets used by the unit and integration tests.
    pub fn for_unit_tests() -> ServerConfig {
        ServerConfig {
            listen_ip: "127.0.0.1".to_string(),
            active_polling: true,
            ..ServerConfig::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading the server configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();

        assert!(config.consistency_check);
        assert!(config.client_auth);
        assert!(!config.active_polling);
        assert!(config.nvdimm_mount_paths.is_empty());
    }

    #[test]
    fn test_unit_test_preset() {
        let config = ServerConfig::for_unit_tests();

        assert_eq!(config.listen_ip, "127.0.0.1");
        assert!(config.active_polling);
    }
}
