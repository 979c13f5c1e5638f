//! Plugin-based component registry
//!
//! The registry allows directory clients and table stores to be registered
//! dynamically at runtime, avoiding hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use segsync_core::registry::ComponentRegistry;
//! use segsync_core::config::DirectoryConfig;
//!
//! let registry = ComponentRegistry::with_builtin_stores();
//! segsync_directory_acumbamail::register(&registry);
//!
//! let config = DirectoryConfig::Acumbamail { api_token, base_url: None };
//! let directory = registry.create_directory(&config)?;
//! ```
//!
//! ## Registration
//!
//! Directory crates register themselves during initialization:
//!
//! ```rust,ignore
//! pub fn register(registry: &ComponentRegistry) {
//!     registry.register_directory("acumbamail", Box::new(AcumbamailFactory));
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::{DirectoryConfig, TableStoreConfig};
use crate::error::{Error, Result};
use crate::store::{FileTableStoreFactory, MemoryTableStoreFactory};
use crate::traits::{DirectoryFactory, SubscriberDirectory, TableStore, TableStoreFactory};

/// Registry of directory client and table store factories
///
/// ## Thread Safety
///
/// The registry uses interior mutability with RwLock, allowing concurrent
/// reads and exclusive writes.
#[derive(Default)]
pub struct ComponentRegistry {
    /// Registered directory client factories
    directories: RwLock<HashMap<String, Box<dyn DirectoryFactory>>>,

    /// Registered table store factories
    table_stores: RwLock<HashMap<String, Arc<dyn TableStoreFactory>>>,
}

impl ComponentRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the `memory` and `file` table stores registered
    pub fn with_builtin_stores() -> Self {
        let registry = Self::new();
        registry.register_table_store("memory", Box::new(MemoryTableStoreFactory));
        registry.register_table_store("file", Box::new(FileTableStoreFactory));
        registry
    }

    /// Register a directory client factory
    ///
    /// # Parameters
    ///
    /// - `name`: Directory type name (e.g., "acumbamail")
    /// - `factory`: Factory object for creating directory clients
    pub fn register_directory(&self, name: impl Into<String>, factory: Box<dyn DirectoryFactory>) {
        write(&self.directories).insert(name.into(), factory);
    }

    /// Register a table store factory
    ///
    /// # Parameters
    ///
    /// - `name`: Table store type name (e.g., "file", "memory")
    /// - `factory`: Factory object for creating table stores
    pub fn register_table_store(&self, name: impl Into<String>, factory: Box<dyn TableStoreFactory>) {
        write(&self.table_stores).insert(name.into(), Arc::from(factory));
    }

    /// Create a directory client from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn SubscriberDirectory>)`: Created client
    /// - `Err(Error)`: If the type is not registered or creation fails
    pub fn create_directory(&self, config: &DirectoryConfig) -> Result<Box<dyn SubscriberDirectory>> {
        let directory_type = config.type_name();
        let directories = read(&self.directories);

        let factory = directories.get(directory_type).ok_or_else(|| {
            Error::config(format!("Unknown directory type: {}", directory_type))
        })?;

        factory.create(config)
    }

    /// Create a table store from configuration
    ///
    /// # Returns
    ///
    /// - `Ok(Box<dyn TableStore>)`: Created table store
    /// - `Err(Error)`: If the type is not registered or creation fails
    pub async fn create_table_store(&self, config: &TableStoreConfig) -> Result<Box<dyn TableStore>> {
        let store_type = config.type_name();

        let factory = read(&self.table_stores)
            .get(store_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown table store type: {}", store_type)))?;

        // Custom stores receive their own config blob
        let config_json = match config {
            TableStoreConfig::Custom { config, .. } => config.clone(),
            other => serde_json::to_value(other)?,
        };

        factory.create(&config_json).await
    }

    /// List all registered directory types
    pub fn list_directories(&self) -> Vec<String> {
        read(&self.directories).keys().cloned().collect()
    }

    /// List all registered table store types
    pub fn list_table_stores(&self) -> Vec<String> {
        read(&self.table_stores).keys().cloned().collect()
    }

    /// Check if a directory type is registered
    pub fn has_directory(&self, name: &str) -> bool {
        read(&self.directories).contains_key(name)
    }

    /// Check if a table store type is registered
    pub fn has_table_store(&self, name: &str) -> bool {
        read(&self.table_stores).contains_key(name)
    }
}

// A panic while holding the lock cannot leave a HashMap half-written
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockDirectoryFactory;

    impl DirectoryFactory for MockDirectoryFactory {
        fn create(&self, _config: &DirectoryConfig) -> Result<Box<dyn SubscriberDirectory>> {
            Err(Error::not_found("Mock directory not implemented"))
        }
    }

    #[test]
    fn test_registry_registration() {
        let registry = ComponentRegistry::new();

        assert!(!registry.has_directory("mock"));

        registry.register_directory("mock", Box::new(MockDirectoryFactory));

        assert!(registry.has_directory("mock"));
        assert!(registry.list_directories().contains(&"mock".to_string()));
    }

    #[test]
    fn test_unknown_directory_type_is_config_error() {
        let registry = ComponentRegistry::new();
        let config = DirectoryConfig::Acumbamail {
            api_token: "t".into(),
            base_url: None,
        };
        assert!(matches!(registry.create_directory(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_builtin_stores() {
        let registry = ComponentRegistry::with_builtin_stores();
        assert!(registry.has_table_store("memory"));
        assert!(registry.has_table_store("file"));

        let dir = tempfile::tempdir().unwrap();
        let store = registry
            .create_table_store(&TableStoreConfig::File {
                root: dir.path().to_path_buf(),
            })
            .await
            .unwrap();
        assert!(store.read_sheet("L1", "Datos").await.unwrap().is_empty());
    }
}
