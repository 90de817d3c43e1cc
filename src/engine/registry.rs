//! Engine Registry
//!
//! Maps normalized engine names to connectors. Connectors are either
//! registered up front or loaded lazily from shared libraries.

use std::path::PathBuf;
use std::sync::Arc;
use dashmap::DashMap;

use super::{DynamicConnector, EngineConnector, EngineError, EngineKind};

/// Registry of engine connectors shared by every queue
pub struct EngineRegistry {
    /// Resolved connectors by engine
    connectors: DashMap<EngineKind, Arc<dyn EngineConnector>>,

    /// Directories searched for engine libraries
    search_paths: Vec<PathBuf>,

    /// Allow lazy shared-library loading in `resolve`
    dynamic_loading: bool,
}

impl EngineRegistry {
    /// Create a registry that loads missing connectors from `search_paths`
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            connectors: DashMap::new(),
            search_paths,
            dynamic_loading: true,
        }
    }

    /// Create a registry that only knows explicitly registered connectors
    pub fn static_only() -> Self {
        Self {
            connectors: DashMap::new(),
            search_paths: Vec::new(),
            dynamic_loading: false,
        }
    }

    /// Register a connector under the engine it reports
    pub fn register(&self, connector: Arc<dyn EngineConnector>) {
        let kind = connector.kind();
        if self.connectors.insert(kind, connector).is_some() {
            log::warn!("Replaced connector for engine {}", kind);
        } else {
            log::debug!("Registered connector for engine {}", kind);
        }
    }

    /// Remove a connector
    pub fn unregister(&self, kind: EngineKind) -> bool {
        self.connectors.remove(&kind).is_some()
    }

    /// Look up an already-resolved connector
    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn EngineConnector>> {
        self.connectors.get(&kind).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a connector, loading its shared library on first use
    pub fn resolve(&self, kind: EngineKind) -> Result<Arc<dyn EngineConnector>, EngineError> {
        if let Some(connector) = self.get(kind) {
            return Ok(connector);
        }

        if !self.dynamic_loading {
            return Err(EngineError::NotRegistered(kind));
        }

        let loaded: Arc<dyn EngineConnector> = Arc::new(DynamicConnector::load(kind, &self.search_paths)?);
        let connector = self
            .connectors
            .entry(kind)
            .or_insert(loaded)
            .value()
            .clone();
        log::info!("Loaded {} engine connector", kind);
        Ok(connector)
    }

    /// Resolve by user-supplied engine name
    pub fn resolve_by_name(&self, name: &str) -> Result<Arc<dyn EngineConnector>, EngineError> {
        let kind = EngineKind::normalize(name)
            .ok_or_else(|| EngineError::UnknownEngine(name.to_string()))?;
        self.resolve(kind)
    }

    /// Engines with a resolved connector, in stable order
    pub fn registered_kinds(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<EngineKind> = self.connectors.iter().map(|entry| *entry.key()).collect();
        kinds.sort();
        kinds
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
