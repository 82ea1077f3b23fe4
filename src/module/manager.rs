//! Module registry
//!
//! Backend and auth modules are registered once at startup; sessions
//! resolve them by name. Requesting a backend with the launcher flag
//! returns a launcher-wrapped instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::module::auth::AuthModule;
use crate::module::launcher::LauncherModule;
use crate::module::BackendModule;

pub struct ModuleManager {
    backends: RwLock<HashMap<String, Arc<dyn BackendModule>>>,
    launched: RwLock<HashMap<String, Arc<dyn BackendModule>>>,
    auth_modules: RwLock<HashMap<String, Arc<dyn AuthModule>>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            launched: RwLock::new(HashMap::new()),
            auth_modules: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_backend(&self, module: Arc<dyn BackendModule>) {
        if let Err(err) = module.init() {
            warn!(module = module.name(), %err, "backend module init failed, not registered");
            return;
        }
        info!(module = module.name(), "backend module registered");
        self.backends
            .write()
            .insert(module.name().to_string(), module);
    }

    pub fn register_auth(&self, module: Arc<dyn AuthModule>) {
        info!(module = module.name(), "auth module registered");
        self.auth_modules
            .write()
            .insert(module.name().to_string(), module);
    }

    /// Resolve a backend by name. With `use_launcher` the module's
    /// process is started through the privileged launcher helper.
    pub fn backend(&self, name: &str, use_launcher: bool) -> Option<Arc<dyn BackendModule>> {
        if !use_launcher {
            return self.backends.read().get(name).cloned();
        }
        if let Some(wrapped) = self.launched.read().get(name) {
            return Some(wrapped.clone());
        }
        // launcher wrappers exist for any registered name
        self.backends.read().get(name)?;
        let wrapped: Arc<dyn BackendModule> = Arc::new(LauncherModule::new(name));
        self.launched
            .write()
            .insert(name.to_string(), wrapped.clone());
        Some(wrapped)
    }

    pub fn auth_module(&self, name: &str) -> Option<Arc<dyn AuthModule>> {
        self.auth_modules.read().get(name).cloned()
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }

    /// Tear every registered backend down (manager shutdown).
    pub fn shutdown(&self) {
        for module in self.backends.write().drain() {
            module.1.destroy();
        }
        self.launched.write().clear();
    }
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}
