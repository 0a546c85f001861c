//! Process context
//!
//! Everything the runtime needs to interpret manifests, passed explicitly
//! instead of living in process-wide state: configuration, the signature
//! context, the local catalog and the backend registry. Daemons build one
//! [`Context`] at startup and hand references down.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::Catalog;
use crate::config::{Config, ConfigError};
use crate::crypto::SigContext;
use crate::storage::BackendRegistry;

#[derive(Debug)]
pub struct Context {
    pub config: Config,
    pub sig: RwLock<SigContext>,
    pub catalog: Catalog,
    pub registry: BackendRegistry,
}

impl Context {
    /// Load the configuration under `base_dir` and assemble the context.
    /// Locally stored user keys are imported so catalog manifests verify.
    pub fn load(base_dir: impl AsRef<Path>) -> Result<Arc<Self>, ConfigError> {
        let config = Config::load(base_dir.as_ref())?;
        Ok(Self::with_config(config))
    }

    pub fn with_config(config: Config) -> Arc<Self> {
        let sig = if config.dummy {
            SigContext::dummy(config.key_dir())
        } else {
            SigContext::new(config.key_dir())
        };
        let catalog = Catalog::new(&config);
        let mut sig = sig;
        if let Err(e) = sig.load_dir() {
            tracing::warn!("cannot preload key directory: {}", e);
        }
        if let Err(e) = catalog.load_user_keys(&mut sig) {
            tracing::warn!("cannot preload user keys: {}", e);
        }
        Arc::new(Context {
            config,
            sig: RwLock::new(sig),
            catalog,
            registry: BackendRegistry::with_defaults(),
        })
    }
}
