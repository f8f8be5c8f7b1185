//! Block type registry
//!
//! Maps a type name from the graph description to a constructor. The
//! orchestrator takes an explicit registry; [`BlockRegistry::global`] is a
//! process-wide instance for callers that want one.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::block::Block;
use crate::error::{PipelineError, Result};
use crate::worker::panic_message;

/// Constructor for one block type.
pub type BlockFactory = Arc<dyn Fn() -> Result<Arc<dyn Block>> + Send + Sync>;

static GLOBAL_REGISTRY: Lazy<Arc<BlockRegistry>> = Lazy::new(|| Arc::new(BlockRegistry::new()));

#[derive(Default)]
pub struct BlockRegistry {
    factories: RwLock<HashMap<String, BlockFactory>>,
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<BlockRegistry> {
        GLOBAL_REGISTRY.clone()
    }

    /// Register a constructor, replacing any previous one for `type_name`.
    pub fn register<F>(&self, type_name: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<Arc<dyn Block>> + Send + Sync + 'static,
    {
        let type_name = type_name.into();
        let previous = self
            .factories
            .write()
            .insert(type_name.clone(), Arc::new(factory));
        if previous.is_some() {
            warn!(block_type = %type_name, "block type already registered, overwriting");
        } else {
            debug!(block_type = %type_name, "registered block type");
        }
    }

    pub fn unregister(&self, type_name: &str) -> bool {
        let removed = self.factories.write().remove(type_name).is_some();
        if removed {
            debug!(block_type = type_name, "unregistered block type");
        } else {
            warn!(block_type = type_name, "block type not registered");
        }
        removed
    }

    /// Build a fresh block. Constructor errors and panics are reported as a
    /// normal failure.
    pub fn create(&self, type_name: &str) -> Result<Arc<dyn Block>> {
        // Run the constructor without holding the lock.
        let factory = self
            .factories
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownBlockType(type_name.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(Ok(block)) => {
                debug!(block_type = type_name, "created block");
                Ok(block)
            }
            Ok(Err(e)) => {
                error!(block_type = type_name, error = %e, "block constructor failed");
                Err(e)
            }
            Err(payload) => {
                let reason = format!("constructor panicked: {}", panic_message(&payload));
                error!(block_type = type_name, %reason, "block constructor failed");
                Err(PipelineError::Block {
                    block: type_name.to_string(),
                    reason,
                })
            }
        }
    }

    pub fn create_named(&self, type_name: &str, name: &str) -> Result<Arc<dyn Block>> {
        let block = self.create(type_name)?;
        block.core().set_name(name);
        Ok(block)
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }

    pub fn clear(&self) {
        self.factories.write().clear();
        debug!("cleared block registry");
    }
}

impl std::fmt::Debug for BlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
