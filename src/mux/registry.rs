//! Named multiplexer instances.

use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::engine::TransformEngine;
use super::multiplexer::Multiplexer;
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};

/// Owns a bounded set of named multiplexers.
///
/// Removing an instance, or tearing the registry down, shuts the instance
/// down: blocked pulls and index reads return [`MuxError::Disconnected`] and
/// every later call on a retained `Arc` fails the same way.
pub struct Registry {
    muxes: Mutex<HashMap<String, Arc<Multiplexer>>>,
    capacity: usize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            muxes: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Creates and registers a multiplexer under `name`.
    pub fn create(
        &self,
        name: &str,
        config: MuxConfig,
        engine: Box<dyn TransformEngine>,
    ) -> Result<Arc<Multiplexer>> {
        let mut muxes = self.muxes.lock();
        if muxes.contains_key(name) {
            return Err(MuxError::Config(format!("multiplexer {} already exists", name)));
        }
        if muxes.len() >= self.capacity {
            return Err(MuxError::ResourceExhausted(format!(
                "registry holds {} multiplexers",
                self.capacity
            )));
        }
        let mux = Arc::new(Multiplexer::new(config, engine)?);
        muxes.insert(name.to_string(), Arc::clone(&mux));
        info!("registered multiplexer {}", name);
        Ok(mux)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Multiplexer>> {
        self.muxes.lock().get(name).cloned()
    }

    /// Unregisters and shuts down one instance.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mux = self
            .muxes
            .lock()
            .remove(name)
            .ok_or(MuxError::InvalidHandle)?;
        mux.shutdown();
        info!("removed multiplexer {}", name);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.muxes.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.muxes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts down every instance and empties the registry.
    pub fn teardown(&self) {
        let drained: Vec<(String, Arc<Multiplexer>)> = self.muxes.lock().drain().collect();
        for (name, mux) in drained {
            mux.shutdown();
            info!("tore down multiplexer {}", name);
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("names", &self.names())
            .field("capacity", &self.capacity)
            .finish()
    }
}
