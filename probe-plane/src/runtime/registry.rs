//! Process-wide client registry
//!
//! Maps client names to their runtime instances. Names are unique: a client
//! attaching under a name that is already taken gets `name$1`, `name$2`, ...
//! and is told so with a `Rename` command before anything else it sends.
//! Terminated instances give up their names the next time a client attaches.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use probe_plane_common::{Command, CommandListener};

use super::instance::RuntimeInstance;
use crate::config::RuntimeConfig;
use crate::domain::{LifecycleState, RuntimeError};
use crate::handlers::HandlerRegistry;

#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, Arc<RuntimeInstance>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an instance under a unique name
    ///
    /// # Errors
    /// Propagates [`RuntimeInstance::new`] failures
    pub fn attach<L>(
        &self,
        mut config: RuntimeConfig,
        handlers: HandlerRegistry,
        listener: L,
    ) -> Result<Arc<RuntimeInstance>, RuntimeError>
    where
        L: CommandListener + 'static,
    {
        let mut clients = self.clients.lock();
        clients.retain(|_, runtime| runtime.state() != LifecycleState::Terminated);

        let requested = config.client_name.clone();
        let unique = unique_name(&clients, &requested);
        let renamed = unique != requested;
        config.client_name.clone_from(&unique);

        let runtime = RuntimeInstance::new(config, handlers, listener)?;
        if renamed {
            info!("Client {requested} registered as {unique}");
            runtime.send(Command::Rename { new_name: unique.clone() });
        }
        clients.insert(unique, Arc::clone(&runtime));
        Ok(runtime)
    }

    pub fn get(&self, name: &str) -> Option<Arc<RuntimeInstance>> {
        self.clients.lock().get(name).cloned()
    }

    /// Remove `name` and exit it with `code`; false if no such client
    pub fn detach(&self, name: &str, code: i32) -> bool {
        let removed = self.clients.lock().remove(name);
        match removed {
            Some(runtime) => {
                runtime.exit(code);
                true
            }
            None => false,
        }
    }

    /// Exit every registered client; returns how many were detached
    pub fn shutdown(&self, code: i32) -> usize {
        let clients: Vec<Arc<RuntimeInstance>> =
            self.clients.lock().drain().map(|(_, runtime)| runtime).collect();
        debug!("Shutting down {} clients", clients.len());
        for runtime in &clients {
            runtime.exit(code);
        }
        clients.len()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

fn unique_name(clients: &HashMap<String, Arc<RuntimeInstance>>, requested: &str) -> String {
    if !clients.contains_key(requested) {
        return requested.to_string();
    }
    (1u32..)
        .map(|suffix| format!("{requested}${suffix}"))
        .find(|candidate| !clients.contains_key(candidate))
        .unwrap_or_else(|| requested.to_string())
}
