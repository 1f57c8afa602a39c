//! The idle-container registry.
//!
//! Tracks every container believed to be running and stops each one after a
//! configurable period without activity. Sessions call
//! [`ActiveContainer::set_active`] on every client frame to push the
//! deadline forward; once a timer has fired the stop path owns the
//! container and further activity is ignored.
//!
//! The map mutex is only ever held for short, non-blocking sections; all
//! backend traffic happens outside of it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use log::debug;
use thiserror::Error;
use tokio::time::Instant;

use crate::lxd::{self, Connector};

#[derive(Debug, Error)]
enum StopError {
    #[error(transparent)]
    Backend(#[from] lxd::Error),

    #[error("container {0} is not started")]
    NotRunning(String),
}

/// Registry of currently active containers.
pub struct Registry {
    duration: Duration,
    connector: Arc<dyn Connector>,
    containers: Mutex<HashMap<String, Arc<ActiveContainer>>>,
}

impl Registry {
    /// Create a registry that stops containers after `duration` of
    /// inactivity (zero disables stopping), seeding it with the containers
    /// currently running on the backend.
    pub async fn new(
        duration: Duration,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<Self>, lxd::Error> {
        let registry = Arc::new(Self {
            duration,
            connector: Arc::clone(&connector),
            containers: Mutex::new(HashMap::new()),
        });
        let client = connector.connect().await?;
        for container in client.all().await? {
            if container.started {
                registry.get(&container.name);
            }
        }
        Ok(registry)
    }

    /// The active container with the given name, created with a fresh idle
    /// timer if the registry does not know it yet.
    pub fn get(self: &Arc<Self>, name: &str) -> Arc<ActiveContainer> {
        let mut containers = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(container) = containers.get(name) {
            return Arc::clone(container);
        }
        let container = Arc::new(ActiveContainer {
            name: name.to_string(),
            duration: self.duration,
            timer: Mutex::new(Timer {
                deadline: Instant::now() + self.duration,
                fired: false,
            }),
        });
        if !self.duration.is_zero() {
            spawn_timer(Arc::downgrade(self), Arc::clone(&container));
        }
        containers.insert(name.to_string(), Arc::clone(&container));
        container
    }

    /// Number of tracked containers.
    pub fn len(&self) -> usize {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the named container and, only if that succeeds, forget it.
    async fn stop(&self, name: &str) -> Result<(), StopError> {
        let client = self.connector.connect().await?;
        let container = client.get(name).await?;
        if !container.started {
            return Err(StopError::NotRunning(name.to_string()));
        }
        client.stop(name).await?;
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Ok(())
    }
}

/// A container currently considered running.
pub struct ActiveContainer {
    name: String,
    duration: Duration,
    timer: Mutex<Timer>,
}

struct Timer {
    deadline: Instant,
    fired: bool,
}

impl ActiveContainer {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record activity on the container, postponing the idle stop. Once the
    /// timer has fired the stop path owns the container and this is a no-op.
    pub fn set_active(&self) {
        let mut timer = self.timer.lock().unwrap_or_else(PoisonError::into_inner);
        if !timer.fired {
            timer.deadline = Instant::now() + self.duration;
        }
    }
}

/// Sleep towards the container's deadline, re-sleeping whenever activity
/// has pushed it forward, and drive the stop once it truly expires.
fn spawn_timer(registry: Weak<Registry>, container: Arc<ActiveContainer>) {
    tokio::spawn(async move {
        loop {
            let deadline = {
                let timer = container
                    .timer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                timer.deadline
            };
            tokio::time::sleep_until(deadline).await;
            let fire = {
                let mut timer = container
                    .timer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if Instant::now() >= timer.deadline {
                    timer.fired = true;
                    true
                } else {
                    false
                }
            };
            if !fire {
                continue;
            }
            let Some(registry) = registry.upgrade() else {
                return;
            };
            debug!(
                "stopping container {} for inactivity",
                container.name
            );
            if let Err(err) = registry.stop(&container.name).await {
                debug!(
                    "cannot stop container {} for inactivity: {err}",
                    container.name
                );
            }
            return;
        }
    });
}
