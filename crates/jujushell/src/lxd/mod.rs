//! Container backend adapter.
//!
//! Everything the server needs from the LXD daemon is behind the [`Client`]
//! trait: listing, creating, starting, stopping and deleting containers,
//! waiting for their address, pushing files and executing commands. The
//! production implementation speaks the REST API over the daemon's unix
//! socket; tests substitute fakes.
//!
//! Long-running daemon operations (create, state changes, exec) are hidden
//! behind calls that block until the operation completes, so callers never
//! see operation handles.

mod client;
mod error;
mod http;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

pub use client::{LxdClient, UnixConnector};
pub use error::{Error, Result};

/// A container known to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// The container name, which doubles as the per-user key.
    pub name: String,
    /// Whether the backend reports the container as running.
    pub started: bool,
}

/// Operations the server performs against the container daemon.
#[async_trait]
pub trait Client: Send + Sync {
    /// All existing containers.
    async fn all(&self) -> Result<Vec<Container>>;

    /// The container with the given name, or [`Error::NotFound`].
    async fn get(&self, name: &str) -> Result<Container>;

    /// Create a container from the image with the given name and profiles,
    /// waiting for the create operation to finish.
    async fn create(&self, image: &str, name: &str, profiles: &[String]) -> Result<Container>;

    /// Delete the container. It is assumed to exist and not be running.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Start the container and wait for the operation to finish.
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop the container and wait for the operation to finish.
    async fn stop(&self, name: &str) -> Result<()>;

    /// The container's public IPv4 address. Waits up to 30 seconds for the
    /// address to appear on the bridge.
    async fn addr(&self, name: &str) -> Result<String>;

    /// Write a file into the container, creating missing parent directories.
    /// Files are created with mode 0600, directories with 0700, both owned
    /// like the deepest pre-existing ancestor.
    async fn write_file(&self, name: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Execute a command in the container and return its standard output.
    /// Identical concurrent invocations on the same container collapse into
    /// one execution.
    async fn exec(&self, name: &str, command: &[&str]) -> Result<String>;
}

/// Dials backend clients.
///
/// Each session handler invocation, idle-timer callback and sweeper run
/// receives its own client, so no session can poison another's connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Client>>;
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Shared in-memory fakes for the backend seam.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, PoisonError};

    use async_trait::async_trait;

    use super::{Client, Connector, Container, Error, Result};

    /// A scripted call record.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        All,
        Get(String),
        Create(String),
        Delete(String),
        Start(String),
        Stop(String),
        Addr(String),
        WriteFile(String, String),
        Exec(String, String),
    }

    #[derive(Default)]
    pub struct State {
        /// name -> started
        pub containers: HashMap<String, bool>,
        pub files: Vec<(String, String, Vec<u8>)>,
        pub calls: Vec<Call>,
        pub addr: String,
        pub fail_create: bool,
        pub fail_start: bool,
        pub fail_stop: bool,
        pub fail_exec: Option<String>,
        pub fail_addr: bool,
        pub fail_get: bool,
    }

    /// An in-memory [`Client`] recording every call it receives.
    #[derive(Clone, Default)]
    pub struct FakeLxd {
        pub state: Arc<Mutex<State>>,
    }

    impl FakeLxd {
        pub fn new() -> Self {
            let fake = Self::default();
            fake.lock().addr = "10.0.0.42".to_string();
            fake
        }

        pub fn with_running(self, name: &str) -> Self {
            self.lock().containers.insert(name.to_string(), true);
            self
        }

        pub fn with_stopped(self, name: &str) -> Self {
            self.lock().containers.insert(name.to_string(), false);
            self
        }

        pub fn lock(&self) -> std::sync::MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn calls(&self) -> Vec<Call> {
            self.lock().calls.clone()
        }

        pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
            self.lock().calls.iter().filter(|call| matches(call)).count()
        }
    }

    #[async_trait]
    impl Client for FakeLxd {
        async fn all(&self) -> Result<Vec<Container>> {
            let mut state = self.lock();
            state.calls.push(Call::All);
            let mut containers: Vec<Container> = state
                .containers
                .iter()
                .map(|(name, started)| Container {
                    name: name.clone(),
                    started: *started,
                })
                .collect();
            containers.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(containers)
        }

        async fn get(&self, name: &str) -> Result<Container> {
            let mut state = self.lock();
            state.calls.push(Call::Get(name.to_string()));
            if state.fail_get {
                return Err(Error::Transport("cannot reach the daemon".to_string()));
            }
            match state.containers.get(name) {
                Some(started) => Ok(Container {
                    name: name.to_string(),
                    started: *started,
                }),
                None => Err(Error::NotFound(name.to_string())),
            }
        }

        async fn create(&self, _image: &str, name: &str, _profiles: &[String]) -> Result<Container> {
            let mut state = self.lock();
            state.calls.push(Call::Create(name.to_string()));
            if state.fail_create {
                return Err(Error::Operation {
                    action: "create container".to_string(),
                    reason: "no such image".to_string(),
                });
            }
            state.containers.insert(name.to_string(), false);
            Ok(Container {
                name: name.to_string(),
                started: false,
            })
        }

        async fn delete(&self, name: &str) -> Result<()> {
            let mut state = self.lock();
            state.calls.push(Call::Delete(name.to_string()));
            state.containers.remove(name);
            Ok(())
        }

        async fn start(&self, name: &str) -> Result<()> {
            let mut state = self.lock();
            state.calls.push(Call::Start(name.to_string()));
            if state.fail_start {
                return Err(Error::Operation {
                    action: "start container".to_string(),
                    reason: "boot failure".to_string(),
                });
            }
            state.containers.insert(name.to_string(), true);
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<()> {
            let mut state = self.lock();
            state.calls.push(Call::Stop(name.to_string()));
            if state.fail_stop {
                return Err(Error::Operation {
                    action: "stop container".to_string(),
                    reason: "stop failure".to_string(),
                });
            }
            state.containers.insert(name.to_string(), false);
            Ok(())
        }

        async fn addr(&self, name: &str) -> Result<String> {
            let mut state = self.lock();
            state.calls.push(Call::Addr(name.to_string()));
            if state.fail_addr {
                return Err(Error::AddrTimeout(name.to_string()));
            }
            Ok(state.addr.clone())
        }

        async fn write_file(&self, name: &str, path: &str, data: &[u8]) -> Result<()> {
            let mut state = self.lock();
            state
                .calls
                .push(Call::WriteFile(name.to_string(), path.to_string()));
            state
                .files
                .push((name.to_string(), path.to_string(), data.to_vec()));
            Ok(())
        }

        async fn exec(&self, name: &str, command: &[&str]) -> Result<String> {
            let cmdstr = command.join(" ");
            let mut state = self.lock();
            state.calls.push(Call::Exec(name.to_string(), cmdstr.clone()));
            if let Some(failing) = &state.fail_exec
                && cmdstr.contains(failing.as_str())
            {
                return Err(Error::CommandFailed {
                    command: cmdstr,
                    code: 1,
                    stderr: "scripted failure".to_string(),
                });
            }
            Ok(String::new())
        }
    }

    /// A connector handing out clones of one [`FakeLxd`].
    pub struct FakeConnector {
        pub client: FakeLxd,
    }

    impl FakeConnector {
        pub fn new(client: FakeLxd) -> Self {
            Self { client }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Arc<dyn Client>> {
            Ok(Arc::new(self.client.clone()))
        }
    }
}
