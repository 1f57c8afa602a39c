//! Credential injection.
//!
//! Materializes the controller identity inside a container so that the
//! `juju` CLI in the shell session is already logged in: two configuration
//! artifacts are written into the Juju data directory, then `juju login`
//! and the session setup hook run as the container user. The order is
//! fixed — both artifacts must exist before the login command reads them,
//! and the session hook expects a logged-in client.

use log::debug;
use thiserror::Error;

use crate::juju::{self, Credentials, Info};
use crate::lxd::{self, Client};

/// The in-image account owning shell sessions.
pub const CONTAINER_USER: &str = "ubuntu";
/// The directory used by the Juju CLI for its data, inside containers.
pub const JUJU_DATA_DIR: &str = "/home/ubuntu/.local/share/juju";

/// Injection failures.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A configuration artifact could not be produced.
    #[error("cannot marshal {artifact}: {reason}")]
    Artifact {
        artifact: &'static str,
        reason: String,
    },

    /// The backend refused a write or command.
    #[error(transparent)]
    Backend(#[from] lxd::Error),
}

impl Error {
    pub fn category(&self) -> &'static str {
        match self {
            Error::Artifact { .. } => "injection",
            Error::Backend(err) => err.category(),
        }
    }
}

/// Set up the Juju data directory in the container and log the user in.
///
/// This runs every time a session is ensured, not only on fresh creation,
/// because the caller's credentials may have rotated since the container
/// was built.
pub async fn prepare(
    client: &dyn Client,
    name: &str,
    info: &Info,
    creds: &Credentials,
) -> Result<(), Error> {
    if !creds.macaroons.is_empty() {
        debug!("writing macaroons to cookie jar in container {name}");
        let data = juju::cookies::marshal_jar(&creds.macaroons).map_err(|err| Error::Artifact {
            artifact: "authentication cookies",
            reason: err.to_string(),
        })?;
        let path = format!(
            "{JUJU_DATA_DIR}/cookies/{}.json",
            info.controller_name
        );
        client.write_file(name, &path, &data).await?;
    } else {
        debug!("writing accounts.yaml in container {name}");
        let data = juju::marshal_accounts(&info.controller_name, &creds.username, &creds.password)
            .map_err(|err| Error::Artifact {
                artifact: "Juju accounts",
                reason: err.to_string(),
            })?;
        client
            .write_file(name, &format!("{JUJU_DATA_DIR}/accounts.yaml"), &data)
            .await?;
    }

    debug!("writing controllers.yaml in container {name}");
    let data = juju::marshal_controllers(info).map_err(|err| Error::Artifact {
        artifact: "Juju controllers",
        reason: err.to_string(),
    })?;
    client
        .write_file(name, &format!("{JUJU_DATA_DIR}/controllers.yaml"), &data)
        .await?;

    debug!("logging into Juju in container {name}");
    let login = format!("juju login -c {}", info.controller_name);
    client
        .exec(name, &["su", "-", CONTAINER_USER, "-c", &login])
        .await?;

    debug!("initializing the shell session in container {name}");
    client
        .exec(
            name,
            &[
                "su",
                "-",
                CONTAINER_USER,
                "-c",
                "~/.session setup >> .session.log 2>&1",
            ],
        )
        .await?;

    Ok(())
}
