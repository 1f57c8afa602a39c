//! Idempotent container provisioning.
//!
//! [`Ensurer::ensure`] makes a ready-to-use container exist for a user:
//! list, create if absent, start if stopped, wait for the address — all
//! under a per-container single-flight so that concurrent sessions for the
//! same user drive exactly one provisioning sequence — then re-run
//! credential injection, which must happen on every call because the
//! caller's credentials may have rotated.

use std::sync::Arc;

use log::{debug, warn};
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::inject;
use crate::juju::{Credentials, Info};
use crate::lxd::{self, Client};
use crate::singleflight::{self, Group};

/// Container names are cropped to this length; longer names are rejected
/// by the backend.
const MAX_NAME_LEN: usize = 60;

/// Provisioning failures.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error(transparent)]
    Backend(#[from] lxd::Error),

    #[error(transparent)]
    Injection(#[from] inject::Error),

    #[error("container provisioning interrupted")]
    Interrupted,
}

impl From<singleflight::Interrupted> for Error {
    fn from(_: singleflight::Interrupted) -> Self {
        Error::Interrupted
    }
}

impl Error {
    pub fn category(&self) -> &'static str {
        match self {
            Error::Backend(err) => err.category(),
            Error::Injection(err) => err.category(),
            Error::Interrupted => "backend",
        }
    }
}

/// The container name for the given user.
///
/// The SHA-1 prefix makes names unique per user, so that hijacking another
/// user's container is never possible; the sanitized suffix keeps them
/// recognizable when operating the machine.
pub fn container_name(username: &str) -> String {
    let sum = hex::encode(Sha1::digest(username.as_bytes()));
    let sanitized = username.replace(['@', '+', '.', '_'], "-");
    let mut name = format!("ts-{sum}-{sanitized}");
    if name.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// Makes containers exist, once per user at a time.
#[derive(Default)]
pub struct Ensurer {
    group: Group<String, Error>,
}

impl Ensurer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a running, logged-in container for the user in `info` and
    /// return its name and address.
    ///
    /// On any failure the container is torn down best-effort before the
    /// error is returned.
    pub async fn ensure(
        &self,
        client: Arc<dyn Client>,
        image: &str,
        profiles: &[String],
        info: &Info,
        creds: &Credentials,
    ) -> Result<(String, String), Error> {
        let name = container_name(&info.user);
        let flight = {
            let client = Arc::clone(&client);
            let image = image.to_string();
            let profiles = profiles.to_vec();
            let key = name.clone();
            self.group
                .work(&name, async move {
                    provision(client, &image, &profiles, &key).await
                })
                .await
        };
        let addr = match flight {
            Ok(addr) => addr,
            Err(err) => {
                teardown(client.as_ref(), &name).await;
                return Err(err);
            }
        };

        debug!("preparing juju in container {name}");
        if let Err(err) = inject::prepare(client.as_ref(), &name, info, creds).await {
            teardown(client.as_ref(), &name).await;
            return Err(err.into());
        }
        Ok((name, addr))
    }
}

/// One provisioning sequence: runs as the single flight for a container.
async fn provision(
    client: Arc<dyn Client>,
    image: &str,
    profiles: &[String],
    name: &str,
) -> Result<String, Error> {
    let containers = client.all().await?;
    let (created, started) = match containers.iter().find(|c| c.name == name) {
        Some(container) => (true, container.started),
        None => (false, false),
    };
    if !created {
        debug!("creating container {name} from image {image}");
        client.create(image, name, profiles).await?;
    }
    if !started {
        debug!("starting container {name}");
        client.start(name).await?;
    }
    Ok(client.addr(name).await?)
}

/// Best-effort teardown of a container: run the session teardown hook,
/// stop, delete. Failures are logged and swallowed so that teardown never
/// masks the error that triggered it.
pub async fn teardown(client: &dyn Client, name: &str) {
    debug!("tearing down the shell session in container {name}");
    if let Err(err) = client
        .exec(
            name,
            &["su", "-", inject::CONTAINER_USER, "-c", "~/.session teardown"],
        )
        .await
    {
        debug!("cannot tear down the shell session in container {name}: {err}");
    }
    debug!("stopping container {name}");
    if let Err(err) = client.stop(name).await {
        debug!("cannot stop container {name}: {err}");
    }
    debug!("deleting container {name}");
    if let Err(err) = client.delete(name).await {
        warn!("cannot delete container {name}: {err}");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::juju::CONTROLLER_NAME;
    use crate::lxd::fakes::{Call, FakeLxd};

    fn info(user: &str) -> Info {
        Info {
            user: user.to_string(),
            controller_name: CONTROLLER_NAME.to_string(),
            controller_uuid: "uuid-123".to_string(),
            ca_cert: "certificate".to_string(),
            endpoints: vec!["1.2.3.4:17070".to_string()],
        }
    }

    fn creds() -> Credentials {
        let mut macaroons = HashMap::new();
        macaroons.insert(
            "https://id.example/".to_string(),
            vec![serde_json::json!({"identifier": "id"})],
        );
        Credentials {
            macaroons,
            ..Default::default()
        }
    }

    #[test]
    fn names_are_deterministic_and_unique() {
        let a = container_name("who@external");
        assert_eq!(a, container_name("who@external"));
        assert!(a.starts_with("ts-"));
        assert_ne!(a, container_name("other@external"));
    }

    #[test]
    fn names_are_cropped_to_sixty_characters() {
        let name = container_name("these.are@the++voy_age");
        assert_eq!(name.len(), 60);
        // The sanitized human-readable suffix survives up to the crop point.
        assert!(name.ends_with("-these-are-the--v"));
    }

    #[test]
    fn short_names_are_not_cropped() {
        let name = container_name("bob");
        assert_eq!(name, format!("ts-{}-bob", hex::encode(Sha1::digest(b"bob"))));
        assert!(name.len() < 60);
    }

    #[tokio::test]
    async fn fresh_user_creates_and_starts() {
        let fake = FakeLxd::new();
        let ensurer = Ensurer::new();
        let (name, addr) = ensurer
            .ensure(
                Arc::new(fake.clone()),
                "termserver",
                &["default".to_string()],
                &info("who@external"),
                &creds(),
            )
            .await
            .unwrap();
        assert_eq!(name, container_name("who@external"));
        assert_eq!(addr, "10.0.0.42");
        assert_eq!(fake.count(|c| matches!(c, Call::Create(_))), 1);
        assert_eq!(fake.count(|c| matches!(c, Call::Start(_))), 1);
        assert_eq!(fake.count(|c| matches!(c, Call::Addr(_))), 1);
        // Credential injection ran.
        assert_eq!(fake.count(|c| matches!(c, Call::WriteFile(..))), 2);
        assert_eq!(fake.count(|c| matches!(c, Call::Exec(..))), 2);
    }

    #[tokio::test]
    async fn returning_user_reuses_the_running_container() {
        let name = container_name("who@external");
        let fake = FakeLxd::new().with_running(&name);
        let ensurer = Ensurer::new();
        ensurer
            .ensure(
                Arc::new(fake.clone()),
                "termserver",
                &[],
                &info("who@external"),
                &creds(),
            )
            .await
            .unwrap();
        assert_eq!(fake.count(|c| matches!(c, Call::Create(_))), 0);
        assert_eq!(fake.count(|c| matches!(c, Call::Start(_))), 0);
        // Injection still re-runs to refresh rotated credentials.
        assert_eq!(fake.count(|c| matches!(c, Call::WriteFile(..))), 2);
    }

    #[tokio::test]
    async fn stopped_container_is_started_again() {
        let name = container_name("who@external");
        let fake = FakeLxd::new().with_stopped(&name);
        let ensurer = Ensurer::new();
        ensurer
            .ensure(
                Arc::new(fake.clone()),
                "termserver",
                &[],
                &info("who@external"),
                &creds(),
            )
            .await
            .unwrap();
        assert_eq!(fake.count(|c| matches!(c, Call::Create(_))), 0);
        assert_eq!(fake.count(|c| matches!(c, Call::Start(_))), 1);
    }

    #[tokio::test]
    async fn sequential_ensures_provision_once_but_inject_twice() {
        let fake = FakeLxd::new();
        let ensurer = Ensurer::new();
        for _ in 0..2 {
            ensurer
                .ensure(
                    Arc::new(fake.clone()),
                    "termserver",
                    &[],
                    &info("who@external"),
                    &creds(),
                )
                .await
                .unwrap();
        }
        assert_eq!(fake.count(|c| matches!(c, Call::Create(_))), 1);
        assert_eq!(fake.count(|c| matches!(c, Call::WriteFile(..))), 4);
        assert_eq!(fake.count(|c| matches!(c, Call::Exec(..))), 4);
    }

    #[tokio::test]
    async fn concurrent_ensures_share_one_provisioning() {
        let fake = FakeLxd::new();
        let ensurer = Arc::new(Ensurer::new());
        let mut handles = Vec::new();
        for _ in 0..10 {
            let fake = fake.clone();
            let ensurer = Arc::clone(&ensurer);
            handles.push(tokio::spawn(async move {
                ensurer
                    .ensure(
                        Arc::new(fake),
                        "termserver",
                        &[],
                        &info("who@external"),
                        &creds(),
                    )
                    .await
            }));
        }
        let mut addrs = Vec::new();
        for handle in handles {
            let (_, addr) = handle.await.unwrap().unwrap();
            addrs.push(addr);
        }
        assert!(addrs.iter().all(|addr| addr == "10.0.0.42"));
        assert_eq!(fake.count(|c| matches!(c, Call::Create(_))), 1);
        assert_eq!(fake.count(|c| matches!(c, Call::Start(_))), 1);
        assert_eq!(fake.count(|c| matches!(c, Call::Addr(_))), 1);
        // Every session re-injects credentials.
        assert_eq!(fake.count(|c| matches!(c, Call::Exec(_, cmd) if cmd.contains("login"))), 10);
    }

    #[tokio::test]
    async fn create_failure_rolls_back() {
        let fake = FakeLxd::new();
        fake.lock().fail_create = true;
        let ensurer = Ensurer::new();
        let err = ensurer
            .ensure(
                Arc::new(fake.clone()),
                "termserver",
                &[],
                &info("who@external"),
                &creds(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "backend-operation");
        // Best-effort teardown: session hook, stop and delete all attempted.
        assert_eq!(fake.count(|c| matches!(c, Call::Stop(_))), 1);
        assert_eq!(fake.count(|c| matches!(c, Call::Delete(_))), 1);
    }

    #[tokio::test]
    async fn injection_failure_rolls_back() {
        let fake = FakeLxd::new();
        fake.lock().fail_exec = Some("juju login".to_string());
        let ensurer = Ensurer::new();
        let err = ensurer
            .ensure(
                Arc::new(fake.clone()),
                "termserver",
                &[],
                &info("who@external"),
                &creds(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category(), "command-failed");
        assert_eq!(fake.count(|c| matches!(c, Call::Delete(_))), 1);
    }
}
