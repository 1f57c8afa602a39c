//! The production LXD client, speaking the REST API over the daemon socket.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hyper::Method;
use serde::Serialize;
use tokio::net::UnixStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::poll::{self, Probe};
use crate::singleflight::Group;

use super::error::{Error, Result};
use super::http::{UnixHttp, query_encode};
use super::types::{
    ContainerInfo, ContainerState, CreateRequest, CreateSource, Envelope, ExecRequest, Operation,
    StateUpdate,
};
use super::{Client, Connector, Container};

/// How long a container may take to expose a routable address.
const ADDR_ATTEMPTS: usize = 300;
const ADDR_INTERVAL: Duration = Duration::from_millis(100);

/// An LXD client bound to the daemon socket.
///
/// Requests dial their own streams, so clients are cheap to clone and a
/// single misbehaving exchange cannot poison anyone else's.
#[derive(Clone)]
pub struct LxdClient {
    http: UnixHttp,
    exec_group: Group<String, Error>,
    file_group: Group<(i64, i64), Error>,
}

impl LxdClient {
    pub(crate) fn new(
        socket: PathBuf,
        exec_group: Group<String, Error>,
        file_group: Group<(i64, i64), Error>,
    ) -> Self {
        Self {
            http: UnixHttp::new(socket),
            exec_group,
            file_group,
        }
    }

    async fn get_envelope(&self, path: &str) -> Result<Envelope> {
        let (_, _, body) = self
            .http
            .request(Method::GET, path, &[], Bytes::new())
            .await?;
        Envelope::parse(&body)
    }

    async fn send_json<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
    ) -> Result<Envelope> {
        let body = serde_json::to_vec(payload)
            .map_err(|err| Error::Payload(format!("cannot encode request: {err}")))?;
        let headers = [("content-type", "application/json".to_string())];
        let (_, _, body) = self
            .http
            .request(method, path, &headers, Bytes::from(body))
            .await?;
        Envelope::parse(&body)
    }

    /// Block until the operation with the given id completes.
    async fn wait_operation(&self, id: &str, action: &str) -> Result<Operation> {
        let envelope = self
            .get_envelope(&format!("/1.0/operations/{id}/wait"))
            .await?;
        let operation: Operation = envelope.decode_metadata()?;
        if !operation.succeeded() {
            let reason = if operation.err.is_empty() {
                format!("status code {}", operation.status_code)
            } else {
                operation.err.clone()
            };
            return Err(Error::Operation {
                action: action.to_string(),
                reason,
            });
        }
        Ok(operation)
    }

    /// Submit a request that yields a background operation and wait for it.
    async fn run_to_completion<T: Serialize>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        action: &str,
    ) -> Result<Operation> {
        let envelope = self.send_json(method, path, payload).await?;
        let id = envelope.operation_id()?.to_string();
        self.wait_operation(&id, action).await
    }

    /// Probe path metadata inside the container. `None` means the path does
    /// not exist (or cannot be read, in which case creating it will report
    /// the real problem).
    async fn file_meta(&self, name: &str, path: &str) -> Result<Option<FileMeta>> {
        let uri = format!(
            "/1.0/containers/{name}/files?path={}",
            query_encode(path)
        );
        let (status, headers, _) = self
            .http
            .request(Method::GET, &uri, &[], Bytes::new())
            .await?;
        if !status.is_success() {
            return Ok(None);
        }
        let text = |key: &str| {
            headers
                .get(key)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let id = |key: &str| text(key).parse::<i64>().unwrap_or(0);
        Ok(Some(FileMeta {
            kind: text("x-lxd-type"),
            uid: id("x-lxd-uid"),
            gid: id("x-lxd-gid"),
        }))
    }

    async fn push_file(
        &self,
        name: &str,
        path: &str,
        data: &[u8],
        uid: i64,
        gid: i64,
        mode: &str,
        kind: Option<&str>,
    ) -> Result<()> {
        let uri = format!(
            "/1.0/containers/{name}/files?path={}",
            query_encode(path)
        );
        let mut headers = vec![
            ("x-lxd-uid", uid.to_string()),
            ("x-lxd-gid", gid.to_string()),
            ("x-lxd-mode", mode.to_string()),
        ];
        if let Some(kind) = kind {
            headers.push(("x-lxd-type", kind.to_string()));
        }
        let (_, _, body) = self
            .http
            .request(Method::POST, &uri, &headers, Bytes::copy_from_slice(data))
            .await?;
        Envelope::parse(&body)?;
        Ok(())
    }

    /// Create (if missing) every directory leading to `path`, shallowest
    /// first, and return the uid/gid of the deepest existing ancestor so
    /// that new entries inherit its ownership.
    async fn mkdir(&self, name: &str, path: &str) -> Result<(i64, i64)> {
        let (mut uid, mut gid) = (0, 0);
        for dir in dir_chain(path) {
            match self.file_meta(name, &dir).await? {
                Some(meta) if meta.kind != "directory" => {
                    return Err(Error::PathConflict { path: dir });
                }
                Some(meta) => {
                    uid = meta.uid;
                    gid = meta.gid;
                }
                None => {
                    self.push_file(name, &dir, &[], uid, gid, "0700", Some("directory"))
                        .await?;
                }
            }
        }
        Ok((uid, gid))
    }

    async fn attach_stream(
        &self,
        op_id: &str,
        secret: &str,
    ) -> Result<WebSocketStream<UnixStream>> {
        let stream = UnixStream::connect(self.http.socket())
            .await
            .map_err(|err| Error::Connect {
                socket: self.http.socket().display().to_string(),
                reason: err.to_string(),
            })?;
        let url = format!("ws://lxd/1.0/operations/{op_id}/websocket?secret={secret}");
        let (ws, _) = tokio_tungstenite::client_async(url, stream)
            .await
            .map_err(|err| Error::Transport(format!("cannot attach to exec stream: {err}")))?;
        Ok(ws)
    }

    async fn update_state(&self, name: &str, action: &str) -> Result<()> {
        let request = StateUpdate {
            action,
            timeout: -1,
        };
        self.run_to_completion(
            Method::PUT,
            &format!("/1.0/containers/{name}/state"),
            &request,
            &format!("{action} container"),
        )
        .await?;
        Ok(())
    }

    async fn exec_once(&self, name: &str, command: &[String]) -> Result<String> {
        let cmdstr = command.join(" ");
        let request = ExecRequest {
            command,
            wait_for_websocket: true,
            interactive: false,
        };
        let envelope = self
            .send_json(
                Method::POST,
                &format!("/1.0/containers/{name}/exec"),
                &request,
            )
            .await?;
        let op_id = envelope.operation_id()?.to_string();
        let operation: Operation = envelope.decode_metadata()?;

        // The process only starts once every declared stream is attached.
        let mut stdin = self
            .attach_stream(&op_id, operation.fd_secret("0")?)
            .await?;
        let stdout = self
            .attach_stream(&op_id, operation.fd_secret("1")?)
            .await?;
        let stderr = self
            .attach_stream(&op_id, operation.fd_secret("2")?)
            .await?;
        // Nothing is ever written to stdin: close it so the command sees EOF.
        stdin
            .close(None)
            .await
            .map_err(|err| Error::Transport(format!("cannot close exec stdin: {err}")))?;
        let (stdout, stderr) = tokio::try_join!(read_stream(stdout), read_stream(stderr))?;

        let done = self.wait_operation(&op_id, "execute command").await?;
        let code = done.return_code()?;
        if code != 0 {
            return Err(Error::CommandFailed {
                command: cmdstr,
                code,
                stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }
}

#[async_trait]
impl Client for LxdClient {
    async fn all(&self) -> Result<Vec<Container>> {
        let envelope = self.get_envelope("/1.0/containers?recursion=1").await?;
        let infos: Vec<ContainerInfo> = envelope.decode_metadata()?;
        Ok(infos.into_iter().map(Container::from_info).collect())
    }

    async fn get(&self, name: &str) -> Result<Container> {
        match self
            .get_envelope(&format!("/1.0/containers/{name}"))
            .await
        {
            Ok(envelope) => {
                let info: ContainerInfo = envelope.decode_metadata()?;
                Ok(Container::from_info(info))
            }
            Err(Error::Api { code: 404, .. }) => Err(Error::NotFound(name.to_string())),
            Err(err) => Err(err),
        }
    }

    async fn create(&self, image: &str, name: &str, profiles: &[String]) -> Result<Container> {
        let request = CreateRequest {
            name,
            source: CreateSource {
                kind: "image",
                alias: image,
            },
            profiles,
        };
        self.run_to_completion(
            Method::POST,
            "/1.0/containers",
            &request,
            "create container",
        )
        .await?;
        Ok(Container {
            name: name.to_string(),
            started: false,
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let (_, _, body) = self
            .http
            .request(
                Method::DELETE,
                &format!("/1.0/containers/{name}"),
                &[],
                Bytes::new(),
            )
            .await?;
        let envelope = Envelope::parse(&body)?;
        let id = envelope.operation_id()?.to_string();
        self.wait_operation(&id, "delete container").await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.update_state(name, "start").await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.update_state(name, "stop").await
    }

    async fn addr(&self, name: &str) -> Result<String> {
        let path = format!("/1.0/containers/{name}/state");
        let result = poll::poll(ADDR_INTERVAL, ADDR_ATTEMPTS, || {
            let client = self.clone();
            let path = path.clone();
            async move {
                let envelope = match client.get_envelope(&path).await {
                    Ok(envelope) => envelope,
                    Err(err) => return Probe::Fatal(err),
                };
                let state: ContainerState = match envelope.decode_metadata() {
                    Ok(state) => state,
                    Err(err) => return Probe::Fatal(err),
                };
                if let Some(network) = state.network.get("eth0") {
                    for addr in &network.addresses {
                        if addr.family == "inet" && addr.scope == "global" && !addr.address.is_empty()
                        {
                            return Probe::Ready(addr.address.clone());
                        }
                    }
                }
                Probe::NotReady
            }
        })
        .await;
        match result {
            Ok(addr) => Ok(addr),
            Err(poll::PollError::Fatal(err)) => Err(err),
            Err(poll::PollError::TimedOut) => Err(Error::AddrTimeout(name.to_string())),
        }
    }

    async fn write_file(&self, name: &str, path: &str, data: &[u8]) -> Result<()> {
        let dir = match path.rsplit_once('/') {
            Some((dir, file)) if !dir.is_empty() && !file.is_empty() => dir.to_string(),
            _ => {
                return Err(Error::Payload(format!(
                    "cannot derive parent directory for {path:?}"
                )));
            }
        };
        // Concurrent writes into the same tree walk the ancestry once.
        let key = format!("{name}:{dir}");
        let client = self.clone();
        let owner = {
            let name = name.to_string();
            let dir = dir.clone();
            self.file_group
                .work(&key, async move { client.mkdir(&name, &dir).await })
                .await?
        };
        self.push_file(name, path, data, owner.0, owner.1, "0600", None)
            .await
    }

    async fn exec(&self, name: &str, command: &[&str]) -> Result<String> {
        let command: Vec<String> = command.iter().map(|arg| arg.to_string()).collect();
        let key = format!("{name}:{}", command.join(" "));
        let client = self.clone();
        let name = name.to_string();
        self.exec_group
            .work(&key, async move { client.exec_once(&name, &command).await })
            .await
    }
}

impl Container {
    fn from_info(info: ContainerInfo) -> Self {
        Self {
            started: info.status != "Stopped",
            name: info.name,
        }
    }
}

struct FileMeta {
    kind: String,
    uid: i64,
    gid: i64,
}

async fn read_stream(mut ws: WebSocketStream<UnixStream>) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    while let Some(frame) = ws.next().await {
        match frame.map_err(|err| Error::Transport(format!("exec stream failed: {err}")))? {
            Message::Binary(data) => buf.extend_from_slice(&data),
            Message::Text(text) => buf.extend_from_slice(text.as_bytes()),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(buf)
}

/// All directories leading to `path`, shallowest first.
fn dir_chain(path: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut acc = String::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        acc.push('/');
        acc.push_str(segment);
        chain.push(acc.clone());
    }
    chain
}

/// Produces LXD clients bound to the daemon socket at a fixed path.
///
/// The single-flight groups deduplicating file and exec operations live
/// here, so they are shared by every client this connector hands out.
pub struct UnixConnector {
    socket: PathBuf,
    exec_group: Group<String, Error>,
    file_group: Group<(i64, i64), Error>,
}

impl UnixConnector {
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket,
            exec_group: Group::new(),
            file_group: Group::new(),
        }
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> Result<std::sync::Arc<dyn Client>> {
        let client = LxdClient::new(
            self.socket.clone(),
            self.exec_group.clone(),
            self.file_group.clone(),
        );
        // Probe the API root so that an unreachable daemon surfaces here
        // rather than in the middle of a session.
        client.get_envelope("/1.0").await?;
        Ok(std::sync::Arc::new(client))
    }
}
