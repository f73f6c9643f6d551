//! Management client for the command socket.
//!
//! One connection per request keeps the client stateless; the daemon
//! serializes all control operations anyway.

use std::path::{Path, PathBuf};

use tokio::net::UnixStream;
use tracing::trace;

use crate::config;
use crate::error::{Result, WardError};
use crate::loader::PluginSnapshot;
use crate::message::{read_message, write_message, MessageType, Opt, ProtocolMessage};
use crate::router::SubEdge;
use crate::scheduler::InstanceSnapshot;
use crate::server::DaemonInfo;

pub struct WardClient {
    socket_path: PathBuf,
}

impl WardClient {
    pub fn new() -> Self {
        Self {
            socket_path: config::command_socket_path(),
        }
    }

    pub fn with_socket(path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: path.into(),
        }
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(&self, msg: &ProtocolMessage) -> Result<ProtocolMessage> {
        trace!(opt = ?msg.opt, socket = %self.socket_path.display(), "sending request");
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        write_message(&mut stream, MessageType::Request, msg).await?;
        let (_, response) = read_message(&mut stream).await?;
        match response.opt {
            Opt::ResponseOk => Ok(response),
            Opt::ResponseError => Err(WardError::EnvironmentError(
                response.arg_str(0).unwrap_or("unknown error").to_string(),
            )),
            other => Err(WardError::Protocol(format!(
                "unexpected response opt {other:?}"
            ))),
        }
    }

    async fn request_json<T: serde::de::DeserializeOwned>(
        &self,
        msg: &ProtocolMessage,
    ) -> Result<T> {
        let response = self.request(msg).await?;
        serde_json::from_slice(response.arg_bytes(0)?)
            .map_err(|e| WardError::Codec(format!("json decode: {e}")))
    }

    /// Load a plugin from a shared object path. Returns the plugin name.
    pub async fn load(&self, path: &str) -> Result<String> {
        let mut msg = ProtocolMessage::new(Opt::Load);
        msg.push_str(path);
        let resp = self.request(&msg).await?;
        Ok(resp.arg_str(0)?.to_string())
    }

    pub async fn remove(&self, plugin: &str) -> Result<()> {
        let mut msg = ProtocolMessage::new(Opt::Remove);
        msg.push_str(plugin);
        self.request(&msg).await?;
        Ok(())
    }

    pub async fn enable(&self, instance: &str, param: &str) -> Result<()> {
        let mut msg = ProtocolMessage::new(Opt::Enabled);
        msg.push_str(instance).push_str(param);
        self.request(&msg).await?;
        Ok(())
    }

    pub async fn disable(&self, instance: &str, force: bool) -> Result<()> {
        let mut msg = ProtocolMessage::new(Opt::Disabled);
        msg.push_str(instance);
        if force {
            msg.push_str("force");
        }
        self.request(&msg).await?;
        Ok(())
    }

    pub async fn query(&self, instance: &str) -> Result<Vec<InstanceSnapshot>> {
        let mut msg = ProtocolMessage::new(Opt::Query);
        msg.push_str(instance);
        self.request_json(&msg).await
    }

    pub async fn query_all(&self) -> Result<Vec<InstanceSnapshot>> {
        self.request_json(&ProtocolMessage::new(Opt::QueryAll)).await
    }

    pub async fn sub_graph(&self, producer: &str) -> Result<Vec<SubEdge>> {
        let mut msg = ProtocolMessage::new(Opt::QuerySubGraph);
        msg.push_str(producer);
        self.request_json(&msg).await
    }

    pub async fn sub_graph_all(&self) -> Result<Vec<SubEdge>> {
        self.request_json(&ProtocolMessage::new(Opt::QueryAllSubGraph))
            .await
    }

    pub async fn list(&self) -> Result<Vec<PluginSnapshot>> {
        self.request_json(&ProtocolMessage::new(Opt::List)).await
    }

    pub async fn info(&self) -> Result<DaemonInfo> {
        self.request_json(&ProtocolMessage::new(Opt::Info)).await
    }

    /// Returns the daemon-side path of the plugin's shared object.
    pub async fn download(&self, plugin: &str) -> Result<PathBuf> {
        let mut msg = ProtocolMessage::new(Opt::Download);
        msg.push_str(plugin);
        let resp = self.request(&msg).await?;
        Ok(PathBuf::from(resp.arg_str(0)?))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(&ProtocolMessage::new(Opt::Shutdown)).await?;
        Ok(())
    }
}

impl Default for WardClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;
    use tokio::sync::mpsc;

    /// Accepts one connection per request, records the decoded message and
    /// answers with a bare OK.
    fn spawn_recorder(listener: UnixListener) -> mpsc::UnboundedReceiver<ProtocolMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let (msg_type, msg) = read_message(&mut stream).await.unwrap();
                assert_eq!(msg_type, MessageType::Request);
                write_message(
                    &mut stream,
                    MessageType::Response,
                    &ProtocolMessage::ok_str("ok"),
                )
                .await
                .unwrap();
                if tx.send(msg).is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn requests_carry_opt_and_positional_args() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        let mut seen = spawn_recorder(UnixListener::bind(&path).unwrap());
        let client = WardClient::with_socket(&path);

        client.load("/tmp/libdemo.so").await.unwrap();
        let msg = seen.recv().await.unwrap();
        assert_eq!(msg.opt, Opt::Load);
        assert_eq!(msg.arg_str(0).unwrap(), "/tmp/libdemo.so");

        client.enable("cpu_stat", "window=10").await.unwrap();
        let msg = seen.recv().await.unwrap();
        assert_eq!(msg.opt, Opt::Enabled);
        assert_eq!(msg.arg_str(0).unwrap(), "cpu_stat");
        assert_eq!(msg.arg_str(1).unwrap(), "window=10");

        client.remove("demo").await.unwrap();
        let msg = seen.recv().await.unwrap();
        assert_eq!(msg.opt, Opt::Remove);
        assert_eq!(msg.arg_str(0).unwrap(), "demo");
    }

    #[tokio::test]
    async fn disable_pushes_force_arg_only_when_forced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        let mut seen = spawn_recorder(UnixListener::bind(&path).unwrap());
        let client = WardClient::with_socket(&path);

        client.disable("cpu_stat", false).await.unwrap();
        let msg = seen.recv().await.unwrap();
        assert_eq!(msg.opt, Opt::Disabled);
        assert_eq!(msg.payload.len(), 1);
        assert_eq!(msg.arg_str(0).unwrap(), "cpu_stat");

        client.disable("cpu_stat", true).await.unwrap();
        let msg = seen.recv().await.unwrap();
        assert_eq!(msg.opt, Opt::Disabled);
        assert_eq!(msg.arg_str(1).unwrap(), "force");
    }

    #[tokio::test]
    async fn error_response_surfaces_daemon_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await.unwrap();
            let err = WardError::NotLoaded("ghost".to_string());
            write_message(&mut stream, MessageType::Response, &ProtocolMessage::err(&err))
                .await
                .unwrap();
        });

        let client = WardClient::with_socket(&path);
        let err = client.remove("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            WardError::EnvironmentError(text) if text.contains("ghost")
        ));
    }
}
