//! Unix-socket IPC server.
//!
//! Two listeners: a command socket (mode 0600) for management requests and
//! an SDK socket (mode 0660, shared with `sdk_group`) for subscribe,
//! unsubscribe and publish. Pushed DATA frames and responses for an SDK
//! connection are serialized through one writer task so frames never
//! interleave.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::data::{DataCodecRegistry, Topic};
use crate::error::{Result, WardError};
use crate::loader::PluginRegistry;
use crate::message::{
    encode_frame, read_message, write_message, MessageType, Opt, ProtocolMessage,
};
use crate::router::Subscriber;
use crate::scheduler::{PushFrame, SchedulerHandle};

pub struct ServerConfig {
    pub command_socket: PathBuf,
    pub sdk_socket: PathBuf,
    pub sdk_group: String,
}

/// INFO response body.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DaemonInfo {
    pub version: String,
    pub uptime_secs: u64,
    pub command_socket: String,
    pub sdk_socket: String,
    pub plugins: usize,
}

/// Traffic into the SDK writer task.
enum WriterEvent {
    Register { conn: u64, writer: OwnedWriteHalf },
    Deregister { conn: u64 },
    Frame(PushFrame),
}

pub struct WardServer {
    config: ServerConfig,
    scheduler: SchedulerHandle,
    plugins: Arc<Mutex<PluginRegistry>>,
    codecs: Arc<DataCodecRegistry>,
    push_rx: Mutex<Option<mpsc::Receiver<PushFrame>>>,
    next_conn: AtomicU64,
    started_at: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl WardServer {
    pub fn new(
        config: ServerConfig,
        scheduler: SchedulerHandle,
        plugins: Arc<Mutex<PluginRegistry>>,
        codecs: Arc<DataCodecRegistry>,
        push_rx: mpsc::Receiver<PushFrame>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            scheduler,
            plugins,
            codecs,
            push_rx: Mutex::new(Some(push_rx)),
            next_conn: AtomicU64::new(1),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub async fn run(self) -> Result<()> {
        let command_listener = bind_socket(&self.config.command_socket, 0o600)?;
        let sdk_listener = bind_socket(&self.config.sdk_socket, 0o660)?;
        apply_sdk_group(&self.config.sdk_socket, &self.config.sdk_group);

        info!(
            command = %self.config.command_socket.display(),
            sdk = %self.config.sdk_socket.display(),
            "IPC server listening"
        );

        let push_rx = self
            .push_rx
            .lock()
            .await
            .take()
            .ok_or(WardError::ChannelClosed)?;
        let (writer_tx, writer_rx) = mpsc::channel(crate::scheduler::PUSH_QUEUE_DEPTH);
        tokio::spawn(run_writer_pump(writer_rx, push_rx));

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let server = Arc::new(self);

        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let server = Arc::clone(&server);

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
                server.request_shutdown();
            });
        }

        loop {
            tokio::select! {
                conn = command_listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                server.handle_command_conn(stream).await;
                            });
                        }
                        Err(e) => error!(error = %e, "command socket accept error"),
                    }
                }
                conn = sdk_listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            let writer_tx = writer_tx.clone();
                            tokio::spawn(async move {
                                server.handle_sdk_conn(stream, writer_tx).await;
                            });
                        }
                        Err(e) => error!(error = %e, "sdk socket accept error"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        server.scheduler.shutdown().await;

        for path in [&server.config.command_socket, &server.config.sdk_socket] {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }

        info!("IPC server stopped");
        Ok(())
    }

    /// Trips the shutdown watch; `run` drains and returns.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    async fn handle_command_conn(&self, mut stream: UnixStream) {
        trace!("command connection accepted");
        loop {
            let request = match read_message(&mut stream).await {
                Ok((_, msg)) => msg,
                Err(e) => {
                    if !matches!(e, WardError::ConnectionClosed) && e.is_fatal_to_connection() {
                        warn!(error = %e, "command connection torn down");
                    } else if !e.is_fatal_to_connection() {
                        // Frame boundary is intact; report and keep reading.
                        let resp = ProtocolMessage::err(&e);
                        if write_message(&mut stream, MessageType::Response, &resp)
                            .await
                            .is_ok()
                        {
                            continue;
                        }
                    }
                    break;
                }
            };

            let opt = request.opt;
            let response = self.handle_command(&request).await;
            if let Err(e) = write_message(&mut stream, MessageType::Response, &response).await {
                warn!(error = %e, "failed to write command response");
                break;
            }
            if opt == Opt::Shutdown {
                break;
            }
        }
    }

    async fn handle_command(&self, request: &ProtocolMessage) -> ProtocolMessage {
        match self.dispatch_command(request).await {
            Ok(resp) => resp,
            Err(e) => {
                debug!(opt = ?request.opt, error = %e, "command failed");
                ProtocolMessage::err(&e)
            }
        }
    }

    async fn dispatch_command(&self, request: &ProtocolMessage) -> Result<ProtocolMessage> {
        match request.opt {
            Opt::Load => {
                let path = request.arg_str(0)?;
                let name = self.load_plugin(Path::new(path)).await?;
                Ok(ProtocolMessage::ok_str(&name))
            }
            Opt::Remove => {
                let name = request.arg_str(0)?;
                self.remove_plugin(name).await?;
                Ok(ProtocolMessage::ok_str(name))
            }
            Opt::Enabled => {
                let name = request.arg_str(0)?;
                let param = request.arg_str(1).unwrap_or("");
                self.scheduler
                    .enable(name.to_string(), param.to_string())
                    .await?;
                Ok(ProtocolMessage::ok_str(name))
            }
            Opt::Disabled => {
                let name = request.arg_str(0)?;
                let force = request.arg_str(1).map(|f| f == "force").unwrap_or(false);
                self.scheduler.disable(name.to_string(), force).await?;
                Ok(ProtocolMessage::ok_str(name))
            }
            Opt::Query => {
                let name = request.arg_str(0)?;
                let snaps = self.scheduler.snapshot(Some(name.to_string())).await?;
                Ok(ProtocolMessage::ok(vec![to_json(&snaps)?]))
            }
            Opt::QueryAll => {
                let snaps = self.scheduler.snapshot(None).await?;
                Ok(ProtocolMessage::ok(vec![to_json(&snaps)?]))
            }
            Opt::QuerySubGraph => {
                let producer = request.arg_str(0)?;
                let edges = self.scheduler.sub_graph(Some(producer.to_string())).await?;
                Ok(ProtocolMessage::ok(vec![to_json(&edges)?]))
            }
            Opt::QueryAllSubGraph => {
                let edges = self.scheduler.sub_graph(None).await?;
                Ok(ProtocolMessage::ok(vec![to_json(&edges)?]))
            }
            Opt::List => {
                let snaps = self.plugins.lock().await.snapshots();
                Ok(ProtocolMessage::ok(vec![to_json(&snaps)?]))
            }
            Opt::Info => {
                let info = DaemonInfo {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    command_socket: self.config.command_socket.display().to_string(),
                    sdk_socket: self.config.sdk_socket.display().to_string(),
                    plugins: self.plugins.lock().await.snapshots().len(),
                };
                Ok(ProtocolMessage::ok(vec![to_json(&info)?]))
            }
            Opt::Download => {
                let name = request.arg_str(0)?;
                let path = self.plugins.lock().await.path_of(name)?;
                Ok(ProtocolMessage::ok_str(&path.display().to_string()))
            }
            Opt::Shutdown => {
                info!("shutdown requested over command socket");
                self.request_shutdown();
                Ok(ProtocolMessage::ok_str("shutting down"))
            }
            Opt::Subscribe | Opt::Unsubscribe | Opt::Publish | Opt::Data => Err(
                WardError::Protocol("data-plane operation on command socket".to_string()),
            ),
            Opt::ResponseOk | Opt::ResponseError => Err(WardError::Protocol(
                "response opt in a request frame".to_string(),
            )),
        }
    }

    async fn load_plugin(&self, path: &Path) -> Result<String> {
        let mut registry = self.plugins.lock().await;
        let (name, instances) = registry.load(path)?;
        match self.scheduler.add_instances(name.clone(), instances).await {
            Ok(accepted) => {
                registry.commit(&name, accepted);
                Ok(name)
            }
            Err(e) => {
                // Scheduler dropped the instances before replying, so the
                // library handle can be released here.
                registry.discard(&name);
                Err(e)
            }
        }
    }

    async fn remove_plugin(&self, name: &str) -> Result<()> {
        let mut registry = self.plugins.lock().await;
        if !registry.contains(name) {
            return Err(WardError::PluginNotExist(name.to_string()));
        }
        self.scheduler.remove_instances(name.to_string()).await?;
        registry.discard(name);
        Ok(())
    }

    async fn handle_sdk_conn(&self, stream: UnixStream, writer_tx: mpsc::Sender<WriterEvent>) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        debug!(conn = conn, "sdk connection accepted");

        let (mut reader, writer) = stream.into_split();
        if writer_tx
            .send(WriterEvent::Register { conn, writer })
            .await
            .is_err()
        {
            return;
        }

        loop {
            let request = match read_message(&mut reader).await {
                Ok((_, msg)) => msg,
                Err(e) => {
                    if e.is_fatal_to_connection() {
                        if !matches!(e, WardError::ConnectionClosed) {
                            warn!(conn = conn, error = %e, "sdk connection torn down");
                        }
                        break;
                    }
                    let frame =
                        encode_frame(MessageType::Response, &ProtocolMessage::err(&e));
                    if writer_tx
                        .send(WriterEvent::Frame(PushFrame { conn, frame }))
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };

            let response = match self.dispatch_sdk(conn, &request).await {
                Ok(resp) => resp,
                Err(e) => {
                    debug!(conn = conn, opt = ?request.opt, error = %e, "sdk request failed");
                    ProtocolMessage::err(&e)
                }
            };
            let frame = encode_frame(MessageType::Response, &response);
            if writer_tx
                .send(WriterEvent::Frame(PushFrame { conn, frame }))
                .await
                .is_err()
            {
                break;
            }
        }

        if let Err(e) = self.scheduler.unsubscribe_conn(conn).await {
            warn!(conn = conn, error = %e, "disconnect cleanup failed");
        }
        let _ = writer_tx.send(WriterEvent::Deregister { conn }).await;
        debug!(conn = conn, "sdk connection closed");
    }

    async fn dispatch_sdk(&self, conn: u64, request: &ProtocolMessage) -> Result<ProtocolMessage> {
        match request.opt {
            Opt::Subscribe => {
                let topic = topic_from_args(request)?;
                self.scheduler
                    .subscribe(Subscriber::Sdk(conn), topic.clone())
                    .await?;
                Ok(ProtocolMessage::ok_str(&topic.sub_key()))
            }
            Opt::Unsubscribe => {
                let topic = topic_from_args(request)?;
                self.scheduler
                    .unsubscribe(Subscriber::Sdk(conn), topic.clone())
                    .await?;
                Ok(ProtocolMessage::ok_str(&topic.sub_key()))
            }
            Opt::Publish => {
                let raw = request.arg_bytes(0)?;
                let mut dec = codec::Decoder::new(raw);
                let data = self.codecs.decode_data_list(&mut dec)?;
                let topic = data.topic.sub_key();
                self.scheduler.publish(data).await?;
                Ok(ProtocolMessage::ok_str(&topic))
            }
            _ => Err(WardError::Protocol(
                "management operation on sdk socket".to_string(),
            )),
        }
    }
}

fn topic_from_args(request: &ProtocolMessage) -> Result<Topic> {
    let instance = request.arg_str(0)?;
    let topic = request.arg_str(1).unwrap_or("");
    let params = request.arg_str(2).unwrap_or("");
    Ok(Topic::new(instance, topic, params))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| WardError::Codec(format!("json encode: {e}")))
}

/// Owns every SDK write half. Consumes registration events and pushed
/// frames; a failed write drops the writer and lets the reader side notice
/// the close.
async fn run_writer_pump(
    mut events: mpsc::Receiver<WriterEvent>,
    mut frames: mpsc::Receiver<PushFrame>,
) {
    use tokio::io::AsyncWriteExt;

    let mut writers: HashMap<u64, OwnedWriteHalf> = HashMap::new();
    let mut frames_open = true;

    loop {
        let frame = tokio::select! {
            ev = events.recv() => match ev {
                Some(WriterEvent::Register { conn, writer }) => {
                    writers.insert(conn, writer);
                    continue;
                }
                Some(WriterEvent::Deregister { conn }) => {
                    writers.remove(&conn);
                    continue;
                }
                Some(WriterEvent::Frame(frame)) => frame,
                None => break,
            },
            pushed = frames.recv(), if frames_open => match pushed {
                Some(frame) => frame,
                None => {
                    frames_open = false;
                    continue;
                }
            },
        };

        let Some(writer) = writers.get_mut(&frame.conn) else {
            trace!(conn = frame.conn, "dropping frame for gone connection");
            continue;
        };
        if let Err(e) = writer.write_all(&frame.frame).await {
            warn!(conn = frame.conn, error = %e, "sdk write failed, dropping writer");
            writers.remove(&frame.conn);
        }
    }
}

fn bind_socket(path: &Path, mode: u32) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(path)?;

    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }

    Ok(listener)
}

/// Hands the SDK socket to the configured group. Best effort: a missing
/// group leaves the socket owner-only and the daemon keeps running.
fn apply_sdk_group(path: &Path, group: &str) {
    use std::os::unix::ffi::OsStrExt;

    let Ok(group_c) = std::ffi::CString::new(group) else {
        warn!(group = %group, "invalid sdk group name");
        return;
    };
    let Ok(path_c) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        warn!(path = %path.display(), "invalid socket path");
        return;
    };

    let entry = unsafe { libc::getgrnam(group_c.as_ptr()) };
    if entry.is_null() {
        warn!(group = %group, "sdk group not found, socket stays owner-only");
        return;
    }
    let gid = unsafe { (*entry).gr_gid };

    let rc = unsafe { libc::chown(path_c.as_ptr(), !0 as libc::uid_t, gid) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        warn!(group = %group, error = %err, "failed to chown sdk socket");
    } else {
        info!(group = %group, gid = gid, "sdk socket group applied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataList;
    use crate::instance::{HostHandle, Instance, InstanceInfo, InstanceKind, RunStatus};
    use crate::payload::{default_registry, MetricBatch, MetricSample};
    use crate::scheduler::Scheduler;
    use std::time::Duration;

    struct EchoCollector;

    impl Instance for EchoCollector {
        fn info(&self) -> InstanceInfo {
            InstanceInfo {
                name: "cpu_stat".to_string(),
                version: "1.0.0".to_string(),
                description: "test collector".to_string(),
                kind: InstanceKind::Collector,
                period: 1,
                priority: 0,
                supported_topics: vec!["usage".to_string()],
            }
        }

        fn enable(
            &mut self,
            _param: &str,
            _host: &HostHandle,
        ) -> std::result::Result<(), String> {
            Ok(())
        }

        fn disable(&mut self, _host: &HostHandle) {}

        fn run(&mut self, host: &HostHandle) -> RunStatus {
            let mut data = DataList::new(Topic::new("cpu_stat", "usage", ""));
            data.push(MetricBatch {
                timestamp_ms: 42,
                samples: vec![MetricSample {
                    name: "user".to_string(),
                    value: 7,
                }],
            });
            host.publish(data);
            RunStatus::Ok
        }

        fn open_topic(&mut self, _topic: &Topic) -> std::result::Result<(), String> {
            Ok(())
        }

        fn close_topic(&mut self, _topic: &Topic) {}

        fn update_data(&mut self, _data: &DataList) {}
    }

    fn builtin_echo() -> Vec<Box<dyn Instance>> {
        vec![Box::new(EchoCollector)]
    }

    struct TestDaemon {
        command: PathBuf,
        sdk: PathBuf,
        _dir: tempfile::TempDir,
    }

    async fn start_daemon() -> TestDaemon {
        let dir = tempfile::tempdir().unwrap();
        let command = dir.path().join("ward.sock");
        let sdk = dir.path().join("ward-sdk.sock");

        let codecs = Arc::new(default_registry());
        let (push_tx, push_rx) = mpsc::channel(crate::scheduler::PUSH_QUEUE_DEPTH);
        let (handle, scheduler) =
            Scheduler::new(Arc::clone(&codecs), Duration::from_millis(5), push_tx);
        tokio::spawn(scheduler.run());

        let mut registry = PluginRegistry::new();
        registry.register_builtin("testplug", builtin_echo);
        let plugins = Arc::new(Mutex::new(registry));

        {
            let mut reg = plugins.lock().await;
            let (name, instances) = reg.load_builtin("testplug").unwrap();
            let accepted = handle.add_instances(name.clone(), instances).await.unwrap();
            reg.commit(&name, accepted);
        }

        let server = WardServer::new(
            ServerConfig {
                command_socket: command.clone(),
                sdk_socket: sdk.clone(),
                sdk_group: "no-such-group-xyzzy".to_string(),
            },
            handle,
            plugins,
            codecs,
            push_rx,
        );
        tokio::spawn(async move {
            server.run().await.unwrap();
        });

        // Wait for both sockets to appear.
        for _ in 0..100 {
            if command.exists() && sdk.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        TestDaemon {
            command,
            sdk,
            _dir: dir,
        }
    }

    async fn roundtrip(stream: &mut UnixStream, msg: &ProtocolMessage) -> ProtocolMessage {
        write_message(stream, MessageType::Request, msg)
            .await
            .unwrap();
        let (ty, resp) = read_message(stream).await.unwrap();
        assert_eq!(ty, MessageType::Response);
        resp
    }

    #[tokio::test]
    async fn list_and_query_over_command_socket() {
        let daemon = start_daemon().await;
        let mut stream = UnixStream::connect(&daemon.command).await.unwrap();

        let resp = roundtrip(&mut stream, &ProtocolMessage::new(Opt::List)).await;
        assert_eq!(resp.opt, Opt::ResponseOk);
        let plugins: Vec<crate::loader::PluginSnapshot> =
            serde_json::from_slice(resp.arg_bytes(0).unwrap()).unwrap();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "testplug");
        assert_eq!(plugins[0].instances, vec!["cpu_stat".to_string()]);

        let mut query = ProtocolMessage::new(Opt::Query);
        query.push_str("cpu_stat");
        let resp = roundtrip(&mut stream, &query).await;
        assert_eq!(resp.opt, Opt::ResponseOk);
        let snaps: Vec<crate::scheduler::InstanceSnapshot> =
            serde_json::from_slice(resp.arg_bytes(0).unwrap()).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].state, "disabled");

        let resp = roundtrip(&mut stream, &ProtocolMessage::new(Opt::Info)).await;
        assert_eq!(resp.opt, Opt::ResponseOk);
        let info: DaemonInfo = serde_json::from_slice(resp.arg_bytes(0).unwrap()).unwrap();
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(info.plugins, 1);
    }

    #[tokio::test]
    async fn enable_then_receive_pushed_data() {
        let daemon = start_daemon().await;

        let mut sdk = UnixStream::connect(&daemon.sdk).await.unwrap();
        let mut sub = ProtocolMessage::new(Opt::Subscribe);
        sub.push_str("cpu_stat").push_str("usage").push_str("");
        let resp = roundtrip(&mut sdk, &sub).await;
        assert_eq!(resp.opt, Opt::ResponseOk);

        let mut command = UnixStream::connect(&daemon.command).await.unwrap();
        let mut enable = ProtocolMessage::new(Opt::Enabled);
        enable.push_str("cpu_stat").push_str("");
        let resp = roundtrip(&mut command, &enable).await;
        assert_eq!(resp.opt, Opt::ResponseOk);

        // The collector runs on the next tick and its batch fans out.
        let (ty, pushed) = tokio::time::timeout(Duration::from_secs(2), read_message(&mut sdk))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ty, MessageType::Request);
        assert_eq!(pushed.opt, Opt::Data);

        let mut dec = codec::Decoder::new(pushed.arg_bytes(0).unwrap());
        let data = default_registry().decode_data_list(&mut dec).unwrap();
        assert_eq!(data.topic.sub_key(), "cpu_stat::usage::");
        assert_eq!(data.entries.len(), 1);
    }

    #[tokio::test]
    async fn sockets_reject_wrong_plane() {
        let daemon = start_daemon().await;

        let mut command = UnixStream::connect(&daemon.command).await.unwrap();
        let mut sub = ProtocolMessage::new(Opt::Subscribe);
        sub.push_str("cpu_stat").push_str("usage").push_str("");
        let resp = roundtrip(&mut command, &sub).await;
        assert_eq!(resp.opt, Opt::ResponseError);

        let mut sdk = UnixStream::connect(&daemon.sdk).await.unwrap();
        let mut load = ProtocolMessage::new(Opt::Load);
        load.push_str("/tmp/nope.so");
        let resp = roundtrip(&mut sdk, &load).await;
        assert_eq!(resp.opt, Opt::ResponseError);
    }

    #[tokio::test]
    async fn disconnect_cleans_subscriptions() {
        let daemon = start_daemon().await;

        {
            let mut sdk = UnixStream::connect(&daemon.sdk).await.unwrap();
            let mut sub = ProtocolMessage::new(Opt::Subscribe);
            sub.push_str("cpu_stat").push_str("usage").push_str("");
            let resp = roundtrip(&mut sdk, &sub).await;
            assert_eq!(resp.opt, Opt::ResponseOk);
        }

        // The dropped connection's subscription must disappear from the
        // graph once the server notices the close.
        let mut command = UnixStream::connect(&daemon.command).await.unwrap();
        let mut edges = Vec::new();
        for _ in 0..100 {
            let resp =
                roundtrip(&mut command, &ProtocolMessage::new(Opt::QueryAllSubGraph)).await;
            assert_eq!(resp.opt, Opt::ResponseOk);
            edges = serde_json::from_slice::<Vec<crate::router::SubEdge>>(
                resp.arg_bytes(0).unwrap(),
            )
            .unwrap();
            if edges.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(edges.is_empty());
    }

    #[tokio::test]
    async fn unknown_plugin_operations_error() {
        let daemon = start_daemon().await;
        let mut command = UnixStream::connect(&daemon.command).await.unwrap();

        let mut remove = ProtocolMessage::new(Opt::Remove);
        remove.push_str("ghost");
        let resp = roundtrip(&mut command, &remove).await;
        assert_eq!(resp.opt, Opt::ResponseError);
        assert!(resp.arg_str(0).unwrap().contains("ghost"));

        let mut download = ProtocolMessage::new(Opt::Download);
        download.push_str("testplug");
        let resp = roundtrip(&mut command, &download).await;
        // Built-in plugin has no backing file.
        assert_eq!(resp.opt, Opt::ResponseError);
    }

    #[tokio::test]
    async fn shutdown_removes_sockets() {
        let daemon = start_daemon().await;
        let mut command = UnixStream::connect(&daemon.command).await.unwrap();

        let resp = roundtrip(&mut command, &ProtocolMessage::new(Opt::Shutdown)).await;
        assert_eq!(resp.opt, Opt::ResponseOk);

        for _ in 0..100 {
            if !daemon.command.exists() && !daemon.sdk.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!daemon.command.exists());
        assert!(!daemon.sdk.exists());
    }
}
