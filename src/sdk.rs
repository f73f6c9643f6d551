//! SDK client for the data plane.
//!
//! Holds one long-lived connection to the SDK socket. A background reader
//! splits the inbound stream into pushed DATA frames, dispatched to the
//! callback registered per subscription key, and responses, handed back to
//! the request in flight. Requests are serialized, so one pending response
//! slot is enough.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{Decoder, Encoder};
use crate::config;
use crate::data::{DataCodecRegistry, DataList, Topic};
use crate::error::{Result, WardError};
use crate::message::{read_message, write_message, MessageType, Opt, ProtocolMessage};

pub type DataCallback = Arc<dyn Fn(DataList) + Send + Sync>;

type CallbackMap = Arc<StdMutex<HashMap<String, DataCallback>>>;

pub struct SdkClient {
    writer: Mutex<OwnedWriteHalf>,
    responses: Mutex<mpsc::Receiver<ProtocolMessage>>,
    callbacks: CallbackMap,
    codecs: Arc<DataCodecRegistry>,
    reader: JoinHandle<()>,
}

impl SdkClient {
    /// Connect to the default SDK socket.
    pub async fn connect(codecs: Arc<DataCodecRegistry>) -> Result<Self> {
        Self::connect_to(config::sdk_socket_path(), codecs).await
    }

    pub async fn connect_to(
        path: impl AsRef<std::path::Path>,
        codecs: Arc<DataCodecRegistry>,
    ) -> Result<Self> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (read_half, write_half) = stream.into_split();

        let callbacks: CallbackMap = Arc::new(StdMutex::new(HashMap::new()));
        let (resp_tx, resp_rx) = mpsc::channel(8);
        let reader = tokio::spawn(run_reader(
            read_half,
            resp_tx,
            Arc::clone(&callbacks),
            Arc::clone(&codecs),
        ));

        debug!(path = %path.as_ref().display(), "sdk client connected");
        Ok(Self {
            writer: Mutex::new(write_half),
            responses: Mutex::new(resp_rx),
            callbacks,
            codecs,
            reader,
        })
    }

    async fn request(&self, msg: &ProtocolMessage) -> Result<ProtocolMessage> {
        // Both locks are held across the exchange so concurrent callers
        // cannot pair with each other's responses.
        let mut responses = self.responses.lock().await;
        {
            let mut writer = self.writer.lock().await;
            write_message(&mut *writer, MessageType::Request, msg).await?;
        }
        let response = responses.recv().await.ok_or(WardError::ConnectionClosed)?;
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

    /// Subscribe to a topic. `callback` runs on the reader task for every
    /// pushed batch, so it must not block.
    pub async fn subscribe<F>(&self, topic: &Topic, callback: F) -> Result<()>
    where
        F: Fn(DataList) + Send + Sync + 'static,
    {
        let key = topic.sub_key();
        self.callbacks
            .lock()
            .expect("callback map poisoned")
            .insert(key.clone(), Arc::new(callback));

        let mut msg = ProtocolMessage::new(Opt::Subscribe);
        msg.push_str(&topic.instance_name)
            .push_str(&topic.topic_name)
            .push_str(&topic.params);
        if let Err(e) = self.request(&msg).await {
            self.callbacks
                .lock()
                .expect("callback map poisoned")
                .remove(&key);
            return Err(e);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        let mut msg = ProtocolMessage::new(Opt::Unsubscribe);
        msg.push_str(&topic.instance_name)
            .push_str(&topic.topic_name)
            .push_str(&topic.params);
        self.request(&msg).await?;
        self.callbacks
            .lock()
            .expect("callback map poisoned")
            .remove(&topic.sub_key());
        Ok(())
    }

    /// Publish a batch on behalf of this process.
    pub async fn publish(&self, data: &DataList) -> Result<()> {
        let mut enc = Encoder::new();
        self.codecs.encode_data_list(data, &mut enc)?;
        let mut msg = ProtocolMessage::new(Opt::Publish);
        msg.push_bytes(enc.into_bytes());
        self.request(&msg).await?;
        Ok(())
    }
}

impl Drop for SdkClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn run_reader(
    mut reader: OwnedReadHalf,
    resp_tx: mpsc::Sender<ProtocolMessage>,
    callbacks: CallbackMap,
    codecs: Arc<DataCodecRegistry>,
) {
    loop {
        match read_message(&mut reader).await {
            Ok((_, msg)) if msg.opt == Opt::Data => {
                let raw = match msg.arg_bytes(0) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(error = %e, "malformed data push");
                        continue;
                    }
                };
                let mut dec = Decoder::new(raw);
                let data = match codecs.decode_data_list(&mut dec) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!(error = %e, "undecodable data push");
                        continue;
                    }
                };
                let callback = callbacks
                    .lock()
                    .expect("callback map poisoned")
                    .get(&data.topic.sub_key())
                    .cloned();
                match callback {
                    Some(cb) => cb(data),
                    None => trace!(topic = %data.topic, "push without registered callback"),
                }
            }
            Ok((MessageType::Response, msg)) => {
                if resp_tx.send(msg).await.is_err() {
                    break;
                }
            }
            Ok((ty, msg)) => {
                warn!(msg_type = ?ty, opt = ?msg.opt, "unexpected frame from daemon");
            }
            Err(e) => {
                if !matches!(e, WardError::ConnectionClosed) {
                    warn!(error = %e, "sdk stream error");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encode_frame;
    use crate::payload::{default_registry, MetricBatch, MetricSample};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    /// Minimal daemon stand-in: acknowledges every request and pushes one
    /// batch after the first subscribe.
    async fn fake_daemon(listener: UnixListener, codecs: Arc<DataCodecRegistry>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        loop {
            let (_, msg) = match read_message(&mut stream).await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            match msg.opt {
                Opt::Subscribe => {
                    let resp = ProtocolMessage::ok_str("subscribed");
                    write_message(&mut stream, MessageType::Response, &resp)
                        .await
                        .unwrap();

                    let mut data = DataList::new(Topic::new("cpu_stat", "usage", ""));
                    data.push(MetricBatch {
                        timestamp_ms: 99,
                        samples: vec![MetricSample {
                            name: "idle".to_string(),
                            value: 83,
                        }],
                    });
                    let mut enc = Encoder::new();
                    codecs.encode_data_list(&data, &mut enc).unwrap();
                    let mut push = ProtocolMessage::new(Opt::Data);
                    push.push_bytes(enc.into_bytes());
                    let frame = encode_frame(MessageType::Request, &push);
                    stream.write_all(&frame).await.unwrap();
                }
                Opt::Unsubscribe | Opt::Publish => {
                    let resp = ProtocolMessage::ok_str("ok");
                    write_message(&mut stream, MessageType::Response, &resp)
                        .await
                        .unwrap();
                }
                _ => {
                    let err = WardError::Protocol("unexpected opt".to_string());
                    let resp = ProtocolMessage::err(&err);
                    write_message(&mut stream, MessageType::Response, &resp)
                        .await
                        .unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn subscribe_routes_pushed_batches_to_callback() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ward-sdk.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let codecs = Arc::new(default_registry());
        tokio::spawn(fake_daemon(listener, Arc::clone(&codecs)));

        let client = SdkClient::connect_to(&socket, codecs).await.unwrap();
        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();

        let topic = Topic::new("cpu_stat", "usage", "");
        client
            .subscribe(&topic, move |data| {
                let _ = batch_tx.send(data);
            })
            .await
            .unwrap();

        let data = tokio::time::timeout(std::time::Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.topic.sub_key(), "cpu_stat::usage::");
        assert_eq!(data.entries.len(), 1);
        let batch = data.entries[0]
            .as_any()
            .downcast_ref::<MetricBatch>()
            .unwrap();
        assert_eq!(batch.timestamp_ms, 99);
        assert_eq!(batch.samples[0].name, "idle");
    }

    #[tokio::test]
    async fn publish_and_unsubscribe_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("ward-sdk.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let codecs = Arc::new(default_registry());
        tokio::spawn(fake_daemon(listener, Arc::clone(&codecs)));

        let client = SdkClient::connect_to(&socket, Arc::clone(&codecs))
            .await
            .unwrap();

        let mut data = DataList::new(Topic::new("cpu_stat", "usage", ""));
        data.push(MetricBatch {
            timestamp_ms: 1,
            samples: Vec::new(),
        });
        client.publish(&data).await.unwrap();

        let topic = Topic::new("cpu_stat", "usage", "");
        client.unsubscribe(&topic).await.unwrap();
    }
}
