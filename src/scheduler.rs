//! Instance scheduler: the background loop that owns every instance and
//! all subscription state.
//!
//! One task mutates instance and subscription state; everyone else talks
//! to it through [`SchedulerHandle`], which pairs each command with a
//! oneshot reply channel. Awaiting the reply is what makes control
//! operations appear synchronous and linearizable to callers without any
//! shared lock.

use crate::data::{DataCodecRegistry, DataList, Topic};
use crate::error::{Result, WardError};
use crate::instance::{HostAction, HostHandle, Instance, InstanceInfo, RunStatus};
use crate::message::{self, MessageType, Opt, ProtocolMessage};
use crate::router::{Router, SubEdge, Subscriber};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Default tick cadence of the scheduler loop.
pub const DEFAULT_TICK: Duration = Duration::from_millis(10);

/// Capacity of the control channel and of the outbound push queue. A full
/// push queue drops the frame for that subscriber (at-most-once delivery).
pub const CONTROL_QUEUE_DEPTH: usize = 256;
pub const PUSH_QUEUE_DEPTH: usize = 1024;

/// One serialized DATA frame bound for one SDK connection.
#[derive(Debug, Clone)]
pub struct PushFrame {
    pub conn: u64,
    pub frame: Vec<u8>,
}

/// Lifecycle state of a scheduled instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Disabled => "disabled",
            InstanceState::Enabling => "enabling",
            InstanceState::Enabled => "enabled",
            InstanceState::Disabling => "disabling",
        }
    }
}

/// Serializable view of an instance for QUERY responses.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub plugin: String,
    pub kind: String,
    pub state: String,
    pub period: u64,
    pub priority: i32,
    pub supported_topics: Vec<String>,
}

/// Control message applied on the scheduler task. Every variant carries a
/// reply channel; the sender blocks on it until the change is applied.
pub enum SchedulerCommand {
    AddInstances {
        plugin: String,
        instances: Vec<Box<dyn Instance>>,
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    RemoveInstances {
        plugin: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Enable {
        name: String,
        param: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disable {
        name: String,
        force: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        sub: Subscriber,
        topic: Topic,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        sub: Subscriber,
        topic: Topic,
        reply: oneshot::Sender<Result<()>>,
    },
    UnsubscribeConn {
        conn: u64,
        reply: oneshot::Sender<usize>,
    },
    Publish {
        data: DataList,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        name: Option<String>,
        reply: oneshot::Sender<Result<Vec<InstanceSnapshot>>>,
    },
    SubGraph {
        producer: Option<String>,
        reply: oneshot::Sender<Result<Vec<SubEdge>>>,
    },
    Shutdown,
}

/// Cloneable sender side of the scheduler's control channel.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| WardError::ChannelClosed)?;
        reply_rx.await.map_err(|_| WardError::ChannelClosed)
    }

    pub async fn add_instances(
        &self,
        plugin: String,
        instances: Vec<Box<dyn Instance>>,
    ) -> Result<Vec<String>> {
        self.call(|reply| SchedulerCommand::AddInstances {
            plugin,
            instances,
            reply,
        })
        .await?
    }

    pub async fn remove_instances(&self, plugin: String) -> Result<()> {
        self.call(|reply| SchedulerCommand::RemoveInstances { plugin, reply })
            .await?
    }

    pub async fn enable(&self, name: String, param: String) -> Result<()> {
        self.call(|reply| SchedulerCommand::Enable { name, param, reply })
            .await?
    }

    pub async fn disable(&self, name: String, force: bool) -> Result<()> {
        self.call(|reply| SchedulerCommand::Disable { name, force, reply })
            .await?
    }

    pub async fn subscribe(&self, sub: Subscriber, topic: Topic) -> Result<()> {
        self.call(|reply| SchedulerCommand::Subscribe { sub, topic, reply })
            .await?
    }

    pub async fn unsubscribe(&self, sub: Subscriber, topic: Topic) -> Result<()> {
        self.call(|reply| SchedulerCommand::Unsubscribe { sub, topic, reply })
            .await?
    }

    pub async fn unsubscribe_conn(&self, conn: u64) -> Result<usize> {
        self.call(|reply| SchedulerCommand::UnsubscribeConn { conn, reply })
            .await
    }

    pub async fn publish(&self, data: DataList) -> Result<()> {
        self.call(|reply| SchedulerCommand::Publish { data, reply })
            .await?
    }

    pub async fn snapshot(&self, name: Option<String>) -> Result<Vec<InstanceSnapshot>> {
        self.call(|reply| SchedulerCommand::Snapshot { name, reply })
            .await?
    }

    pub async fn sub_graph(&self, producer: Option<String>) -> Result<Vec<SubEdge>> {
        self.call(|reply| SchedulerCommand::SubGraph { producer, reply })
            .await?
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SchedulerCommand::Shutdown).await;
    }
}

struct Slot {
    instance: Box<dyn Instance>,
    info: InstanceInfo,
    plugin: String,
    state: InstanceState,
    /// Cleared when the instance signals a fatal condition; re-enabling
    /// then fails with `Unavailable` until the plugin is reloaded.
    available: bool,
    /// Enabled as a dependency of a subscriber, not by an operator;
    /// eligible for auto-disable when its in-degree returns to zero.
    dep_enabled: bool,
    /// Insertion order, the scheduling tie-breaker after priority.
    seq: u64,
    /// Tick of the first scheduled run.
    enable_tick: u64,
}

/// The scheduler task state. Constructed with [`Scheduler::new`], driven by
/// [`Scheduler::run`].
pub struct Scheduler {
    rx: mpsc::Receiver<SchedulerCommand>,
    push_tx: mpsc::Sender<PushFrame>,
    codecs: Arc<DataCodecRegistry>,
    tick: Duration,
    slots: HashMap<String, Slot>,
    router: Router,
    /// DataLists awaiting same-process delivery on the next tick.
    pending: Vec<DataList>,
    tick_counter: u64,
    next_seq: u64,
}

impl Scheduler {
    pub fn new(
        codecs: Arc<DataCodecRegistry>,
        tick: Duration,
        push_tx: mpsc::Sender<PushFrame>,
    ) -> (SchedulerHandle, Self) {
        let (tx, rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);
        (
            SchedulerHandle { tx },
            Self {
                rx,
                push_tx,
                codecs,
                tick,
                slots: HashMap::new(),
                router: Router::new(),
                pending: Vec::new(),
                tick_counter: 0,
                next_seq: 0,
            },
        )
    }

    /// The scheduler loop: drain control commands, run due instances each
    /// tick, exit on shutdown. All instance-set mutation happens here.
    pub async fn run(mut self) {
        info!(tick_ms = self.tick.as_millis() as u64, "scheduler started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    None | Some(SchedulerCommand::Shutdown) => break,
                    Some(cmd) => self.apply(cmd),
                },
                _ = ticker.tick() => self.tick_once(),
            }
        }

        // Orderly stop: disable whatever is still running.
        let names: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.state == InstanceState::Enabled)
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            if let Err(e) = self.cmd_disable(&name, true) {
                warn!(instance = %name, error = %e, "disable during shutdown failed");
            }
        }
        info!("scheduler stopped");
    }

    fn apply(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::AddInstances {
                plugin,
                instances,
                reply,
            } => {
                let _ = reply.send(self.cmd_add_instances(&plugin, instances));
            }
            SchedulerCommand::RemoveInstances { plugin, reply } => {
                let _ = reply.send(self.cmd_remove_instances(&plugin));
            }
            SchedulerCommand::Enable { name, param, reply } => {
                let _ = reply.send(self.cmd_enable(&name, &param, false));
            }
            SchedulerCommand::Disable { name, force, reply } => {
                let _ = reply.send(self.cmd_disable(&name, force));
            }
            SchedulerCommand::Subscribe { sub, topic, reply } => {
                let _ = reply.send(self.cmd_subscribe(&sub, &topic));
            }
            SchedulerCommand::Unsubscribe { sub, topic, reply } => {
                let _ = reply.send(self.cmd_unsubscribe(&sub, &topic));
            }
            SchedulerCommand::UnsubscribeConn { conn, reply } => {
                let _ = reply.send(self.cmd_unsubscribe_conn(conn));
            }
            SchedulerCommand::Publish { data, reply } => {
                let _ = reply.send(self.cmd_publish(data));
            }
            SchedulerCommand::Snapshot { name, reply } => {
                let _ = reply.send(self.cmd_snapshot(name.as_deref()));
            }
            SchedulerCommand::SubGraph { producer, reply } => {
                let _ = reply.send(Ok(self.router.edges(producer.as_deref())));
            }
            SchedulerCommand::Shutdown => unreachable!("handled in run loop"),
        }
    }

    fn cmd_add_instances(
        &mut self,
        plugin: &str,
        instances: Vec<Box<dyn Instance>>,
    ) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(instances.len());
        for instance in &instances {
            let name = instance.info().name;
            if self.slots.contains_key(&name) || names.contains(&name) {
                // Name collision rolls the whole load back; the instances
                // are dropped here, before the caller releases the library.
                return Err(WardError::AlreadyLoaded(name));
            }
            names.push(name);
        }
        for instance in instances {
            let info = instance.info();
            let seq = self.next_seq;
            self.next_seq += 1;
            debug!(instance = %info.name, plugin = %plugin, kind = %info.kind, "instance registered");
            self.slots.insert(
                info.name.clone(),
                Slot {
                    instance,
                    info,
                    plugin: plugin.to_string(),
                    state: InstanceState::Disabled,
                    available: true,
                    dep_enabled: false,
                    seq,
                    enable_tick: 0,
                },
            );
        }
        Ok(names)
    }

    fn cmd_remove_instances(&mut self, plugin: &str) -> Result<()> {
        let names: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, s)| s.plugin == plugin)
            .map(|(n, _)| n.clone())
            .collect();
        if names.is_empty() {
            return Err(WardError::PluginNotExist(plugin.to_string()));
        }
        if names
            .iter()
            .any(|n| self.slots[n].state != InstanceState::Disabled)
        {
            return Err(WardError::InstanceRunning(plugin.to_string()));
        }
        if self.router.has_external_instance_subscriber(&names) {
            return Err(WardError::HasDependents(plugin.to_string()));
        }

        for name in &names {
            self.router.unsubscribe_instance(name);
        }
        self.router.purge_producers(&names);
        for name in &names {
            self.slots.remove(name);
            info!(instance = %name, plugin = %plugin, "instance removed");
        }
        Ok(())
    }

    fn cmd_enable(&mut self, name: &str, param: &str, as_dependency: bool) -> Result<()> {
        let slot = self
            .slots
            .get_mut(name)
            .ok_or_else(|| WardError::NotLoaded(name.to_string()))?;
        if !slot.available {
            return Err(WardError::Unavailable(name.to_string()));
        }
        match slot.state {
            InstanceState::Enabled | InstanceState::Enabling => {
                return Err(WardError::AlreadyEnabled(name.to_string()));
            }
            InstanceState::Disabling => {
                return Err(WardError::Unavailable(name.to_string()));
            }
            InstanceState::Disabled => {}
        }

        slot.state = InstanceState::Enabling;
        let host = HostHandle::new(name);
        if let Err(text) = slot.instance.enable(param, &host) {
            slot.state = InstanceState::Disabled;
            return Err(if text.is_empty() {
                WardError::EnvironmentError(format!("enable failed for {name}"))
            } else {
                WardError::EnvironmentError(text)
            });
        }
        slot.state = InstanceState::Enabled;
        slot.dep_enabled = as_dependency;
        slot.enable_tick = self.tick_counter + 1;
        info!(instance = %name, dependency = as_dependency, "instance enabled");

        self.apply_host_actions(name, host.drain());
        Ok(())
    }

    fn cmd_disable(&mut self, name: &str, force: bool) -> Result<()> {
        let state = self
            .slots
            .get(name)
            .ok_or_else(|| WardError::NotLoaded(name.to_string()))?
            .state;
        if state != InstanceState::Enabled {
            return Err(WardError::AlreadyDisabled(name.to_string()));
        }

        // Producers this instance was consuming from; checked for
        // auto-disable once the unsubscribes below have landed.
        let upstreams: Vec<String> = self
            .router
            .subscriptions_of(name)
            .into_iter()
            .map(|t| t.instance_name)
            .collect();

        let slot = self.slots.get_mut(name).expect("slot exists");
        slot.state = InstanceState::Disabling;
        let host = HostHandle::new(name);
        slot.instance.disable(&host);
        self.apply_host_actions(name, host.drain());

        if force {
            // Cascade: drop anything the instance's own disable left behind.
            let closed = self.router.unsubscribe_instance(name);
            for topic in closed {
                self.close_producer_topic(&topic);
            }
        }

        let slot = self.slots.get_mut(name).expect("slot exists");
        slot.state = InstanceState::Disabled;
        slot.dep_enabled = false;
        info!(instance = %name, force, "instance disabled");

        for upstream in upstreams {
            self.maybe_auto_disable(&upstream);
        }
        Ok(())
    }

    fn cmd_subscribe(&mut self, sub: &Subscriber, topic: &Topic) -> Result<()> {
        let producer = self
            .slots
            .get(&topic.instance_name)
            .ok_or_else(|| WardError::NotLoaded(topic.instance_name.clone()))?;
        let supported = topic.topic_name.is_empty()
            || producer
                .info
                .supported_topics
                .iter()
                .any(|t| t == &topic.topic_name);
        if !supported {
            return Err(WardError::TopicNotSupported {
                instance: topic.instance_name.clone(),
                topic: topic.topic_name.clone(),
            });
        }

        let first = self.router.subscribe(sub, topic)?;
        trace!(subscriber = %sub.label(), topic = %topic, first, "subscribed");
        if first {
            let producer = self.slots.get_mut(&topic.instance_name).expect("checked");
            if let Err(text) = producer.instance.open_topic(topic) {
                warn!(instance = %topic.instance_name, topic = %topic, error = %text, "open_topic failed");
            }
        }

        // Dependency-driven activation: an instance subscribing to a
        // disabled producer pulls it up. SDK subscribers do not.
        if matches!(sub, Subscriber::Instance(_)) {
            let state = self.slots[&topic.instance_name].state;
            if state == InstanceState::Disabled {
                if let Err(e) = self.cmd_enable(&topic.instance_name, "", true) {
                    warn!(instance = %topic.instance_name, error = %e, "dependency auto-enable failed");
                }
            }
        }
        Ok(())
    }

    fn cmd_unsubscribe(&mut self, sub: &Subscriber, topic: &Topic) -> Result<()> {
        let last = self.router.unsubscribe(sub, topic)?;
        trace!(subscriber = %sub.label(), topic = %topic, last, "unsubscribed");
        if last {
            self.close_producer_topic(topic);
        }
        self.maybe_auto_disable(&topic.instance_name);
        Ok(())
    }

    fn cmd_unsubscribe_conn(&mut self, conn: u64) -> usize {
        let closed = self.router.unsubscribe_conn(conn);
        let count = closed.len();
        let producers: Vec<String> = closed.iter().map(|t| t.instance_name.clone()).collect();
        for topic in closed {
            self.close_producer_topic(&topic);
        }
        for producer in producers {
            self.maybe_auto_disable(&producer);
        }
        if count > 0 {
            debug!(conn, closed = count, "connection subscriptions dropped");
        }
        count
    }

    fn cmd_publish(&mut self, data: DataList) -> Result<()> {
        let key = data.topic.sub_key();

        let conns = self.router.sdk_subscribers(&key);
        if !conns.is_empty() {
            match self.encode_data_frame(&data) {
                Ok(frame) => {
                    for conn in conns {
                        let push = PushFrame {
                            conn,
                            frame: frame.clone(),
                        };
                        // try_send keeps the publisher decoupled from slow
                        // SDK clients; a full queue costs this frame only.
                        if let Err(e) = self.push_tx.try_send(push) {
                            warn!(conn, topic = %key, error = %e, "push queue rejected DATA frame");
                        }
                    }
                }
                Err(e) => {
                    warn!(topic = %key, error = %e, "undecodable payload type, DataList dropped for SDK delivery");
                }
            }
        }

        if !self.router.instance_subscribers(&key).is_empty() {
            self.pending.push(data);
        }
        Ok(())
    }

    fn encode_data_frame(&self, data: &DataList) -> Result<Vec<u8>> {
        let mut enc = crate::codec::Encoder::new();
        self.codecs.encode_data_list(data, &mut enc)?;
        let mut msg = ProtocolMessage::new(Opt::Data);
        msg.push_bytes(enc.into_bytes());
        Ok(message::encode_frame(MessageType::Request, &msg))
    }

    fn cmd_snapshot(&self, name: Option<&str>) -> Result<Vec<InstanceSnapshot>> {
        let snap = |slot: &Slot| InstanceSnapshot {
            name: slot.info.name.clone(),
            plugin: slot.plugin.clone(),
            kind: slot.info.kind.as_str().to_string(),
            state: slot.state.as_str().to_string(),
            period: slot.info.period,
            priority: slot.info.priority,
            supported_topics: slot.info.supported_topics.clone(),
        };
        match name {
            Some(name) => {
                let slot = self
                    .slots
                    .get(name)
                    .ok_or_else(|| WardError::NotLoaded(name.to_string()))?;
                Ok(vec![snap(slot)])
            }
            None => {
                let mut out: Vec<InstanceSnapshot> = self.slots.values().map(snap).collect();
                out.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(out)
            }
        }
    }

    /// One scheduler tick: deliver buffered publishes, then run due
    /// instances in priority order (Tune instances last).
    fn tick_once(&mut self) {
        self.tick_counter += 1;

        let pending = std::mem::take(&mut self.pending);
        for data in pending {
            let key = data.topic.sub_key();
            for name in self.router.instance_subscribers(&key) {
                if let Some(slot) = self.slots.get_mut(&name) {
                    slot.instance.update_data(&data);
                }
            }
        }

        let mut due: Vec<(bool, i32, u64, String)> = self
            .slots
            .iter()
            .filter(|(_, s)| {
                s.state == InstanceState::Enabled
                    && self.tick_counter >= s.enable_tick
                    && (self.tick_counter - s.enable_tick) % s.info.period.max(1) == 0
            })
            .map(|(name, s)| {
                let is_tune = s.info.kind == crate::instance::InstanceKind::Tune;
                (is_tune, s.info.priority, s.seq, name.clone())
            })
            .collect();
        due.sort();

        for (_, _, _, name) in due {
            self.run_instance(&name);
        }
    }

    fn run_instance(&mut self, name: &str) {
        let Some(slot) = self.slots.get_mut(name) else {
            return;
        };
        if slot.state != InstanceState::Enabled {
            return;
        }

        let host = HostHandle::new(name);
        let status = slot.instance.run(&host);
        let actions = host.drain();
        self.apply_host_actions(name, actions);

        match status {
            RunStatus::Ok => {}
            RunStatus::Error(msg) => {
                // Left scheduled for its next period.
                warn!(instance = %name, error = %msg, "instance run failed");
            }
            RunStatus::Fatal(msg) => {
                error!(instance = %name, error = %msg, "instance signalled fatal condition, force-disabling");
                if let Err(e) = self.cmd_disable(name, true) {
                    warn!(instance = %name, error = %e, "force-disable after fatal failed");
                }
                if let Some(slot) = self.slots.get_mut(name) {
                    slot.available = false;
                }
            }
        }
    }

    /// Apply the subscribe/unsubscribe/publish calls an instance issued
    /// through its host handle. Errors are logged, not propagated: the
    /// instance call has already returned.
    fn apply_host_actions(&mut self, caller: &str, actions: Vec<HostAction>) {
        for action in actions {
            match action {
                HostAction::Subscribe(topic) => {
                    let sub = Subscriber::Instance(caller.to_string());
                    if let Err(e) = self.cmd_subscribe(&sub, &topic) {
                        warn!(instance = %caller, topic = %topic, error = %e, "subscribe rejected");
                    }
                }
                HostAction::Unsubscribe(topic) => {
                    let sub = Subscriber::Instance(caller.to_string());
                    if let Err(e) = self.cmd_unsubscribe(&sub, &topic) {
                        warn!(instance = %caller, topic = %topic, error = %e, "unsubscribe rejected");
                    }
                }
                HostAction::Publish(data) => {
                    if let Err(e) = self.cmd_publish(data) {
                        warn!(instance = %caller, error = %e, "publish failed");
                    }
                }
            }
        }
    }

    fn close_producer_topic(&mut self, topic: &Topic) {
        if let Some(slot) = self.slots.get_mut(&topic.instance_name) {
            slot.instance.close_topic(topic);
        }
    }

    /// Dependency-enabled producers with no remaining subscriber go back
    /// to sleep. Operator-enabled instances are never auto-disabled.
    fn maybe_auto_disable(&mut self, producer: &str) {
        let Some(slot) = self.slots.get(producer) else {
            return;
        };
        if slot.state == InstanceState::Enabled
            && slot.dep_enabled
            && self.router.producer_in_degree(producer) == 0
        {
            debug!(instance = %producer, "no subscribers left, auto-disabling dependency");
            if let Err(e) = self.cmd_disable(producer, false) {
                warn!(instance = %producer, error = %e, "auto-disable failed");
            }
        }
    }
}
