//! Nodeward: a node-resident daemon hosting capability plugins.
//!
//! Plugins export Collector, Scenario and Tune instances. The scheduler
//! runs enabled instances on a periodic tick and routes published batches
//! to topic subscribers, both in-process instances and external SDK
//! clients over a Unix socket.

pub mod client;
pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod instance;
pub mod loader;
pub mod message;
pub mod payload;
pub mod router;
pub mod scheduler;
pub mod sdk;
pub mod server;

pub use client::WardClient;
pub use config::DaemonConfig;
pub use data::{DataCodecRegistry, DataList, Topic, TopicData};
pub use error::{Result, WardError};
pub use instance::{HostHandle, Instance, InstanceInfo, InstanceKind, PluginBundle, RunStatus};
pub use loader::PluginRegistry;
pub use message::{MessageType, Opt, ProtocolMessage};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use sdk::SdkClient;
pub use server::{DaemonInfo, ServerConfig, WardServer};
