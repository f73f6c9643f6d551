//! The capability interface every plugin-provided instance implements, and
//! the narrow callback surface instances use to talk back to the host.

use crate::data::{DataList, Topic};
use std::cell::RefCell;
use std::fmt;

/// What kind of work an instance does; Tune instances run last in a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceKind {
    Collector,
    Scenario,
    Tune,
}

impl InstanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Collector => "collector",
            InstanceKind::Scenario => "scenario",
            InstanceKind::Tune => "tune",
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static metadata an instance declares about itself.
///
/// `period` is the minimum re-run interval in scheduler ticks; `priority`
/// orders runs within a tick, lower value first.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub kind: InstanceKind,
    pub period: u64,
    pub priority: i32,
    pub supported_topics: Vec<String>,
}

/// Outcome of one run step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    /// Logged; the instance stays scheduled for its next period.
    Error(String),
    /// The instance is force-disabled.
    Fatal(String),
}

/// What every plugin-provided instance must implement.
///
/// All methods are called from the scheduler task only, so implementations
/// never need their own locking for scheduler-driven state.
pub trait Instance: Send {
    fn info(&self) -> InstanceInfo;

    /// Activate the instance. A non-empty error string is surfaced to the
    /// caller verbatim; an empty one becomes a generic environment error.
    fn enable(&mut self, param: &str, host: &HostHandle) -> std::result::Result<(), String>;

    fn disable(&mut self, host: &HostHandle);

    /// One scheduled step: collectors refresh, scenarios analyze, tunes
    /// apply. Data and subscription changes go through `host`.
    fn run(&mut self, host: &HostHandle) -> RunStatus;

    /// First subscriber appeared for `topic`.
    fn open_topic(&mut self, topic: &Topic) -> std::result::Result<(), String>;

    /// Last subscriber left `topic`.
    fn close_topic(&mut self, topic: &Topic);

    /// Latest DataList for a topic this instance subscribes to.
    fn update_data(&mut self, data: &DataList);
}

impl fmt::Debug for dyn Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.info().name)
            .finish()
    }
}

/// Host action requested by an instance during `enable`/`disable`/`run`.
#[derive(Debug)]
pub enum HostAction {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Publish(DataList),
}

/// Callback surface handed to instances.
///
/// Actions are buffered and applied by the scheduler after the instance
/// call returns; this keeps the scheduler the sole mutator of subscription
/// state even while an instance is mid-call.
pub struct HostHandle {
    caller: String,
    actions: RefCell<Vec<HostAction>>,
}

impl HostHandle {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            actions: RefCell::new(Vec::new()),
        }
    }

    pub fn caller(&self) -> &str {
        &self.caller
    }

    pub fn subscribe(&self, topic: Topic) {
        self.actions.borrow_mut().push(HostAction::Subscribe(topic));
    }

    pub fn unsubscribe(&self, topic: Topic) {
        self.actions
            .borrow_mut()
            .push(HostAction::Unsubscribe(topic));
    }

    pub fn publish(&self, data: DataList) {
        self.actions.borrow_mut().push(HostAction::Publish(data));
    }

    pub(crate) fn drain(&self) -> Vec<HostAction> {
        self.actions.borrow_mut().drain(..).collect()
    }
}

/// What a plugin's entry export hands back to the host: zero or more
/// instances produced by one shared object.
pub struct PluginBundle {
    pub instances: Vec<Box<dyn Instance>>,
}

impl PluginBundle {
    pub fn new(instances: Vec<Box<dyn Instance>>) -> Self {
        Self { instances }
    }
}

/// Symbol name every nodeward plugin must export.
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"nodeward_plugin_entry";

/// Signature of the plugin entry export. The plugin allocates the bundle
/// with `Box::into_raw`; the host takes ownership back with
/// `Box::from_raw` exactly once.
pub type PluginEntryFn = unsafe extern "C" fn() -> *mut PluginBundle;

/// Declare the entry export for a plugin crate.
///
/// ```ignore
/// nodeward::declare_plugin!(|| vec![Box::new(MyCollector::default())]);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($factory:expr) => {
        #[no_mangle]
        pub extern "C" fn nodeward_plugin_entry() -> *mut $crate::instance::PluginBundle {
            let factory: fn() -> Vec<Box<dyn $crate::instance::Instance>> = $factory;
            Box::into_raw(Box::new($crate::instance::PluginBundle::new(factory())))
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_handle_buffers_and_drains_in_order() {
        let host = HostHandle::new("hotspot_scan");
        host.subscribe(Topic::new("cpu_stat", "usage", ""));
        host.unsubscribe(Topic::new("mem_stat", "", ""));

        let actions = host.drain();
        assert_eq!(actions.len(), 2);
        assert!(matches!(&actions[0], HostAction::Subscribe(t) if t.instance_name == "cpu_stat"));
        assert!(matches!(&actions[1], HostAction::Unsubscribe(t) if t.instance_name == "mem_stat"));
        assert!(host.drain().is_empty());
    }
}
