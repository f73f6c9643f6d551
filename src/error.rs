use thiserror::Error;

/// Error taxonomy for the daemon, the loader and the wire layer.
///
/// Every variant renders a stable human-readable string; these strings are
/// what clients see in `RESPONSE_ERROR` payloads, so changing them is a
/// protocol-visible change.
#[derive(Error, Debug)]
pub enum WardError {
    // Plugin load errors
    #[error("plugin file does not exist: {0}")]
    FileNotExist(String),

    #[error("not a shared object: {0}")]
    NotASharedObject(String),

    #[error("plugin file permissions are too open: {0}")]
    PermissionDenied(String),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("failed to load plugin {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    #[error("plugin entry export missing in {path}: {reason}")]
    ExportMissing { path: String, reason: String },

    // Instance lifecycle errors
    #[error("instance not loaded: {0}")]
    NotLoaded(String),

    #[error("instance unavailable: {0}")]
    Unavailable(String),

    #[error("instance already enabled: {0}")]
    AlreadyEnabled(String),

    #[error("instance already disabled: {0}")]
    AlreadyDisabled(String),

    #[error("environment error: {0}")]
    EnvironmentError(String),

    // Topology errors
    #[error("plugin does not exist: {0}")]
    PluginNotExist(String),

    #[error("plugin has running instance: {0}")]
    InstanceRunning(String),

    #[error("plugin has dependent subscribers: {0}")]
    HasDependents(String),

    // Subscription errors
    #[error("topic not supported by instance {instance}: {topic}")]
    TopicNotSupported { instance: String, topic: String },

    #[error("not subscribed: {0}")]
    AlreadyUnsubscribed(String),

    // Ambient errors
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("peer connection closed")]
    ConnectionClosed,

    #[error("daemon channel closed")]
    ChannelClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardError {
    /// Errors after which the connection must be torn down rather than
    /// answered. Frame-boundary overruns fall here; payload-level codec
    /// failures do not.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            WardError::Protocol(_) | WardError::ConnectionClosed | WardError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_strings_are_stable() {
        assert_eq!(
            WardError::AlreadyLoaded("numa_probe".into()).to_string(),
            "plugin already loaded: numa_probe"
        );
        assert_eq!(
            WardError::TopicNotSupported {
                instance: "cpu_stat".into(),
                topic: "nonsense".into(),
            }
            .to_string(),
            "topic not supported by instance cpu_stat: nonsense"
        );
        assert_eq!(
            WardError::AlreadyUnsubscribed("cpu_stat::usage::".into()).to_string(),
            "not subscribed: cpu_stat::usage::"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(WardError::Protocol("declared length past frame".into()).is_fatal_to_connection());
        assert!(WardError::ConnectionClosed.is_fatal_to_connection());
        assert!(!WardError::Codec("short read".into()).is_fatal_to_connection());
        assert!(!WardError::NotLoaded("x".into()).is_fatal_to_connection());
    }
}
