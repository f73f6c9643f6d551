//! Plugin registry and loader.
//!
//! Plugins arrive two ways: native shared objects exposing the single
//! `nodeward_plugin_entry` export, and built-in builders registered at
//! startup (also what tests use). Either way a plugin yields zero or more
//! instances which the scheduler then owns; the registry keeps the library
//! handle alive until every owned instance has been dropped.

use crate::error::{Result, WardError};
use crate::instance::{Instance, PluginBundle, PluginEntryFn, PLUGIN_ENTRY_SYMBOL};
use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Factory for a statically-registered plugin.
pub type BuiltinBuilder = fn() -> Vec<Box<dyn Instance>>;

/// One loaded plugin and the instances it produced.
pub struct Plugin {
    pub name: String,
    pub path: Option<PathBuf>,
    pub instance_names: Vec<String>,
    // Dropped last: instances originating from this library must already
    // be gone when the handle is released.
    library: Option<Library>,
}

/// Serializable view of a plugin for LIST responses.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PluginSnapshot {
    pub name: String,
    pub path: Option<String>,
    pub instances: Vec<String>,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Plugin>,
    builtins: HashMap<String, BuiltinBuilder>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a builder selectable by name without dynamic loading.
    pub fn register_builtin(&mut self, name: impl Into<String>, builder: BuiltinBuilder) {
        self.builtins.insert(name.into(), builder);
    }

    /// Load a shared object and obtain its instances.
    ///
    /// The plugin is parked in the registry with no instance names yet;
    /// the caller must follow up with [`commit`](Self::commit) once the
    /// scheduler accepted the instances, or [`discard`](Self::discard) to
    /// roll the load back.
    pub fn load(&mut self, path: &Path) -> Result<(String, Vec<Box<dyn Instance>>)> {
        let path_str = path.display().to_string();
        if !path.is_file() {
            return Err(WardError::FileNotExist(path_str));
        }
        if path.extension().and_then(|e| e.to_str()) != Some("so") {
            return Err(WardError::NotASharedObject(path_str));
        }
        check_owner_restricted(path)?;

        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.trim_start_matches("lib").to_string())
            .ok_or_else(|| WardError::NotASharedObject(path_str.clone()))?;
        if self.plugins.contains_key(&name) {
            return Err(WardError::AlreadyLoaded(name));
        }

        // SAFETY: loading attacker-controlled code is exactly what the
        // permission check above gates; beyond that, dlopen runs the
        // library's initializers, which is inherent to native plugins.
        let library = unsafe { Library::new(path) }.map_err(|e| WardError::LoadFailed {
            path: path_str.clone(),
            reason: e.to_string(),
        })?;

        let instances = {
            // SAFETY: the export signature is fixed by PluginEntryFn and the
            // bundle pointer was produced by Box::into_raw on the plugin
            // side; ownership transfers to the host exactly once here.
            let entry = unsafe { library.get::<PluginEntryFn>(PLUGIN_ENTRY_SYMBOL) }.map_err(
                |e| WardError::ExportMissing {
                    path: path_str.clone(),
                    reason: e.to_string(),
                },
            )?;
            let bundle: Box<PluginBundle> = unsafe { Box::from_raw(entry()) };
            bundle.instances
        };

        debug!(plugin = %name, path = %path_str, count = instances.len(), "plugin loaded");
        self.plugins.insert(
            name.clone(),
            Plugin {
                name: name.clone(),
                path: Some(path.to_path_buf()),
                instance_names: Vec::new(),
                library: Some(library),
            },
        );
        Ok((name, instances))
    }

    /// Instantiate a built-in plugin by name.
    pub fn load_builtin(&mut self, name: &str) -> Result<(String, Vec<Box<dyn Instance>>)> {
        if self.plugins.contains_key(name) {
            return Err(WardError::AlreadyLoaded(name.to_string()));
        }
        let builder = self
            .builtins
            .get(name)
            .copied()
            .ok_or_else(|| WardError::PluginNotExist(name.to_string()))?;
        let instances = builder();
        debug!(plugin = %name, count = instances.len(), "builtin plugin instantiated");
        self.plugins.insert(
            name.to_string(),
            Plugin {
                name: name.to_string(),
                path: None,
                instance_names: Vec::new(),
                library: None,
            },
        );
        Ok((name.to_string(), instances))
    }

    /// Record the instance names the scheduler accepted for a plugin.
    pub fn commit(&mut self, plugin: &str, instance_names: Vec<String>) {
        if let Some(p) = self.plugins.get_mut(plugin) {
            info!(plugin = %plugin, instances = ?instance_names, "plugin committed");
            p.instance_names = instance_names;
        }
    }

    /// Drop a plugin entry (and its library handle, if any).
    ///
    /// All instances produced by the plugin must have been dropped before
    /// this is called; the scheduler's reply ordering guarantees that on
    /// both the rollback and the removal path.
    pub fn discard(&mut self, plugin: &str) {
        if self.plugins.remove(plugin).is_some() {
            info!(plugin = %plugin, "plugin unloaded");
        } else {
            warn!(plugin = %plugin, "discard for unknown plugin");
        }
    }

    pub fn contains(&self, plugin: &str) -> bool {
        self.plugins.contains_key(plugin)
    }

    pub fn get(&self, plugin: &str) -> Option<&Plugin> {
        self.plugins.get(plugin)
    }

    pub fn path_of(&self, plugin: &str) -> Result<PathBuf> {
        let p = self
            .plugins
            .get(plugin)
            .ok_or_else(|| WardError::PluginNotExist(plugin.to_string()))?;
        p.path
            .clone()
            .ok_or_else(|| WardError::PluginNotExist(format!("{plugin} (built-in, no file)")))
    }

    pub fn instance_names(&self, plugin: &str) -> Result<Vec<String>> {
        self.plugins
            .get(plugin)
            .map(|p| p.instance_names.clone())
            .ok_or_else(|| WardError::PluginNotExist(plugin.to_string()))
    }

    pub fn snapshots(&self) -> Vec<PluginSnapshot> {
        let mut out: Vec<PluginSnapshot> = self
            .plugins
            .values()
            .map(|p| PluginSnapshot {
                name: p.name.clone(),
                path: p.path.as_ref().map(|p| p.display().to_string()),
                instances: p.instance_names.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Reject plugin files writable by group or other. Loading code from an
/// attacker-writable path is the one thing this loader must never do.
#[cfg(unix)]
fn check_owner_restricted(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::metadata(path)?.permissions().mode();
    if mode & 0o022 != 0 {
        return Err(WardError::PermissionDenied(format!(
            "{} has mode {:o}",
            path.display(),
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_restricted(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataList, Topic};
    use crate::instance::{HostHandle, InstanceInfo, InstanceKind, RunStatus};

    struct NullCollector;

    impl Instance for NullCollector {
        fn info(&self) -> InstanceInfo {
            InstanceInfo {
                name: "null_collector".into(),
                version: "1.0".into(),
                description: "does nothing".into(),
                kind: InstanceKind::Collector,
                period: 1,
                priority: 0,
                supported_topics: vec!["noop".into()],
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

        fn run(&mut self, _host: &HostHandle) -> RunStatus {
            RunStatus::Ok
        }

        fn open_topic(&mut self, _topic: &Topic) -> std::result::Result<(), String> {
            Ok(())
        }

        fn close_topic(&mut self, _topic: &Topic) {}

        fn update_data(&mut self, _data: &DataList) {}
    }

    fn null_builder() -> Vec<Box<dyn Instance>> {
        vec![Box::new(NullCollector)]
    }

    #[test]
    fn missing_file_is_file_not_exist() {
        let mut reg = PluginRegistry::new();
        let err = reg.load(Path::new("/nonexistent/libghost.so")).unwrap_err();
        assert!(matches!(err, WardError::FileNotExist(_)));
    }

    #[test]
    fn wrong_extension_is_not_a_shared_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugin.txt");
        std::fs::write(&path, b"not code").unwrap();

        let mut reg = PluginRegistry::new();
        assert!(matches!(
            reg.load(&path).unwrap_err(),
            WardError::NotASharedObject(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn group_writable_file_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libloose.so");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o664)).unwrap();

        let mut reg = PluginRegistry::new();
        assert!(matches!(
            reg.load(&path).unwrap_err(),
            WardError::PermissionDenied(_)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn garbage_shared_object_is_load_failed() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libgarbage.so");
        std::fs::write(&path, b"definitely not an ELF").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut reg = PluginRegistry::new();
        assert!(matches!(
            reg.load(&path).unwrap_err(),
            WardError::LoadFailed { .. }
        ));
        // A failed load leaves no registry entry behind.
        assert!(!reg.contains("garbage"));
    }

    #[test]
    fn builtin_load_commit_and_duplicate() {
        let mut reg = PluginRegistry::new();
        reg.register_builtin("nulls", null_builder);

        let (name, instances) = reg.load_builtin("nulls").unwrap();
        assert_eq!(name, "nulls");
        assert_eq!(instances.len(), 1);
        reg.commit("nulls", vec!["null_collector".into()]);

        assert!(matches!(
            reg.load_builtin("nulls").unwrap_err(),
            WardError::AlreadyLoaded(_)
        ));

        let snaps = reg.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].instances, vec!["null_collector".to_string()]);

        reg.discard("nulls");
        assert!(!reg.contains("nulls"));
    }

    #[test]
    fn unknown_builtin_is_plugin_not_exist() {
        let mut reg = PluginRegistry::new();
        assert!(matches!(
            reg.load_builtin("ghost").unwrap_err(),
            WardError::PluginNotExist(_)
        ));
    }

    #[test]
    fn path_of_builtin_has_no_file() {
        let mut reg = PluginRegistry::new();
        reg.register_builtin("nulls", null_builder);
        reg.load_builtin("nulls").unwrap();
        assert!(reg.path_of("nulls").is_err());
        assert!(reg.path_of("ghost").is_err());
    }
}
