//! Native plugin loader + hot-reload support with security checks.
//!
//! A native plugin is a `cdylib` exporting
//! `extern "C" fn create_plugin() -> *mut dyn Plugin`.

use anyhow::{anyhow, Context, Result};
use libloading::Library;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::plugin::Plugin;
use crate::settings::PluginConfig;

pub const FACTORY_SYMBOL: &[u8] = b"create_plugin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Reload(PathBuf),
    Removed(PathBuf),
    SecurityViolation(String),
}

#[allow(improper_ctypes_definitions)]
type FactoryFn = unsafe extern "C" fn() -> *mut dyn Plugin;

/// Plugin security configuration
#[derive(Debug, Clone)]
pub struct PluginSecurityConfig {
    /// Allowed plugin hashes (SHA256, lowercase hex)
    pub allowed_hashes: HashSet<String>,
    /// Whether to enforce the hash allowlist
    pub require_signatures: bool,
    /// Maximum plugin file size in bytes
    pub max_plugin_size: usize,
    /// Allowed file extensions, with leading dot
    pub allowed_extensions: HashSet<String>,
}

impl Default for PluginSecurityConfig {
    fn default() -> Self {
        Self::from_plugin_config(&PluginConfig::default())
    }
}

impl PluginSecurityConfig {
    pub fn from_plugin_config(config: &PluginConfig) -> Self {
        Self {
            allowed_hashes: config
                .allowlist_hashes
                .iter()
                .map(|h| h.to_lowercase())
                .collect(),
            require_signatures: config.require_signatures,
            max_plugin_size: config.max_plugin_size_mb * 1024 * 1024,
            allowed_extensions: config.allowed_extensions.iter().cloned().collect(),
        }
    }
}

/// SHA-256 of a file as lowercase hex
pub fn file_hash(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read plugin file: {:?}", path))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extension, type and size checks shared by loading and the watcher
pub fn validate_plugin_path(path: &Path, config: &PluginSecurityConfig) -> Result<()> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .ok_or_else(|| anyhow!("Plugin file has no valid extension: {:?}", path))?;

    if !config.allowed_extensions.contains(&extension) {
        return Err(anyhow!("Plugin extension '{}' not allowed", extension));
    }

    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata for plugin: {:?}", path))?;
    if !metadata.is_file() {
        return Err(anyhow!("Path is not a regular file: {:?}", path));
    }
    if metadata.len() > config.max_plugin_size as u64 {
        return Err(anyhow!(
            "Plugin file too large: {} bytes (max: {})",
            metadata.len(),
            config.max_plugin_size
        ));
    }
    Ok(())
}

/// Plugin files in `dir` that pass the extension check, sorted by path
pub fn discover(dir: &Path, config: &PluginSecurityConfig) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read plugin directory: {:?}", dir))?;
    for entry in entries {
        let path = entry?.path();
        match validate_plugin_path(&path, config) {
            Ok(()) => found.push(path),
            Err(e) => tracing::debug!("Skipping {:?}: {}", path, e),
        }
    }
    found.sort();
    Ok(found)
}

/// A verified, opened plugin library
#[derive(Debug)]
pub struct NativePlugin {
    library: Arc<Library>,
    factory: FactoryFn,
    hash: String,
    path: PathBuf,
}

/// A plugin instance together with the library its code lives in
pub struct LoadedPlugin {
    pub plugin: Arc<dyn Plugin>,
    pub library: Arc<Library>,
    pub metadata: PluginMetadata,
}

#[derive(Debug, Clone)]
pub struct PluginMetadata {
    pub hash: String,
    pub path: PathBuf,
}

impl NativePlugin {
    /// Verify and open a plugin library.
    ///
    /// # Safety
    /// Loading a library runs its initializers; the caller must trust files
    /// that pass the allowlist.
    #[instrument(skip(security_config))]
    pub unsafe fn load(lib_path: &Path, security_config: &PluginSecurityConfig) -> Result<Self> {
        validate_plugin_path(lib_path, security_config)?;
        let hash = file_hash(lib_path)?;

        if security_config.require_signatures {
            if security_config.allowed_hashes.is_empty() {
                error!("Plugin allowlist is empty but signature verification is enabled");
                return Err(anyhow!(
                    "Plugin allowlist must be configured when signature verification is enabled"
                ));
            }
            if !security_config.allowed_hashes.contains(&hash) {
                error!("Plugin hash not in allowlist: {} ({})", hash, lib_path.display());
                quarantine_plugin(lib_path)?;
                return Err(anyhow!("Plugin not in security allowlist: {:?}", lib_path));
            }
            info!("Plugin hash verified: {} ({})", &hash[..16], lib_path.display());
        } else {
            warn!("Plugin signature verification is DISABLED - this should only be used in development");
        }

        info!("Loading plugin: {:?} (hash: {})", lib_path, &hash[..16]);
        let library = Library::new(lib_path)
            .with_context(|| format!("Failed to load plugin library: {:?}", lib_path))?;

        let factory: libloading::Symbol<FactoryFn> = library.get(FACTORY_SYMBOL).with_context(|| {
            format!("Plugin missing 'create_plugin' symbol: {:?}", lib_path)
        })?;
        let factory = *factory;

        Ok(Self {
            library: Arc::new(library),
            factory,
            hash,
            path: lib_path.to_path_buf(),
        })
    }

    /// Instantiate the plugin exported by this library.
    ///
    /// # Safety
    /// The factory must return a pointer obtained from `Box::into_raw`.
    #[instrument(skip(self))]
    pub unsafe fn instantiate(&self) -> Result<LoadedPlugin> {
        let result = std::panic::catch_unwind(|| {
            let raw = (self.factory)();
            if raw.is_null() {
                return Err(anyhow!("Plugin factory returned null pointer"));
            }
            Ok(Box::from_raw(raw))
        });

        match result {
            Ok(Ok(plugin)) => {
                let plugin: Arc<dyn Plugin> = Arc::from(plugin);
                info!("Instantiated plugin '{}' from {:?}", plugin.name(), self.path);
                Ok(LoadedPlugin {
                    plugin,
                    library: self.library.clone(),
                    metadata: self.metadata(),
                })
            }
            Ok(Err(e)) => {
                error!("Plugin instantiation failed: {}", e);
                Err(e)
            }
            Err(_) => {
                error!("Plugin instantiation panicked: {:?}", self.path);
                Err(anyhow!("Plugin instantiation panicked"))
            }
        }
    }

    pub fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            hash: self.hash.clone(),
            path: self.path.clone(),
        }
    }
}

/// Move a rejected plugin into `quarantine/` next to it
fn quarantine_plugin(lib_path: &Path) -> Result<PathBuf> {
    let quarantine_dir = lib_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("quarantine");

    if !quarantine_dir.exists() {
        fs::create_dir_all(&quarantine_dir).with_context(|| {
            format!("Failed to create quarantine directory: {:?}", quarantine_dir)
        })?;
    }

    let filename = lib_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown_plugin");
    let quarantine_path =
        quarantine_dir.join(format!("{}_{}", chrono::Utc::now().timestamp(), filename));

    fs::rename(lib_path, &quarantine_path).with_context(|| {
        format!(
            "Failed to quarantine plugin: {:?} -> {:?}",
            lib_path, quarantine_path
        )
    })?;

    warn!("Plugin quarantined due to allowlist failure: {:?}", quarantine_path);
    Ok(quarantine_path)
}

/* ------------ file-watcher hot-reload -------------- */

pub mod hot_reload {
    use super::*;
    use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
    use std::time::Duration;
    use tokio::sync::mpsc::Sender;

    /// Watch `dir` and forward plugin changes to `bus` until the receiver
    /// goes away.
    #[instrument(skip(bus, security_config))]
    pub async fn watch(
        dir: PathBuf,
        bus: Sender<PluginEvent>,
        security_config: PluginSecurityConfig,
    ) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);

        // OS watcher -> async bridge
        let mut watcher: RecommendedWatcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.blocking_send(res) {
                    error!("Failed to send file watcher event: {}", e);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!("Plugin hot-reload watcher started for directory: {:?}", dir);

        while let Some(evt) = rx.recv().await {
            let event = match evt {
                Ok(event) => event,
                Err(e) => {
                    error!("File watcher error: {}", e);
                    continue;
                }
            };
            for plugin_event in classify(&event, &security_config) {
                if bus.send(plugin_event).await.is_err() {
                    info!("Plugin event receiver closed, stopping watcher");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Map a filesystem event to plugin events
    pub(crate) fn classify(event: &Event, config: &PluginSecurityConfig) -> Vec<PluginEvent> {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) => event
                .paths
                .iter()
                .map(|path| match validate_plugin_path(path, config) {
                    Ok(()) => {
                        info!("Plugin file changed, scheduling reload: {:?}", path);
                        PluginEvent::Reload(path.clone())
                    }
                    Err(e) => {
                        warn!("Plugin validation failed for {:?}: {}", path, e);
                        PluginEvent::SecurityViolation(format!("Invalid plugin: {:?} - {}", path, e))
                    }
                })
                .collect(),
            EventKind::Remove(_) => event
                .paths
                .iter()
                .map(|path| PluginEvent::Removed(path.clone()))
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, RemoveKind};
    use notify::{Event, EventKind};
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_security_config_from_settings() {
        let config = PluginSecurityConfig::default();
        assert!(config.allowed_extensions.contains(".so"));
        assert!(config.allowed_extensions.contains(".dll"));
        assert!(config.allowed_extensions.contains(".dylib"));
        assert_eq!(config.max_plugin_size, 10 * 1024 * 1024);
        assert!(config.require_signatures);
    }

    #[test]
    fn test_validate_plugin_path() {
        let temp_dir = tempdir().unwrap();
        let plugin_path = temp_dir.path().join("test.so");
        File::create(&plugin_path).unwrap();

        let config = PluginSecurityConfig::default();
        assert!(validate_plugin_path(&plugin_path, &config).is_ok());

        let bad_path = temp_dir.path().join("test.txt");
        File::create(&bad_path).unwrap();
        assert!(validate_plugin_path(&bad_path, &config).is_err());

        let mut small = config.clone();
        small.max_plugin_size = 4;
        let mut f = File::create(&plugin_path).unwrap();
        f.write_all(b"more than four bytes").unwrap();
        assert!(validate_plugin_path(&plugin_path, &small).is_err());
    }

    #[test]
    fn test_file_hash_calculation() {
        let temp_dir = tempdir().unwrap();
        let file_path = temp_dir.path().join("test.so");
        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"test content").unwrap();

        assert_eq!(
            file_hash(&file_path).unwrap(),
            "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }

    #[test]
    fn test_unlisted_plugin_is_quarantined() {
        let temp_dir = tempdir().unwrap();
        let plugin_path = temp_dir.path().join("rogue.so");
        File::create(&plugin_path).unwrap().write_all(b"not a library").unwrap();

        let mut config = PluginSecurityConfig::default();
        config.allowed_hashes.insert("0".repeat(64));

        let err = unsafe { NativePlugin::load(&plugin_path, &config) }.unwrap_err();
        assert!(err.to_string().contains("allowlist"));
        assert!(!plugin_path.exists());
        let quarantined: Vec<_> = fs::read_dir(temp_dir.path().join("quarantine"))
            .unwrap()
            .collect();
        assert_eq!(quarantined.len(), 1);
    }

    #[test]
    fn test_empty_allowlist_refuses_to_load() {
        let temp_dir = tempdir().unwrap();
        let plugin_path = temp_dir.path().join("any.so");
        File::create(&plugin_path).unwrap();

        let err = unsafe { NativePlugin::load(&plugin_path, &PluginSecurityConfig::default()) }
            .unwrap_err();
        assert!(err.to_string().contains("allowlist must be configured"));
        assert!(plugin_path.exists());
    }

    #[test]
    fn test_discover_filters_by_extension() {
        let temp_dir = tempdir().unwrap();
        File::create(temp_dir.path().join("b.so")).unwrap();
        File::create(temp_dir.path().join("a.so")).unwrap();
        File::create(temp_dir.path().join("notes.md")).unwrap();

        let found = discover(temp_dir.path(), &PluginSecurityConfig::default()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.so", "b.so"]);
    }

    #[test]
    fn test_watcher_event_classification() {
        let temp_dir = tempdir().unwrap();
        let plugin_path = temp_dir.path().join("calc.so");
        File::create(&plugin_path).unwrap();
        let config = PluginSecurityConfig::default();

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path(plugin_path.clone());
        assert_eq!(
            hot_reload::classify(&created, &config),
            vec![PluginEvent::Reload(plugin_path.clone())]
        );

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path(plugin_path.clone());
        assert_eq!(
            hot_reload::classify(&removed, &config),
            vec![PluginEvent::Removed(plugin_path)]
        );

        let bogus = Event::new(EventKind::Create(CreateKind::File))
            .add_path(temp_dir.path().join("readme.txt"));
        assert!(matches!(
            hot_reload::classify(&bogus, &config).as_slice(),
            [PluginEvent::SecurityViolation(_)]
        ));
    }
}
