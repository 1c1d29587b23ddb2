//! Plugin capability registry and the intent → handler index.
//!
//! Readers take an `Arc` of the current snapshot and never see a partially
//! applied change. Writers are serialized, rebuild the index from the full
//! descriptor set, and swap the snapshot in one step.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::error::{NotFoundError, RegistrationError};
use crate::permissions::Permission;
use crate::plugin::{Handler, PluginDescriptor, MAX_PRIORITY, MIN_PRIORITY};

/// A routable (plugin, handler, intent) triple derived from a descriptor.
#[derive(Clone, Serialize)]
pub struct HandlerBinding {
    pub plugin: String,
    pub handler: String,
    pub intent: String,
    pub priority: u8,
    /// Plugin-wide permissions followed by the handler's own.
    pub permissions: Vec<Permission>,
    /// Registration order of the owning plugin; lower registered first.
    pub sequence: u64,
    pub requires_ai: bool,
    #[serde(skip)]
    pub(crate) invoker: Arc<dyn Handler>,
}

impl HandlerBinding {
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.plugin, self.handler)
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("plugin", &self.plugin)
            .field("handler", &self.handler)
            .field("intent", &self.intent)
            .field("priority", &self.priority)
            .field("permissions", &self.permissions)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredPlugin {
    pub descriptor: PluginDescriptor,
    pub sequence: u64,
    pub registered_at: DateTime<Utc>,
}

/// Immutable view of the registry at one point in time.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    plugins: BTreeMap<String, RegisteredPlugin>,
    index: HashMap<String, Vec<HandlerBinding>>,
    version: u64,
}

impl RegistrySnapshot {
    fn build(plugins: BTreeMap<String, RegisteredPlugin>, version: u64) -> Self {
        let mut index: HashMap<String, Vec<(usize, HandlerBinding)>> = HashMap::new();
        for registered in plugins.values() {
            let d = &registered.descriptor;
            for (position, spec) in d.handlers.iter().enumerate() {
                let mut permissions = d.required_permissions.clone();
                for p in &spec.permissions {
                    if !permissions.contains(p) {
                        permissions.push(p.clone());
                    }
                }
                index.entry(spec.intent.clone()).or_default().push((
                    position,
                    HandlerBinding {
                        plugin: d.name.clone(),
                        handler: spec.name.clone(),
                        intent: spec.intent.clone(),
                        priority: spec.priority,
                        permissions,
                        sequence: registered.sequence,
                        requires_ai: d.requires_ai,
                        invoker: spec.handler.clone(),
                    },
                ));
            }
        }

        let index = index
            .into_iter()
            .map(|(intent, mut bindings)| {
                bindings.sort_by(|(pa, a), (pb, b)| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.sequence.cmp(&b.sequence))
                        .then(pa.cmp(pb))
                });
                (intent, bindings.into_iter().map(|(_, b)| b).collect())
            })
            .collect();

        Self {
            plugins,
            index,
            version,
        }
    }

    /// Bindings for `intent`, priority descending, ties by registration order.
    pub fn handlers_for(&self, intent: &str) -> &[HandlerBinding] {
        self.index.get(intent).map_or(&[], Vec::as_slice)
    }

    pub fn binding(&self, plugin: &str, handler: &str) -> Result<&HandlerBinding, NotFoundError> {
        if !self.plugins.contains_key(plugin) {
            return Err(NotFoundError::Plugin(plugin.to_string()));
        }
        self.index
            .values()
            .flatten()
            .find(|b| b.plugin == plugin && b.handler == handler)
            .ok_or_else(|| NotFoundError::Handler {
                plugin: plugin.to_string(),
                handler: handler.to_string(),
            })
    }

    pub fn plugin(&self, name: &str) -> Option<&RegisteredPlugin> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn plugins(&self) -> impl Iterator<Item = &RegisteredPlugin> {
        self.plugins.values()
    }

    pub fn intents(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.index.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    /// Incremented on every successful register or deregister.
    pub fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Default)]
pub struct PluginRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    writer: Mutex<u64>,
}

pub(crate) fn validate(d: &PluginDescriptor) -> Result<(), RegistrationError> {
    if d.name.trim().is_empty() {
        return Err(RegistrationError::invalid(&d.name, "plugin name is empty"));
    }
    if d.version.trim().is_empty() {
        return Err(RegistrationError::invalid(&d.name, "version is empty"));
    }

    let mut names = HashSet::new();
    let mut claims: HashMap<(&str, u8), &str> = HashMap::new();
    for h in &d.handlers {
        if h.name.trim().is_empty() {
            return Err(RegistrationError::invalid(&d.name, "handler name is empty"));
        }
        if h.intent.trim().is_empty() {
            return Err(RegistrationError::invalid(
                &d.name,
                format!("handler `{}` declares an empty intent", h.name),
            ));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&h.priority) {
            return Err(RegistrationError::invalid(
                &d.name,
                format!(
                    "handler `{}` priority {} outside {}..={}",
                    h.name, h.priority, MIN_PRIORITY, MAX_PRIORITY
                ),
            ));
        }
        if !names.insert(h.name.as_str()) {
            return Err(RegistrationError::invalid(
                &d.name,
                format!("duplicate handler name `{}`", h.name),
            ));
        }
        if let Some(first) = claims.insert((h.intent.as_str(), h.priority), h.name.as_str()) {
            return Err(RegistrationError::DuplicateCapabilityConflict {
                plugin: d.name.clone(),
                intent: h.intent.clone(),
                priority: h.priority,
                first: first.to_string(),
                second: h.name.clone(),
            });
        }
    }
    Ok(())
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Holding it pins the registry state it was taken at.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    /// Register or atomically replace a plugin. A replaced plugin keeps its
    /// original registration sequence.
    #[instrument(skip(self, descriptor), fields(plugin = %descriptor.name))]
    pub fn register(&self, descriptor: PluginDescriptor) -> Result<(), RegistrationError> {
        validate(&descriptor)?;

        let mut next_sequence = self.writer.lock();
        let base = self.snapshot();
        let mut plugins = base.plugins.clone();

        let replaced = plugins.get(&descriptor.name).map(|p| p.sequence);
        let sequence = replaced.unwrap_or_else(|| {
            let s = *next_sequence;
            *next_sequence += 1;
            s
        });
        let name = descriptor.name.clone();
        let handler_count = descriptor.handlers.len();
        plugins.insert(
            name.clone(),
            RegisteredPlugin {
                descriptor,
                sequence,
                registered_at: Utc::now(),
            },
        );

        let next = RegistrySnapshot::build(plugins, base.version + 1);
        *self.current.write() = Arc::new(next);

        if replaced.is_some() {
            info!("Replaced plugin '{}' ({} handlers)", name, handler_count);
        } else {
            info!(
                "Registered plugin '{}' ({} handlers, sequence {})",
                name, handler_count, sequence
            );
        }
        Ok(())
    }

    /// Remove a plugin and every binding derived from it.
    #[instrument(skip(self))]
    pub fn deregister(&self, name: &str) -> Result<(), NotFoundError> {
        let _guard = self.writer.lock();
        let base = self.snapshot();
        if !base.plugins.contains_key(name) {
            return Err(NotFoundError::Plugin(name.to_string()));
        }
        let mut plugins = base.plugins.clone();
        plugins.remove(name);

        let next = RegistrySnapshot::build(plugins, base.version + 1);
        *self.current.write() = Arc::new(next);
        info!("Deregistered plugin '{}'", name);
        Ok(())
    }

    pub fn handlers_for(&self, intent: &str) -> Vec<HandlerBinding> {
        let bindings = self.snapshot().handlers_for(intent).to_vec();
        debug!(intent, candidates = bindings.len(), "Resolved handler bindings");
        bindings
    }

    pub fn binding(&self, plugin: &str, handler: &str) -> Result<HandlerBinding, NotFoundError> {
        self.snapshot().binding(plugin, handler).cloned()
    }

    pub fn descriptor(&self, name: &str) -> Option<PluginDescriptor> {
        self.snapshot().plugin(name).map(|p| p.descriptor.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().contains(name)
    }

    pub fn plugins(&self) -> Vec<String> {
        self.snapshot().plugins.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
