//! Request pipeline and plugin host.
//!
//! The orchestrator owns every shared component, built once at startup and
//! injected into the dispatcher and plugin contexts. A request flows through
//! intent resolution, dispatch, response assembly and a context update, with
//! a lifecycle event published at each step.

use anyhow::{anyhow, Context, Result};
use dashmap::DashSet;
use libloading::Library;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::ai::{AiProvider, EmbeddingRanker, HashingEmbedder};
use crate::builtin::{ConversationPlugin, SystemPlugin};
use crate::context::{ContextStore, SimilarityRanker};
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, NotFoundError, RegistrationError};
use crate::event_bus::{topics, EventBus};
use crate::intent::{IntentResolver, KeywordIntentResolver, RawRequest};
use crate::loader::{self, hot_reload, NativePlugin, PluginEvent, PluginSecurityConfig};
use crate::monitoring::MonitoringSystem;
use crate::permissions::{Permission, PermissionGate, Subject};
use crate::persistence::Persistence;
use crate::plugin::{Plugin, PluginInfo, PluginStatus};
use crate::registry::{self, PluginRegistry};
use crate::response::{Response, ResponseAssembler, TemplateAssembler};
use crate::settings::Settings;
use crate::storage::KeyedExpiringStore;

const ORCHESTRATOR_SOURCE: &str = "orchestrator";

struct PluginSlot {
    plugin: Arc<dyn Plugin>,
    status: PluginStatus,
    last_error: Option<String>,
    /// Library path for natively loaded plugins
    source: Option<PathBuf>,
}

impl PluginSlot {
    fn info(&self) -> PluginInfo {
        let descriptor = self.plugin.descriptor();
        PluginInfo {
            intents: descriptor
                .declared_intents()
                .into_iter()
                .map(str::to_string)
                .collect(),
            name: descriptor.name,
            version: descriptor.version,
            description: descriptor.description,
            author: descriptor.author,
            status: self.status,
            requires_ai: descriptor.requires_ai,
            last_error: self.last_error.clone(),
        }
    }
}

/// Collects the replaceable collaborators before the components are wired.
pub struct OrchestratorBuilder {
    settings: Settings,
    resolver: Option<Arc<dyn IntentResolver>>,
    assembler: Option<Arc<dyn ResponseAssembler>>,
    ai: Option<Arc<dyn AiProvider>>,
    ranker: Option<Arc<dyn SimilarityRanker>>,
    builtins: bool,
}

impl OrchestratorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            resolver: None,
            assembler: None,
            ai: None,
            ranker: None,
            builtins: true,
        }
    }

    pub fn resolver(mut self, resolver: Arc<dyn IntentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn assembler(mut self, assembler: Arc<dyn ResponseAssembler>) -> Self {
        self.assembler = Some(assembler);
        self
    }

    /// Provider handed to plugins; defaults to the offline hashing embedder.
    pub fn ai_provider(mut self, ai: Arc<dyn AiProvider>) -> Self {
        self.ai = Some(ai);
        self
    }

    pub fn ranker(mut self, ranker: Arc<dyn SimilarityRanker>) -> Self {
        self.ranker = Some(ranker);
        self
    }

    /// Skip the built-in conversation and system plugins.
    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    #[instrument(skip(self))]
    pub async fn build(self) -> Result<Orchestrator> {
        let settings = self.settings;
        settings.validate()?;

        let persistence = match &settings.storage.persistence_path {
            Some(path) => Some(Arc::new(Persistence::open(path).with_context(|| {
                format!("Failed to open persistence at {}", path.display())
            })?)),
            None => None,
        };

        let store = Arc::new(match &persistence {
            Some(p) => KeyedExpiringStore::with_persistence(p.clone())?,
            None => KeyedExpiringStore::new(),
        });
        let sweeper = store.spawn_sweeper(settings.storage.sweep_interval());

        let monitor = Arc::new(MonitoringSystem::default());
        let events = EventBus::new(&settings.events, monitor.clone());

        let ai: Arc<dyn AiProvider> = self.ai.unwrap_or_else(|| {
            Arc::new(HashingEmbedder::new(settings.context.embedding_dimensions))
        });
        let ranker = self
            .ranker
            .unwrap_or_else(|| Arc::new(EmbeddingRanker::new(ai.clone())));
        let mut context = ContextStore::new(
            settings.context.max_history,
            settings.context.relevant_limit,
            ranker,
        );
        if let Some(p) = &persistence {
            context = context.with_persistence(p.clone())?;
        }

        let registry = Arc::new(PluginRegistry::new());
        let gate = Arc::new(PermissionGate::new());
        for (plugin, grants) in &settings.permissions.plugin_grants {
            for grant in grants {
                gate.grant(Subject::plugin(plugin), Permission::parse(grant));
            }
        }

        let dispatcher = Dispatcher::new(
            registry.clone(),
            gate.clone(),
            store.clone(),
            events.clone(),
            Some(ai),
            monitor.clone(),
            settings.dispatch.clone(),
        );

        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(KeywordIntentResolver::default()));
        let assembler = self
            .assembler
            .unwrap_or_else(|| Arc::new(TemplateAssembler::new(settings.agent.name.clone())));

        let orchestrator = Orchestrator {
            settings,
            registry,
            gate,
            store,
            events,
            context: Arc::new(context),
            dispatcher,
            monitor,
            resolver,
            assembler,
            persistence,
            plugins: Mutex::new(BTreeMap::new()),
            known_users: DashSet::new(),
            libraries: parking_lot::Mutex::new(Vec::new()),
            background: parking_lot::Mutex::new(vec![sweeper]),
            shutting_down: AtomicBool::new(false),
        };

        if self.builtins {
            let conversation = ConversationPlugin::new(
                orchestrator.settings.agent.name.clone(),
                &orchestrator.registry,
            );
            orchestrator.load_plugin(Arc::new(conversation)).await?;
            let system = SystemPlugin::new(&orchestrator.registry);
            orchestrator.load_plugin(Arc::new(system)).await?;
        }

        info!(
            "Orchestrator '{}' ready with {} plugin(s)",
            orchestrator.settings.agent.name,
            orchestrator.registry.len()
        );
        Ok(orchestrator)
    }
}

pub struct Orchestrator {
    settings: Settings,
    registry: Arc<PluginRegistry>,
    gate: Arc<PermissionGate>,
    store: Arc<KeyedExpiringStore>,
    events: EventBus,
    context: Arc<ContextStore>,
    dispatcher: Dispatcher,
    monitor: Arc<MonitoringSystem>,
    resolver: Arc<dyn IntentResolver>,
    assembler: Arc<dyn ResponseAssembler>,
    persistence: Option<Arc<Persistence>>,
    /// Lifecycle lock; held across `initialize`/`shutdown` hooks.
    plugins: Mutex<BTreeMap<String, PluginSlot>>,
    known_users: DashSet<String>,
    /// Native libraries stay mapped until the process exits.
    libraries: parking_lot::Mutex<Vec<Arc<Library>>>,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Orchestrator {
    pub fn builder(settings: Settings) -> OrchestratorBuilder {
        OrchestratorBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn store(&self) -> &Arc<KeyedExpiringStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn monitor(&self) -> &Arc<MonitoringSystem> {
        &self.monitor
    }

    fn emit(&self, topic: &str, payload: Value) {
        if let Err(e) = self.events.publish(topic, payload, ORCHESTRATOR_SOURCE) {
            debug!("Dropped '{}' event: {}", topic, e);
        }
    }

    /* ------------------------- request pipeline ------------------------- */

    /// Handle one natural-language request. Always yields a structured
    /// response; failures are reported in `Response::error`.
    #[instrument(skip(self, text), fields(request_id))]
    pub async fn handle_request(&self, user_id: &str, text: &str) -> Response {
        let raw = RawRequest::new(user_id, text);
        tracing::Span::current().record("request_id", tracing::field::display(raw.id));
        let agent = &self.settings.agent.name;

        if self.shutting_down.load(Ordering::Acquire) {
            return Response::failure(
                agent,
                raw.id,
                user_id,
                None,
                "shutting_down",
                "orchestrator is shutting down",
                "I'm shutting down and can't take new requests.",
            );
        }

        let ceiling = self.settings.agent.request_timeout();
        match tokio::time::timeout(ceiling, self.process(&raw)).await {
            Ok(response) => response,
            Err(_) => {
                warn!("Request {} exceeded {:?}", raw.id, ceiling);
                self.emit(
                    topics::DISPATCH_FAILED,
                    json!({ "request_id": raw.id, "user_id": user_id, "kind": "request_timeout" }),
                );
                Response::failure(
                    agent,
                    raw.id,
                    user_id,
                    None,
                    "request_timeout",
                    format!("request exceeded {}ms", ceiling.as_millis()),
                    "Sorry, I could not complete that request in time.",
                )
            }
        }
    }

    async fn process(&self, raw: &RawRequest) -> Response {
        let agent = &self.settings.agent.name;
        self.emit(
            topics::REQUEST_RECEIVED,
            json!({ "request_id": raw.id, "user_id": raw.user_id, "text": raw.text }),
        );
        self.ensure_default_grants(&raw.user_id);

        let intent = match self.resolver.resolve(raw).await {
            Ok(intent) => intent,
            Err(e) => {
                info!("Intent resolution failed: {}", e);
                self.emit(
                    topics::DISPATCH_FAILED,
                    json!({ "request_id": raw.id, "kind": "intent_resolution", "error": e.to_string() }),
                );
                return Response::failure(
                    agent,
                    raw.id,
                    &raw.user_id,
                    None,
                    "intent_resolution",
                    e.to_string(),
                    "I'm not sure how to help with that. Try asking for 'help'.",
                );
            }
        };
        self.emit(
            topics::INTENT_RESOLVED,
            json!({ "request_id": raw.id, "intent": intent.kind(), "confidence": intent.confidence() }),
        );

        let caller = Subject::user(&raw.user_id);
        let result = match self.dispatcher.dispatch(&intent, &caller).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Dispatch of '{}' failed: {}", intent.kind(), e);
                self.emit(
                    topics::DISPATCH_FAILED,
                    json!({
                        "request_id": raw.id,
                        "intent": intent.kind(),
                        "kind": e.kind(),
                        "error": e.to_string(),
                    }),
                );
                return Response::failure(
                    agent,
                    raw.id,
                    &raw.user_id,
                    Some(&intent),
                    e.kind(),
                    e.to_string(),
                    failure_message(&e),
                );
            }
        };

        let user_context = self.context.get_context(&raw.user_id).await;
        let response = self
            .assembler
            .assemble(&result, &intent, &user_context, raw.id)
            .await;

        let recorded = serde_json::to_value(&response).unwrap_or_default();
        if let Err(e) = self
            .context
            .update_context(&raw.user_id, intent.clone(), recorded)
            .await
        {
            error!("Context update for '{}' failed: {}", raw.user_id, e);
            return Response::failure(
                agent,
                raw.id,
                &raw.user_id,
                Some(&intent),
                "storage_error",
                e.to_string(),
                "I handled that, but could not save our conversation.",
            );
        }

        self.emit(topics::CONTEXT_UPDATED, json!({ "user_id": raw.user_id }));
        self.emit(
            topics::DISPATCH_COMPLETED,
            json!({
                "request_id": raw.id,
                "intent": result.intent,
                "plugin": result.binding.plugin,
                "handler": result.binding.handler,
                "attempts": result.attempts.len(),
                "low_confidence": result.low_confidence,
                "elapsed_ms": result.elapsed_ms,
            }),
        );
        response
    }

    fn ensure_default_grants(&self, user_id: &str) {
        if !self.known_users.insert(user_id.to_string()) {
            return;
        }
        for grant in &self.settings.permissions.default_user_grants {
            self.gate.grant(Subject::user(user_id), Permission::parse(grant));
        }
        debug!("Installed default grants for user '{}'", user_id);
    }

    /* ----------------------------- lifecycle ---------------------------- */

    /// Initialize and register `plugin`. A plugin with the same name is
    /// replaced atomically and shut down afterwards.
    pub async fn load_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), RegistrationError> {
        let mut plugins = self.plugins.lock().await;
        self.install(&mut plugins, plugin, None).await
    }

    #[instrument(skip(self, plugins, plugin, source), fields(plugin = %plugin.name()))]
    async fn install(
        &self,
        plugins: &mut BTreeMap<String, PluginSlot>,
        plugin: Arc<dyn Plugin>,
        source: Option<PathBuf>,
    ) -> Result<(), RegistrationError> {
        let descriptor = plugin.descriptor();
        let name = descriptor.name.clone();
        if name != plugin.name() {
            return Err(RegistrationError::invalid(
                &name,
                format!("descriptor name differs from plugin name `{}`", plugin.name()),
            ));
        }
        registry::validate(&descriptor)?;

        let replacing = plugins.contains_key(&name);
        if !replacing {
            plugins.insert(
                name.clone(),
                PluginSlot {
                    plugin: plugin.clone(),
                    status: PluginStatus::Loading,
                    last_error: None,
                    source: source.clone(),
                },
            );
        }

        let ctx = self.dispatcher.lifecycle_context(&name, descriptor.requires_ai);
        let limit = self.settings.dispatch.dispatch_timeout();
        let initialized = match tokio::time::timeout(limit, plugin.initialize(&ctx)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("initialize exceeded {}ms", limit.as_millis())),
        };
        if let Err(reason) = initialized {
            error!("Plugin '{}' failed to initialize: {}", name, reason);
            self.mark_failed(plugins, &name, replacing, &reason);
            return Err(RegistrationError::InitializationFailed { plugin: name, reason });
        }

        let version = descriptor.version.clone();
        let intents: Vec<String> = descriptor
            .declared_intents()
            .into_iter()
            .map(str::to_string)
            .collect();
        if let Err(e) = self.registry.register(descriptor) {
            error!("Plugin '{}' rejected by registry: {}", name, e);
            if let Err(shutdown_err) = plugin.shutdown().await {
                warn!("Plugin '{}' shutdown failed: {}", name, shutdown_err);
            }
            self.mark_failed(plugins, &name, replacing, &e.to_string());
            return Err(e);
        }

        let previous = plugins.insert(
            name.clone(),
            PluginSlot {
                plugin: plugin.clone(),
                status: PluginStatus::Loaded,
                last_error: None,
                source,
            },
        );
        if let Some(old) = previous {
            if !Arc::ptr_eq(&old.plugin, &plugin) && old.status != PluginStatus::Loading {
                if let Err(e) = old.plugin.shutdown().await {
                    warn!("Replaced plugin '{}' shutdown failed: {}", name, e);
                }
            }
        }

        info!("Plugin '{}' v{} loaded ({} intents)", name, version, intents.len());
        self.emit(
            topics::PLUGIN_REGISTERED,
            json!({ "plugin": name, "version": version, "intents": intents, "replaced": replacing }),
        );
        Ok(())
    }

    /// A fresh plugin that fails stays listed with status `Error`; a failed
    /// replacement leaves the running instance untouched.
    fn mark_failed(
        &self,
        plugins: &mut BTreeMap<String, PluginSlot>,
        name: &str,
        replacing: bool,
        reason: &str,
    ) {
        if replacing {
            if let Some(slot) = plugins.get_mut(name) {
                slot.last_error = Some(reason.to_string());
            }
        } else if let Some(slot) = plugins.get_mut(name) {
            slot.status = PluginStatus::Error;
            slot.last_error = Some(reason.to_string());
        }
    }

    /// Deregister and shut down `name`.
    #[instrument(skip(self))]
    pub async fn unload_plugin(&self, name: &str) -> Result<(), NotFoundError> {
        let mut plugins = self.plugins.lock().await;
        let slot = plugins
            .remove(name)
            .ok_or_else(|| NotFoundError::Plugin(name.to_string()))?;

        if self.registry.contains(name) {
            self.registry.deregister(name)?;
        }
        if matches!(slot.status, PluginStatus::Loaded | PluginStatus::Disabled) {
            if let Err(e) = slot.plugin.shutdown().await {
                warn!("Plugin '{}' shutdown failed: {}", name, e);
            }
        }

        info!("Plugin '{}' unloaded", name);
        self.emit(
            topics::PLUGIN_DEREGISTERED,
            json!({ "plugin": name, "reason": "unloaded" }),
        );
        Ok(())
    }

    /// Remove `name`'s bindings while keeping the instance alive.
    #[instrument(skip(self))]
    pub async fn disable_plugin(&self, name: &str) -> Result<()> {
        let mut plugins = self.plugins.lock().await;
        let slot = plugins
            .get_mut(name)
            .ok_or_else(|| NotFoundError::Plugin(name.to_string()))?;
        match slot.status {
            PluginStatus::Disabled => return Ok(()),
            PluginStatus::Loaded => {}
            other => return Err(anyhow!("plugin '{}' is {} and cannot be disabled", name, other)),
        }

        self.registry.deregister(name)?;
        slot.status = PluginStatus::Disabled;
        info!("Plugin '{}' disabled", name);
        self.emit(
            topics::PLUGIN_DEREGISTERED,
            json!({ "plugin": name, "reason": "disabled" }),
        );
        Ok(())
    }

    /// Re-register a disabled plugin.
    #[instrument(skip(self))]
    pub async fn enable_plugin(&self, name: &str) -> Result<()> {
        let mut plugins = self.plugins.lock().await;
        let slot = plugins
            .get_mut(name)
            .ok_or_else(|| NotFoundError::Plugin(name.to_string()))?;
        match slot.status {
            PluginStatus::Loaded => return Ok(()),
            PluginStatus::Disabled => {}
            other => return Err(anyhow!("plugin '{}' is {} and cannot be enabled", name, other)),
        }

        let descriptor = slot.plugin.descriptor();
        let intents = descriptor.declared_intents().len();
        let version = descriptor.version.clone();
        self.registry.register(descriptor)?;
        slot.status = PluginStatus::Loaded;
        slot.last_error = None;
        info!("Plugin '{}' enabled", name);
        self.emit(
            topics::PLUGIN_REGISTERED,
            json!({ "plugin": name, "version": version, "intents": intents, "replaced": false }),
        );
        Ok(())
    }

    pub async fn plugin_info(&self) -> Vec<PluginInfo> {
        self.plugins.lock().await.values().map(PluginSlot::info).collect()
    }

    pub async fn plugin_status(&self, name: &str) -> Option<PluginStatus> {
        self.plugins.lock().await.get(name).map(|s| s.status)
    }

    /* -------------------------- native plugins -------------------------- */

    /// Verify, open and install the plugin in `path`; returns its name.
    #[instrument(skip(self))]
    pub async fn load_native(&self, path: &Path) -> Result<String> {
        let security = PluginSecurityConfig::from_plugin_config(&self.settings.plugins);
        // SAFETY: only libraries that pass the path and hash checks are opened.
        let loaded = unsafe { NativePlugin::load(path, &security)?.instantiate()? };
        // The plugin's vtable lives in the library; keep it mapped for good.
        self.libraries.lock().push(loaded.library.clone());

        let name = loaded.plugin.name().to_string();
        let mut plugins = self.plugins.lock().await;
        self.install(&mut plugins, loaded.plugin, Some(path.to_path_buf()))
            .await
            .with_context(|| format!("Failed to install plugin from {:?}", path))?;
        info!(
            "Native plugin '{}' installed (hash: {})",
            name,
            &loaded.metadata.hash[..16]
        );
        Ok(name)
    }

    /// Load every library in the configured plugin directory. Failures are
    /// logged and skipped; returns how many loaded.
    pub async fn autoload_plugins(&self) -> Result<usize> {
        let security = PluginSecurityConfig::from_plugin_config(&self.settings.plugins);
        let candidates = loader::discover(&self.settings.plugins.directory, &security)?;
        let mut loaded = 0;
        for path in candidates {
            match self.load_native(&path).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Skipping plugin {:?}: {:#}", path, e),
            }
        }
        info!("Autoloaded {} native plugin(s)", loaded);
        Ok(loaded)
    }

    /// Watch the plugin directory and reload changed libraries.
    pub fn start_hot_reload(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::channel(16);
        let security = PluginSecurityConfig::from_plugin_config(&self.settings.plugins);
        let dir = self.settings.plugins.directory.clone();

        let watcher = tokio::spawn(async move {
            if let Err(e) = hot_reload::watch(dir, tx, security).await {
                error!("Plugin hot-reload watcher failed: {}", e);
            }
        });

        let weak = Arc::downgrade(self);
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.handle_plugin_event(event).await;
            }
        });

        self.background.lock().extend([watcher, consumer]);
    }

    async fn handle_plugin_event(&self, event: PluginEvent) {
        match event {
            PluginEvent::Reload(path) => {
                info!("Processing plugin reload: {:?}", path);
                if let Err(e) = self.load_native(&path).await {
                    error!("Failed to reload plugin from {:?}: {:#}", path, e);
                }
            }
            PluginEvent::Removed(path) => {
                let name = self
                    .plugins
                    .lock()
                    .await
                    .iter()
                    .find(|(_, slot)| slot.source.as_deref() == Some(path.as_path()))
                    .map(|(name, _)| name.clone());
                if let Some(name) = name {
                    if let Err(e) = self.unload_plugin(&name).await {
                        warn!("Failed to unload removed plugin '{}': {}", name, e);
                    }
                }
            }
            PluginEvent::SecurityViolation(msg) => {
                warn!("Plugin security violation: {}", msg);
            }
        }
    }

    /* ------------------------------ teardown ---------------------------- */

    /// Shut down plugins, stop publishes and storage writes, flush
    /// persistence.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Shutting down orchestrator '{}'", self.settings.agent.name);

        let mut plugins = self.plugins.lock().await;
        for (name, slot) in plugins.iter_mut() {
            if self.registry.contains(name) {
                if let Err(e) = self.registry.deregister(name) {
                    warn!("Plugin '{}' deregister failed during shutdown: {}", name, e);
                }
            }
            if matches!(slot.status, PluginStatus::Loaded | PluginStatus::Disabled) {
                if let Err(e) = slot.plugin.shutdown().await {
                    warn!("Plugin '{}' shutdown failed: {}", name, e);
                }
            }
            slot.status = PluginStatus::Unloaded;
        }
        drop(plugins);

        self.events.close();
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.store.close()?;
        if let Some(p) = &self.persistence {
            p.flush()?;
        }
        Ok(())
    }
}

fn failure_message(error: &DispatchError) -> String {
    match error {
        DispatchError::UnroutableIntent { intent } => {
            format!("I don't know how to help with '{}' yet.", intent.replace('_', " "))
        }
        DispatchError::PermissionDenied { .. } => {
            "You don't have permission to do that.".to_string()
        }
        DispatchError::Timeout { .. } => "That took too long; I could not complete it.".to_string(),
        _ => "Something went wrong while handling your request. Please try again.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::plugin::{HandlerOutput, HandlerRequest, HandlerSpec, PluginContext, PluginDescriptor};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tracing_test::traced_test;

    struct Backup {
        shutdowns: Arc<AtomicUsize>,
        fail_init: bool,
    }

    #[async_trait]
    impl Plugin for Backup {
        fn name(&self) -> &str {
            "backup-tool"
        }

        fn descriptor(&self) -> PluginDescriptor {
            PluginDescriptor::new("backup-tool", "1.0.0").handler(
                HandlerSpec::new("run", "backup", |_r: HandlerRequest, _c: PluginContext| async {
                    Ok::<_, HandlerError>(HandlerOutput::message("backed up"))
                })
                .requires("file_read"),
            )
        }

        async fn initialize(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("disk not mounted");
            }
            Ok(())
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn backup(fail_init: bool) -> (Arc<Backup>, Arc<AtomicUsize>) {
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let plugin = Arc::new(Backup {
            shutdowns: shutdowns.clone(),
            fail_init,
        });
        (plugin, shutdowns)
    }

    /// Default rules plus a `backup` intent that only test plugins serve.
    async fn orchestrator() -> Orchestrator {
        let resolver = KeywordIntentResolver::default().with_rule("backup", &["backup", "back up"]);
        Orchestrator::builder(Settings::default())
            .resolver(Arc::new(resolver))
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_greeting_is_served_by_builtin() {
        let orch = orchestrator().await;
        let response = orch.handle_request("u1", "hello there").await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.plugin.as_deref(), Some("conversation"));
        assert_eq!(orch.context().get_context("u1").await.history.len(), 1);
    }

    #[tokio::test]
    async fn test_system_info_is_served_by_builtin() {
        let orch = orchestrator().await;
        let response = orch.handle_request("u1", "show system info").await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.intent.as_deref(), Some("system_control"));
        assert_eq!(response.plugin.as_deref(), Some("system"));
        assert!(response.data["system_info"]["cpus"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_unroutable_intent_yields_structured_failure() {
        let orch = orchestrator().await;
        let response = orch.handle_request("u1", "please backup my photos").await;
        assert!(!response.success);
        assert_eq!(response.intent.as_deref(), Some("backup"));
        assert_eq!(response.error.unwrap().kind, "unroutable_intent");
        assert!(orch.context().get_context("u1").await.history.is_empty());
    }

    #[tokio::test]
    async fn test_default_user_grants_authorize_first_request() {
        let orch = orchestrator().await;
        let (plugin, _) = backup(false);
        orch.load_plugin(plugin).await.unwrap();

        let response = orch.handle_request("u2", "backup please").await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.message, "backed up");
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_error_status() {
        let orch = orchestrator().await;
        let (plugin, _) = backup(true);
        let err = orch.load_plugin(plugin).await.unwrap_err();
        assert!(matches!(err, RegistrationError::InitializationFailed { .. }));
        assert_eq!(orch.plugin_status("backup-tool").await, Some(PluginStatus::Error));
        assert!(!orch.registry().contains("backup-tool"));
    }

    #[tokio::test]
    async fn test_disable_and_enable_toggle_bindings() {
        let orch = orchestrator().await;
        let (plugin, shutdowns) = backup(false);
        orch.load_plugin(plugin).await.unwrap();

        orch.disable_plugin("backup-tool").await.unwrap();
        assert!(orch.registry().handlers_for("backup").is_empty());
        assert_eq!(orch.plugin_status("backup-tool").await, Some(PluginStatus::Disabled));

        orch.enable_plugin("backup-tool").await.unwrap();
        assert_eq!(orch.registry().handlers_for("backup").len(), 1);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);

        orch.unload_plugin("backup-tool").await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(orch.plugin_status("backup-tool").await.is_none());
    }

    #[tokio::test]
    async fn test_reload_replaces_and_shuts_down_previous() {
        let orch = orchestrator().await;
        let (first, first_shutdowns) = backup(false);
        let (second, _) = backup(false);
        orch.load_plugin(first).await.unwrap();
        orch.load_plugin(second).await.unwrap();

        assert_eq!(first_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(orch.registry().handlers_for("backup").len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let orch = orchestrator().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        orch.events()
            .subscribe(
                topics::PLUGIN_REGISTERED,
                Arc::new(move |_e: Arc<crate::event_bus::EventRecord>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, anyhow::Error>(())
                    }
                }),
                "test",
            )
            .unwrap();

        let (plugin, _) = backup(false);
        orch.load_plugin(plugin).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_shutdown_deregisters_loaded_and_skips_disabled() {
        let orch = orchestrator().await;
        let (plugin, shutdowns) = backup(false);
        orch.load_plugin(plugin).await.unwrap();
        orch.disable_plugin("backup-tool").await.unwrap();

        orch.shutdown().await.unwrap();
        assert!(orch.registry().is_empty());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!logs_contain("deregister failed"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_requests() {
        let orch = orchestrator().await;
        let (plugin, shutdowns) = backup(false);
        orch.load_plugin(plugin).await.unwrap();

        orch.shutdown().await.unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(orch.events().is_closed());
        assert!(orch.store().is_closed());

        let response = orch.handle_request("u1", "hello").await;
        assert_eq!(response.error.unwrap().kind, "shutting_down");
    }
}
