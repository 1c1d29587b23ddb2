//! Plugin interface: descriptors, handler tables and the context handed to
//! handlers at invocation time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::ai::AiProvider;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, EventBusError, HandlerError, ProviderError};
use crate::event_bus::EventBus;
use crate::intent::Intent;
use crate::permissions::{Permission, Subject};
use crate::storage::PluginStorage;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Input to a handler. `intent` is absent for direct plugin-to-plugin calls.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HandlerRequest {
    pub intent: Option<Intent>,
    pub data: Value,
}

impl HandlerRequest {
    pub fn from_intent(intent: Intent) -> Self {
        Self {
            intent: Some(intent),
            data: Value::Null,
        }
    }

    pub fn direct(data: Value) -> Self {
        Self { intent: None, data }
    }

    pub fn intent(&self) -> Option<&Intent> {
        self.intent.as_ref()
    }

    /// Look a parameter up in `data` first, then in the intent's entities.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.data
            .get(key)
            .or_else(|| self.intent.as_ref().and_then(|i| i.entity(key)))
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    /// Original request text, when the request came from an intent.
    pub fn text(&self) -> Option<&str> {
        self.intent
            .as_ref()
            .and_then(|i| i.context().get("original_text"))
            .and_then(Value::as_str)
    }
}

/// What a handler produced. `confidence` is the handler's own estimate and is
/// what low-confidence dispatch compares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub confidence: f32,
}

impl HandlerOutput {
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            data: data.into(),
            message: None,
            confidence: 1.0,
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::new(Value::Null).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        self
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(
        &self,
        request: HandlerRequest,
        ctx: PluginContext,
    ) -> Result<HandlerOutput, HandlerError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(HandlerRequest, PluginContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
{
    async fn call(
        &self,
        request: HandlerRequest,
        ctx: PluginContext,
    ) -> Result<HandlerOutput, HandlerError> {
        (self)(request, ctx).await
    }
}

/// One entry of a plugin's handler table.
#[derive(Clone)]
pub struct HandlerSpec {
    pub name: String,
    pub intent: String,
    pub priority: u8,
    pub permissions: Vec<Permission>,
    pub handler: Arc<dyn Handler>,
}

impl HandlerSpec {
    pub fn new(
        name: impl Into<String>,
        intent: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            intent: intent.into(),
            priority: DEFAULT_PRIORITY,
            permissions: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn requires(mut self, permission: impl Into<Permission>) -> Self {
        self.permissions.push(permission.into());
        self
    }
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSpec")
            .field("name", &self.name)
            .field("intent", &self.intent)
            .field("priority", &self.priority)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

/// Registration unit. Built explicitly with the builder methods:
///
/// ```ignore
/// PluginDescriptor::new("file-manager", "1.0.0")
///     .requires(Permission::new("file_read"))
///     .handler(HandlerSpec::new("list_files", "file_search", list_files).priority(5));
/// ```
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub requires_ai: bool,
    /// Permissions every handler of the plugin requires.
    pub required_permissions: Vec<Permission>,
    pub handlers: Vec<HandlerSpec>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            requires_ai: false,
            required_permissions: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    pub fn requires_ai(mut self, requires_ai: bool) -> Self {
        self.requires_ai = requires_ai;
        self
    }

    pub fn requires(mut self, permission: impl Into<Permission>) -> Self {
        self.required_permissions.push(permission.into());
        self
    }

    pub fn handler(mut self, spec: HandlerSpec) -> Self {
        self.handlers.push(spec);
        self
    }

    /// Distinct intents in declaration order.
    pub fn declared_intents(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for h in &self.handlers {
            if !out.contains(&h.intent.as_str()) {
                out.push(&h.intent);
            }
        }
        out
    }

    /// Highest priority this plugin declares for `intent`.
    pub fn priority_for(&self, intent: &str) -> Option<u8> {
        self.handlers
            .iter()
            .filter(|h| h.intent == intent)
            .map(|h| h.priority)
            .max()
    }
}

/// A loadable plugin: a descriptor plus lifecycle hooks.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn descriptor(&self) -> PluginDescriptor;

    async fn initialize(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Unloaded,
    Loading,
    Loaded,
    Error,
    Disabled,
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginStatus::Unloaded => "unloaded",
            PluginStatus::Loading => "loading",
            PluginStatus::Loaded => "loaded",
            PluginStatus::Error => "error",
            PluginStatus::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub status: PluginStatus,
    pub requires_ai: bool,
    pub intents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Everything a handler may touch: its own storage namespace, the event bus,
/// the AI provider, and other plugins through [`PluginContext::call_plugin`].
#[derive(Clone)]
pub struct PluginContext {
    plugin_name: String,
    storage: PluginStorage,
    events: EventBus,
    ai: Option<Arc<dyn AiProvider>>,
    dispatcher: Dispatcher,
    call_depth: usize,
    on_behalf_of: Option<Subject>,
}

impl PluginContext {
    pub(crate) fn new(
        plugin_name: String,
        storage: PluginStorage,
        events: EventBus,
        ai: Option<Arc<dyn AiProvider>>,
        dispatcher: Dispatcher,
        call_depth: usize,
        on_behalf_of: Option<Subject>,
    ) -> Self {
        Self {
            plugin_name,
            storage,
            events,
            ai,
            dispatcher,
            call_depth,
            on_behalf_of,
        }
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn storage(&self) -> &PluginStorage {
        &self.storage
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn ai(&self) -> Option<&Arc<dyn AiProvider>> {
        self.ai.as_ref()
    }

    /// The AI provider, or `ProviderError::Unavailable` when none is configured.
    pub fn require_ai(&self) -> Result<&Arc<dyn AiProvider>, HandlerError> {
        self.ai.as_ref().ok_or_else(|| {
            HandlerError::Provider(ProviderError::Unavailable(
                "no AI provider configured".into(),
            ))
        })
    }

    /// Number of plugin-to-plugin hops that led to this invocation.
    pub fn call_depth(&self) -> usize {
        self.call_depth
    }

    /// The subject whose request started the chain, if any.
    pub fn on_behalf_of(&self) -> Option<&Subject> {
        self.on_behalf_of.as_ref()
    }

    /// Publish with this plugin as the event source.
    pub fn publish(&self, topic: &str, payload: Value) -> Result<usize, EventBusError> {
        self.events.publish(topic, payload, &self.plugin_name)
    }

    /// Invoke a specific handler of another plugin, authorized against this
    /// plugin's own grants.
    pub async fn call_plugin(
        &self,
        plugin: &str,
        handler: &str,
        data: Value,
    ) -> Result<HandlerOutput, DispatchError> {
        self.dispatcher
            .call_plugin(self, plugin, handler, data)
            .await
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_name", &self.plugin_name)
            .field("call_depth", &self.call_depth)
            .field("on_behalf_of", &self.on_behalf_of)
            .field("has_ai", &self.ai.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn noop(_r: HandlerRequest, _c: PluginContext) -> Result<HandlerOutput, HandlerError> {
        Ok(HandlerOutput::new(Value::Null))
    }

    #[test]
    fn test_descriptor_builder_collects_intents() {
        let d = PluginDescriptor::new("files", "1.0.0")
            .requires("file_read")
            .handler(HandlerSpec::new("list", "file_search", noop).priority(5))
            .handler(HandlerSpec::new("find", "file_search", noop).priority(7))
            .handler(HandlerSpec::new("mkdir", "file_management", noop));

        assert_eq!(d.declared_intents(), vec!["file_search", "file_management"]);
        assert_eq!(d.priority_for("file_search"), Some(7));
        assert_eq!(d.priority_for("file_management"), Some(DEFAULT_PRIORITY));
        assert_eq!(d.priority_for("weather"), None);
        assert_eq!(d.required_permissions, vec![Permission::new("file_read")]);
    }

    #[test]
    fn test_request_params_prefer_data_over_entities() {
        let intent = Intent::new("calculation", 0.9)
            .with_entity("expression", "1 + 1")
            .with_context("original_text", "what is 1 + 1");
        let mut request = HandlerRequest::from_intent(intent);
        assert_eq!(request.param_str("expression"), Some("1 + 1"));
        assert_eq!(request.text(), Some("what is 1 + 1"));

        request.data = json!({ "expression": "2 * 3" });
        assert_eq!(request.param_str("expression"), Some("2 * 3"));
    }

    #[test]
    fn test_output_confidence_is_clamped() {
        assert_eq!(HandlerOutput::new(1).with_confidence(3.0).confidence, 1.0);
        assert_eq!(HandlerOutput::message("hi").confidence, 1.0);
    }
}
