//! Built-in plugins: small talk (greeting, help, status, time/date) and
//! host system information.

use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::info;

use crate::error::HandlerError;
use crate::plugin::{
    HandlerOutput, HandlerRequest, HandlerSpec, Plugin, PluginContext, PluginDescriptor,
};
use crate::registry::PluginRegistry;

pub const CONVERSATION_PLUGIN: &str = "conversation";
pub const SYSTEM_PLUGIN: &str = "system";

/// Handles small talk. Reads the registry to describe what is available; the
/// registry is held weakly since it owns this plugin's bindings.
pub struct ConversationPlugin {
    agent_name: String,
    registry: Weak<PluginRegistry>,
    started: Instant,
}

impl ConversationPlugin {
    pub fn new(agent_name: impl Into<String>, registry: &Arc<PluginRegistry>) -> Self {
        Self {
            agent_name: agent_name.into(),
            registry: Arc::downgrade(registry),
            started: Instant::now(),
        }
    }
}

fn upgrade(registry: &Weak<PluginRegistry>) -> Result<Arc<PluginRegistry>, HandlerError> {
    registry
        .upgrade()
        .ok_or_else(|| HandlerError::failed("plugin registry is gone"))
}

fn greeting(agent_name: &str) -> HandlerOutput {
    HandlerOutput::new(json!({ "intent": "greeting" })).with_message(format!(
        "Hello! I'm {agent_name}, your assistant. I can help with calculations, files and more."
    ))
}

fn help(registry: &PluginRegistry) -> HandlerOutput {
    let snapshot = registry.snapshot();
    let intents = snapshot.intents();
    let mut lines = vec!["I can help you with:".to_string()];
    for intent in &intents {
        let handlers: Vec<String> = snapshot
            .handlers_for(intent)
            .iter()
            .map(|b| b.plugin.clone())
            .collect();
        lines.push(format!("  - {} ({})", intent.replace('_', " "), handlers.join(", ")));
    }
    lines.push("Just ask me naturally, for example 'calculate 25 times 4'.".to_string());
    HandlerOutput::new(json!({ "intent": "help", "intents": intents })).with_message(lines.join("\n"))
}

fn status(registry: &PluginRegistry, uptime_secs: u64) -> HandlerOutput {
    let plugins = registry.plugins();
    HandlerOutput::new(json!({
        "intent": "status",
        "plugins": plugins,
        "uptime_seconds": uptime_secs,
    }))
    .with_message(format!(
        "I'm running smoothly with {} plugin(s) loaded (up {}s).",
        plugins.len(),
        uptime_secs
    ))
}

fn time_date() -> HandlerOutput {
    let now = chrono::Utc::now();
    HandlerOutput::new(json!({ "intent": "time_date", "now": now.to_rfc3339() }))
        .with_message(format!("Current time: {}", now.format("%Y-%m-%d %H:%M:%S UTC")))
}

#[async_trait]
impl Plugin for ConversationPlugin {
    fn name(&self) -> &str {
        CONVERSATION_PLUGIN
    }

    fn descriptor(&self) -> PluginDescriptor {
        let agent_name = self.agent_name.clone();
        let help_registry = self.registry.clone();
        let status_registry = self.registry.clone();
        let started = self.started;

        PluginDescriptor::new(CONVERSATION_PLUGIN, env!("CARGO_PKG_VERSION"))
            .description("Handles conversational interactions")
            .author("assistant core")
            .handler(HandlerSpec::new(
                "greet",
                "greeting",
                move |_r: HandlerRequest, _c: PluginContext| {
                    let out = greeting(&agent_name);
                    async move { Ok::<_, HandlerError>(out) }
                },
            ))
            .handler(HandlerSpec::new(
                "help",
                "help",
                move |_r: HandlerRequest, _c: PluginContext| {
                    let out = upgrade(&help_registry).map(|r| help(&r));
                    async move { out }
                },
            ))
            .handler(HandlerSpec::new(
                "status",
                "status",
                move |_r: HandlerRequest, _c: PluginContext| {
                    let out = upgrade(&status_registry)
                        .map(|r| status(&r, started.elapsed().as_secs()));
                    async move { out }
                },
            ))
            .handler(
                HandlerSpec::new(
                    "time_date",
                    "time_date",
                    |_r: HandlerRequest, _c: PluginContext| async {
                        Ok::<_, HandlerError>(time_date())
                    },
                )
                .priority(3),
            )
    }

    async fn initialize(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        info!("Conversation plugin initialized");
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        info!("Conversation plugin shutdown");
        Ok(())
    }
}

fn system_info(plugin_count: usize, uptime_secs: u64) -> HandlerOutput {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let info = json!({
        "os": std::env::consts::OS,
        "family": std::env::consts::FAMILY,
        "arch": std::env::consts::ARCH,
        "cpus": cpus,
        "pid": std::process::id(),
        "plugins": plugin_count,
        "uptime_seconds": uptime_secs,
    });
    HandlerOutput::new(json!({ "system_info": info })).with_message(format!(
        "Here's your system information: {} ({}) with {} CPU(s), {} plugin(s) loaded.",
        std::env::consts::OS,
        std::env::consts::ARCH,
        cpus,
        plugin_count
    ))
}

/// Reports host and process information for `system_control` requests.
pub struct SystemPlugin {
    registry: Weak<PluginRegistry>,
    started: Instant,
}

impl SystemPlugin {
    pub fn new(registry: &Arc<PluginRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Plugin for SystemPlugin {
    fn name(&self) -> &str {
        SYSTEM_PLUGIN
    }

    fn descriptor(&self) -> PluginDescriptor {
        let registry = self.registry.clone();
        let started = self.started;

        PluginDescriptor::new(SYSTEM_PLUGIN, env!("CARGO_PKG_VERSION"))
            .description("Reports system information")
            .author("assistant core")
            .handler(HandlerSpec::new(
                "system_info",
                "system_control",
                move |_r: HandlerRequest, _c: PluginContext| {
                    let out = upgrade(&registry)
                        .map(|r| system_info(r.len(), started.elapsed().as_secs()));
                    async move { out }
                },
            ))
    }

    async fn initialize(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        info!("System plugin initialized");
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        info!("System plugin shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_covers_small_talk() {
        let registry = Arc::new(PluginRegistry::new());
        let plugin = ConversationPlugin::new("Nova", &registry);
        let d = plugin.descriptor();
        assert_eq!(
            d.declared_intents(),
            vec!["greeting", "help", "status", "time_date"]
        );
        registry.register(d).unwrap();
        assert_eq!(registry.plugins(), vec![CONVERSATION_PLUGIN.to_string()]);
    }

    #[test]
    fn test_help_lists_registered_intents() {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .register(ConversationPlugin::new("Nova", &registry).descriptor())
            .unwrap();
        let out = help(&registry);
        let message = out.message.unwrap();
        assert!(message.contains("time date (conversation)"));
        assert_eq!(out.data["intents"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_greeting_uses_agent_name() {
        assert!(greeting("Nova").message.unwrap().contains("Nova"));
    }

    #[test]
    fn test_system_info_reports_host() {
        let out = system_info(3, 12);
        let info = &out.data["system_info"];
        assert_eq!(info["os"], std::env::consts::OS);
        assert_eq!(info["plugins"], 3);
        assert!(info["cpus"].as_u64().unwrap() >= 1);
        assert!(out.message.unwrap().contains("3 plugin(s)"));
    }

    #[test]
    fn test_system_plugin_handles_system_control() {
        let registry = Arc::new(PluginRegistry::new());
        let d = SystemPlugin::new(&registry).descriptor();
        assert_eq!(d.declared_intents(), vec!["system_control"]);
    }
}
