//! Intent dispatch: candidate selection, permission gating, invocation with
//! timeouts and fallthrough, and plugin-to-plugin calls.

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::ai::AiProvider;
use crate::error::{DispatchError, HandlerError};
use crate::event_bus::EventBus;
use crate::intent::Intent;
use crate::monitoring::MonitoringSystem;
use crate::permissions::{PermissionGate, Subject};
use crate::plugin::{HandlerOutput, HandlerRequest, PluginContext};
use crate::registry::{HandlerBinding, PluginRegistry};
use crate::settings::{DispatchConfig, MAX_PROVIDER_RETRIES};
use crate::storage::KeyedExpiringStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    PermissionDenied,
    Failed { error: String },
    TimedOut { timeout_ms: u64 },
    /// Succeeded, but lost the low-confidence comparison.
    Discarded,
}

/// One entry of the per-dispatch attempt log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub plugin: String,
    pub handler: String,
    pub priority: u8,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    /// Invocations made, including provider-error retries.
    pub tries: u32,
    pub elapsed_ms: u64,
}

impl AttemptRecord {
    fn new(binding: &HandlerBinding, outcome: AttemptOutcome, tries: u32, elapsed: Duration) -> Self {
        Self {
            plugin: binding.plugin.clone(),
            handler: binding.handler.clone(),
            priority: binding.priority,
            outcome,
            tries,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub intent: String,
    pub binding: HandlerBinding,
    pub output: HandlerOutput,
    pub attempts: Vec<AttemptRecord>,
    pub low_confidence: bool,
    pub elapsed_ms: u64,
}

enum InvokeError {
    TimedOut,
    Handler(HandlerError),
}

struct Invocation {
    result: Result<HandlerOutput, InvokeError>,
    tries: u32,
    elapsed: Duration,
}

struct Inner {
    registry: Arc<PluginRegistry>,
    gate: Arc<PermissionGate>,
    store: Arc<KeyedExpiringStore>,
    events: EventBus,
    ai: Option<Arc<dyn AiProvider>>,
    monitor: Arc<MonitoringSystem>,
    config: DispatchConfig,
}

/// Cheap to clone; every clone shares the same registry, gate and store.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PluginRegistry>,
        gate: Arc<PermissionGate>,
        store: Arc<KeyedExpiringStore>,
        events: EventBus,
        ai: Option<Arc<dyn AiProvider>>,
        monitor: Arc<MonitoringSystem>,
        mut config: DispatchConfig,
    ) -> Self {
        if config.provider_retries > MAX_PROVIDER_RETRIES {
            warn!(
                "Clamping provider_retries {} to {}",
                config.provider_retries, MAX_PROVIDER_RETRIES
            );
            config.provider_retries = MAX_PROVIDER_RETRIES;
        }
        Self {
            inner: Arc::new(Inner {
                registry,
                gate,
                store,
                events,
                ai,
                monitor,
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.inner.registry
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.inner.gate
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    /// Context for `plugin` outside of any call chain. AI access follows the
    /// registered descriptor; unknown plugins get none.
    pub fn context_for(&self, plugin: &str) -> PluginContext {
        let requires_ai = self
            .inner
            .registry
            .descriptor(plugin)
            .is_some_and(|d| d.requires_ai);
        self.context(plugin, requires_ai, 0, None)
    }

    /// Context handed to lifecycle hooks, before the descriptor is registered.
    pub(crate) fn lifecycle_context(&self, plugin: &str, requires_ai: bool) -> PluginContext {
        self.context(plugin, requires_ai, 0, None)
    }

    fn context(
        &self,
        plugin: &str,
        requires_ai: bool,
        depth: usize,
        on_behalf_of: Option<Subject>,
    ) -> PluginContext {
        let ai = if requires_ai { self.inner.ai.clone() } else { None };
        PluginContext::new(
            plugin.to_string(),
            self.inner.store.facade(plugin),
            self.inner.events.clone(),
            ai,
            self.clone(),
            depth,
            on_behalf_of,
        )
    }

    /// Route `intent` to the best authorized handler, bounded by the
    /// dispatch timeout.
    #[instrument(skip(self, intent, caller), fields(intent = %intent.kind(), caller = %caller))]
    pub async fn dispatch(
        &self,
        intent: &Intent,
        caller: &Subject,
    ) -> Result<DispatchResult, DispatchError> {
        let timeout = self.inner.config.dispatch_timeout();
        match tokio::time::timeout(timeout, self.dispatch_inner(intent, caller)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Dispatch exceeded {}ms", timeout.as_millis());
                Err(DispatchError::Timeout {
                    intent: intent.kind().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn dispatch_inner(
        &self,
        intent: &Intent,
        caller: &Subject,
    ) -> Result<DispatchResult, DispatchError> {
        let started = Instant::now();
        let kind = intent.kind().to_string();

        // one snapshot for the whole dispatch
        let bindings = self.inner.registry.snapshot().handlers_for(&kind).to_vec();
        if bindings.is_empty() {
            debug!("No bindings registered");
            return Err(DispatchError::UnroutableIntent { intent: kind });
        }

        let mut attempts = Vec::with_capacity(bindings.len());
        let mut authorized = Vec::with_capacity(bindings.len());
        for binding in bindings {
            if self.inner.gate.authorize(caller, &binding.permissions) {
                authorized.push(binding);
            } else {
                debug!(handler = %binding.qualified_name(), "Skipping unauthorized handler");
                self.inner.monitor.record_attempt(
                    &binding.plugin,
                    &AttemptOutcome::PermissionDenied,
                    Duration::ZERO,
                );
                attempts.push(AttemptRecord::new(
                    &binding,
                    AttemptOutcome::PermissionDenied,
                    0,
                    Duration::ZERO,
                ));
            }
        }

        let low_confidence = intent.is_low_confidence(self.inner.config.confidence_threshold);
        let request = HandlerRequest::from_intent(intent.clone());
        let mut remaining = authorized.as_slice();

        if low_confidence && remaining.len() >= 2 {
            let (first, second) = (&remaining[0], &remaining[1]);
            remaining = &remaining[2..];
            debug!(
                first = %first.qualified_name(),
                second = %second.qualified_name(),
                "Low-confidence intent, comparing top two handlers"
            );

            let (a, b) = futures::join!(
                self.invoke(first, request.clone(), self.context(&first.plugin, first.requires_ai, 0, Some(caller.clone()))),
                self.invoke(second, request.clone(), self.context(&second.plugin, second.requires_ai, 0, Some(caller.clone()))),
            );

            match (a.result, b.result) {
                (Ok(out_a), Ok(out_b)) => {
                    // ties favor the higher-ranked binding
                    let (winner, w_out, w_inv, loser, l_inv) = if out_b.confidence > out_a.confidence {
                        (second, out_b, (b.tries, b.elapsed), first, (a.tries, a.elapsed))
                    } else {
                        (first, out_a, (a.tries, a.elapsed), second, (b.tries, b.elapsed))
                    };
                    self.record(&mut attempts, winner, AttemptOutcome::Succeeded, w_inv.0, w_inv.1);
                    self.record(&mut attempts, loser, AttemptOutcome::Discarded, l_inv.0, l_inv.1);
                    return Ok(self.finish(kind, winner, w_out, attempts, true, started));
                }
                (Ok(out), Err(e)) => {
                    self.record(&mut attempts, first, AttemptOutcome::Succeeded, a.tries, a.elapsed);
                    self.record_failure(&mut attempts, second, e, b.tries, b.elapsed);
                    return Ok(self.finish(kind, first, out, attempts, true, started));
                }
                (Err(e), Ok(out)) => {
                    self.record_failure(&mut attempts, first, e, a.tries, a.elapsed);
                    self.record(&mut attempts, second, AttemptOutcome::Succeeded, b.tries, b.elapsed);
                    return Ok(self.finish(kind, second, out, attempts, true, started));
                }
                (Err(ea), Err(eb)) => {
                    self.record_failure(&mut attempts, first, ea, a.tries, a.elapsed);
                    self.record_failure(&mut attempts, second, eb, b.tries, b.elapsed);
                }
            }
        }

        for binding in remaining {
            let inv = self
                .invoke(binding, request.clone(), self.context(&binding.plugin, binding.requires_ai, 0, Some(caller.clone())))
                .await;
            match inv.result {
                Ok(output) => {
                    self.record(&mut attempts, binding, AttemptOutcome::Succeeded, inv.tries, inv.elapsed);
                    return Ok(self.finish(kind, binding, output, attempts, low_confidence, started));
                }
                Err(e) => {
                    self.record_failure(&mut attempts, binding, e, inv.tries, inv.elapsed);
                }
            }
        }

        warn!("All {} candidate(s) exhausted", attempts.len());
        Err(DispatchError::NoHandlerAvailable {
            intent: kind,
            attempts,
        })
    }

    fn finish(
        &self,
        intent: String,
        binding: &HandlerBinding,
        output: HandlerOutput,
        attempts: Vec<AttemptRecord>,
        low_confidence: bool,
        started: Instant,
    ) -> DispatchResult {
        info!(
            handler = %binding.qualified_name(),
            attempts = attempts.len(),
            "Dispatch completed"
        );
        DispatchResult {
            intent,
            binding: binding.clone(),
            output,
            attempts,
            low_confidence,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn record(
        &self,
        attempts: &mut Vec<AttemptRecord>,
        binding: &HandlerBinding,
        outcome: AttemptOutcome,
        tries: u32,
        elapsed: Duration,
    ) {
        self.inner.monitor.record_attempt(&binding.plugin, &outcome, elapsed);
        attempts.push(AttemptRecord::new(binding, outcome, tries, elapsed));
    }

    fn record_failure(
        &self,
        attempts: &mut Vec<AttemptRecord>,
        binding: &HandlerBinding,
        error: InvokeError,
        tries: u32,
        elapsed: Duration,
    ) {
        let outcome = match error {
            InvokeError::TimedOut => {
                warn!(handler = %binding.qualified_name(), "Handler timed out, falling through");
                AttemptOutcome::TimedOut {
                    timeout_ms: self.inner.config.handler_timeout_ms,
                }
            }
            InvokeError::Handler(e) => {
                warn!(handler = %binding.qualified_name(), "Handler failed, falling through: {}", e);
                AttemptOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };
        self.record(attempts, binding, outcome, tries, elapsed);
    }

    /// Run one handler under the handler timeout, containing panics and
    /// retrying provider errors on the same binding.
    async fn invoke(
        &self,
        binding: &HandlerBinding,
        request: HandlerRequest,
        ctx: PluginContext,
    ) -> Invocation {
        let started = Instant::now();
        let timeout = self.inner.config.handler_timeout();
        let mut tries = 0u32;

        let result = loop {
            tries += 1;
            let call = binding.invoker.call(request.clone(), ctx.clone());
            match tokio::time::timeout(timeout, AssertUnwindSafe(call).catch_unwind()).await {
                Ok(Ok(Ok(output))) => break Ok(output),
                Ok(Ok(Err(e))) if e.is_provider() && tries <= self.inner.config.provider_retries => {
                    warn!(handler = %binding.qualified_name(), "Provider error, retrying: {}", e);
                }
                Ok(Ok(Err(e))) => break Err(InvokeError::Handler(e)),
                Ok(Err(_)) => {
                    break Err(InvokeError::Handler(HandlerError::failed("handler panicked")))
                }
                Err(_) => break Err(InvokeError::TimedOut),
            }
        };

        Invocation {
            result,
            tries,
            elapsed: started.elapsed(),
        }
    }

    /// Direct call from one plugin into a named handler of another.
    #[instrument(skip(self, caller, data), fields(caller = %caller.plugin_name(), depth = caller.call_depth() + 1))]
    pub(crate) async fn call_plugin(
        &self,
        caller: &PluginContext,
        plugin: &str,
        handler: &str,
        data: Value,
    ) -> Result<HandlerOutput, DispatchError> {
        let depth = caller.call_depth() + 1;
        let max = self.inner.config.max_call_depth;
        if depth > max {
            warn!("Plugin call chain too deep");
            return Err(DispatchError::CallDepthExceeded { depth, max });
        }

        let binding = self.inner.registry.snapshot().binding(plugin, handler)?.clone();

        let subject = Subject::plugin(caller.plugin_name());
        if !self.inner.gate.authorize(&subject, &binding.permissions) {
            self.inner.monitor.record_attempt(
                &binding.plugin,
                &AttemptOutcome::PermissionDenied,
                Duration::ZERO,
            );
            return Err(DispatchError::PermissionDenied {
                caller: subject.to_string(),
                plugin: plugin.to_string(),
                handler: handler.to_string(),
            });
        }

        let ctx = self.context(plugin, binding.requires_ai, depth, caller.on_behalf_of().cloned());
        let inv = self.invoke(&binding, HandlerRequest::direct(data), ctx).await;
        match inv.result {
            Ok(output) => {
                self.inner
                    .monitor
                    .record_attempt(plugin, &AttemptOutcome::Succeeded, inv.elapsed);
                Ok(output)
            }
            Err(InvokeError::TimedOut) => {
                let timeout_ms = self.inner.config.handler_timeout_ms;
                self.inner.monitor.record_attempt(
                    plugin,
                    &AttemptOutcome::TimedOut { timeout_ms },
                    inv.elapsed,
                );
                Err(DispatchError::HandlerTimeout {
                    plugin: plugin.to_string(),
                    handler: handler.to_string(),
                    timeout_ms,
                })
            }
            Err(InvokeError::Handler(e)) => {
                self.inner.monitor.record_attempt(
                    plugin,
                    &AttemptOutcome::Failed {
                        error: e.to_string(),
                    },
                    inv.elapsed,
                );
                Err(DispatchError::Handler {
                    plugin: plugin.to_string(),
                    handler: handler.to_string(),
                    source: Box::new(e),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::event_bus::TracingObserver;
    use crate::permissions::Permission;
    use crate::plugin::{HandlerSpec, PluginDescriptor};
    use crate::settings::EventsConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> DispatchConfig {
        DispatchConfig {
            confidence_threshold: 0.5,
            handler_timeout_ms: 50,
            dispatch_timeout_ms: 500,
            max_call_depth: 4,
            provider_retries: 1,
        }
    }

    fn dispatcher(config: DispatchConfig) -> Dispatcher {
        Dispatcher::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(PermissionGate::new()),
            Arc::new(KeyedExpiringStore::new()),
            EventBus::new(&EventsConfig::default(), Arc::new(TracingObserver)),
            None,
            Arc::new(MonitoringSystem::default()),
            config,
        )
    }

    fn replying(text: &'static str, confidence: f32) -> impl crate::plugin::Handler + 'static {
        move |_r: HandlerRequest, _c: PluginContext| async move {
            Ok(HandlerOutput::message(text).with_confidence(confidence))
        }
    }

    fn alice() -> Subject {
        Subject::user("alice")
    }

    #[tokio::test]
    async fn test_provider_error_is_retried_once_on_same_binding() {
        let d = dispatcher(config());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = move |_r: HandlerRequest, _c: PluginContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::Provider(ProviderError::Timeout))
                } else {
                    Ok(HandlerOutput::message("recovered"))
                }
            }
        };
        d.registry()
            .register(PluginDescriptor::new("ai", "1.0.0").handler(HandlerSpec::new("ask", "question", flaky)))
            .unwrap();

        let result = d.dispatch(&Intent::new("question", 0.9), &alice()).await.unwrap();
        assert_eq!(result.output.message.as_deref(), Some("recovered"));
        assert_eq!(result.attempts[0].tries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_provider_retries_are_clamped_to_one() {
        let d = dispatcher(DispatchConfig {
            provider_retries: 5,
            ..config()
        });
        assert_eq!(d.config().provider_retries, 1);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let failing = move |_r: HandlerRequest, _c: PluginContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<HandlerOutput, _>(HandlerError::Provider(ProviderError::Timeout)) }
        };
        d.registry()
            .register(PluginDescriptor::new("remote", "1.0.0").handler(HandlerSpec::new("ask", "question", failing)))
            .unwrap();

        let err = d.dispatch(&Intent::new("question", 0.9), &alice()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoHandlerAvailable { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_provider_error_falls_through() {
        let d = dispatcher(config());
        let failing = |_r: HandlerRequest, _c: PluginContext| async {
            Err::<HandlerOutput, _>(HandlerError::Provider(ProviderError::Quota("exhausted".into())))
        };
        d.registry()
            .register(
                PluginDescriptor::new("remote", "1.0.0")
                    .handler(HandlerSpec::new("ask", "question", failing).priority(9)),
            )
            .unwrap();
        d.registry()
            .register(
                PluginDescriptor::new("local", "1.0.0")
                    .handler(HandlerSpec::new("ask", "question", replying("local answer", 1.0)).priority(2)),
            )
            .unwrap();

        let result = d.dispatch(&Intent::new("question", 0.9), &alice()).await.unwrap();
        assert_eq!(result.binding.plugin, "local");
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.attempts[0].tries, 2);
        assert!(matches!(result.attempts[0].outcome, AttemptOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_failure() {
        let d = dispatcher(config());
        let panicking = |_r: HandlerRequest, _c: PluginContext| async {
            if true {
                panic!("plugin bug");
            }
            Ok::<_, HandlerError>(HandlerOutput::message("unreachable"))
        };
        d.registry()
            .register(
                PluginDescriptor::new("buggy", "1.0.0")
                    .handler(HandlerSpec::new("run", "backup", panicking).priority(9)),
            )
            .unwrap();
        d.registry()
            .register(
                PluginDescriptor::new("solid", "1.0.0")
                    .handler(HandlerSpec::new("run", "backup", replying("ok", 1.0))),
            )
            .unwrap();

        let result = d.dispatch(&Intent::new("backup", 0.9), &alice()).await.unwrap();
        assert_eq!(result.binding.plugin, "solid");
    }

    #[tokio::test]
    async fn test_low_confidence_picks_higher_reported_confidence() {
        let d = dispatcher(config());
        d.registry()
            .register(
                PluginDescriptor::new("first", "1.0.0")
                    .handler(HandlerSpec::new("h", "search", replying("first", 0.4)).priority(8)),
            )
            .unwrap();
        d.registry()
            .register(
                PluginDescriptor::new("second", "1.0.0")
                    .handler(HandlerSpec::new("h", "search", replying("second", 0.8)).priority(6)),
            )
            .unwrap();

        let result = d.dispatch(&Intent::new("search", 0.2), &alice()).await.unwrap();
        assert!(result.low_confidence);
        assert_eq!(result.binding.plugin, "second");
        assert_eq!(result.attempts[1].outcome, AttemptOutcome::Discarded);

        // high confidence only invokes the first
        let result = d.dispatch(&Intent::new("search", 0.9), &alice()).await.unwrap();
        assert_eq!(result.binding.plugin, "first");
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_low_confidence_tie_favors_higher_priority() {
        let d = dispatcher(config());
        d.registry()
            .register(
                PluginDescriptor::new("low", "1.0.0")
                    .handler(HandlerSpec::new("h", "search", replying("low", 0.7)).priority(3)),
            )
            .unwrap();
        d.registry()
            .register(
                PluginDescriptor::new("high", "1.0.0")
                    .handler(HandlerSpec::new("h", "search", replying("high", 0.7)).priority(7)),
            )
            .unwrap();

        let result = d.dispatch(&Intent::new("search", 0.1), &alice()).await.unwrap();
        assert_eq!(result.binding.plugin, "high");
    }

    #[tokio::test]
    async fn test_dispatch_timeout_bounds_the_whole_dispatch() {
        let mut cfg = config();
        cfg.handler_timeout_ms = 100;
        cfg.dispatch_timeout_ms = 150;
        let d = dispatcher(cfg);
        for name in ["a", "b", "c"] {
            let slow = |_r: HandlerRequest, _c: PluginContext| async {
                tokio::time::sleep(Duration::from_millis(90)).await;
                Err::<HandlerOutput, _>(HandlerError::failed("gave up"))
            };
            d.registry()
                .register(PluginDescriptor::new(name, "1.0.0").handler(HandlerSpec::new("h", "slow", slow)))
                .unwrap();
        }

        let err = d.dispatch(&Intent::new("slow", 0.9), &alice()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_call_plugin_checks_calling_plugin_grants() {
        let d = dispatcher(config());
        let caller_handler = |_r: HandlerRequest, ctx: PluginContext| async move {
            let out = ctx
                .call_plugin("vault", "read", serde_json::json!({ "key": "k" }))
                .await?;
            Ok::<_, HandlerError>(out)
        };
        d.registry()
            .register(
                PluginDescriptor::new("vault", "1.0.0")
                    .requires("secrets")
                    .handler(HandlerSpec::new("read", "vault_read", replying("secret", 1.0))),
            )
            .unwrap();
        d.registry()
            .register(PluginDescriptor::new("notes", "1.0.0").handler(HandlerSpec::new("h", "notes", caller_handler)))
            .unwrap();

        // the user holds the permission, the calling plugin does not
        d.gate().grant(alice(), Permission::new("secrets"));
        let err = d.dispatch(&Intent::new("notes", 0.9), &alice()).await.unwrap_err();
        match err {
            DispatchError::NoHandlerAvailable { attempts, .. } => {
                let AttemptOutcome::Failed { error } = &attempts[0].outcome else {
                    panic!("expected failure, got {:?}", attempts[0].outcome);
                };
                assert!(error.contains("plugin:notes"));
            }
            other => panic!("unexpected error {other:?}"),
        }

        d.gate().grant(Subject::plugin("notes"), Permission::new("secrets"));
        let result = d.dispatch(&Intent::new("notes", 0.9), &alice()).await.unwrap();
        assert_eq!(result.output.message.as_deref(), Some("secret"));
    }

    fn dispatcher_with_ai() -> Dispatcher {
        Dispatcher::new(
            Arc::new(PluginRegistry::new()),
            Arc::new(PermissionGate::new()),
            Arc::new(KeyedExpiringStore::new()),
            EventBus::new(&EventsConfig::default(), Arc::new(TracingObserver)),
            Some(Arc::new(crate::ai::HashingEmbedder::default())),
            Arc::new(MonitoringSystem::default()),
            config(),
        )
    }

    fn reports_ai(_r: HandlerRequest, c: PluginContext) -> std::future::Ready<Result<HandlerOutput, HandlerError>> {
        std::future::ready(match c.require_ai() {
            Ok(_) => Ok(HandlerOutput::message("ai")),
            Err(e) => Ok(HandlerOutput::message(format!("no ai: {e}"))),
        })
    }

    #[tokio::test]
    async fn test_ai_access_follows_requires_ai() {
        let d = dispatcher_with_ai();
        d.registry()
            .register(PluginDescriptor::new("plain", "1.0.0").handler(HandlerSpec::new("probe", "plain_ai", reports_ai)))
            .unwrap();
        d.registry()
            .register(
                PluginDescriptor::new("smart", "1.0.0")
                    .requires_ai(true)
                    .handler(HandlerSpec::new("probe", "smart_ai", reports_ai)),
            )
            .unwrap();

        let plain = d.dispatch(&Intent::new("plain_ai", 0.9), &alice()).await.unwrap();
        assert!(plain.output.message.unwrap().starts_with("no ai"));
        let smart = d.dispatch(&Intent::new("smart_ai", 0.9), &alice()).await.unwrap();
        assert_eq!(smart.output.message.as_deref(), Some("ai"));

        assert!(d.context_for("plain").ai().is_none());
        assert!(d.context_for("smart").ai().is_some());
        assert!(d.context_for("unregistered").ai().is_none());
        assert!(matches!(
            d.context_for("plain").require_ai(),
            Err(HandlerError::Provider(ProviderError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_call_plugin_callee_gets_its_own_ai_access() {
        let d = dispatcher_with_ai();
        d.registry()
            .register(PluginDescriptor::new("plain", "1.0.0").handler(HandlerSpec::new("probe", "plain_ai", reports_ai)))
            .unwrap();
        d.registry()
            .register(
                PluginDescriptor::new("smart", "1.0.0")
                    .requires_ai(true)
                    .handler(HandlerSpec::new("probe", "smart_ai", reports_ai)),
            )
            .unwrap();

        // an AI-enabled caller does not lend its provider to the callee
        let caller = d.context_for("smart");
        let out = caller.call_plugin("plain", "probe", Value::Null).await.unwrap();
        assert!(out.message.unwrap().starts_with("no ai"));

        let caller = d.context_for("plain");
        let out = caller.call_plugin("smart", "probe", Value::Null).await.unwrap();
        assert_eq!(out.message.as_deref(), Some("ai"));
    }

    #[tokio::test]
    async fn test_call_plugin_unknown_target_is_not_found() {
        let d = dispatcher(config());
        let ctx = d.context_for("caller");
        let err = ctx.call_plugin("ghost", "h", Value::Null).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }
}
