//! The service wrapper: lifecycle, event loop, heartbeat, dispatch.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, Publish, QoS};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use alicia_domain::Config;
use alicia_protocol::envelope::DecodeError;
use alicia_protocol::{topics, Envelope, ErrorPayload, MessageType, ServiceState};

use crate::backoff::ReconnectBackoff;
use crate::client::{mqtt_options, BusClient, BusError};
use crate::correlation::{CorrelationTracker, RequestError, RequestOutcome, SWEEP_INTERVAL};
use crate::handler::{BusHandler, HandlerContext};
use crate::health::HealthState;
use crate::http;
use crate::lifecycle::Lifecycle;
use crate::router::TopicRouter;

type Hook = Box<dyn FnOnce(ServiceHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ServiceHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The narrow capability handed to handlers and collaborator code.
///
/// Cheap to clone; holds no lifecycle authority. QoS discipline is baked
/// into the methods: heartbeats/events best-effort, requests/responses/
/// commands at-least-once.
#[derive(Clone)]
pub struct ServiceHandle {
    name: Arc<str>,
    client: BusClient,
    correlations: Arc<CorrelationTracker>,
    health: Arc<HealthState>,
    lifecycle: Arc<Lifecycle>,
    request_timeout: Duration,
}

impl ServiceHandle {
    pub fn service_name(&self) -> &str {
        &self.name
    }

    pub fn health(&self) -> &Arc<HealthState> {
        &self.health
    }

    pub fn state(&self) -> ServiceState {
        self.lifecycle.state()
    }

    pub fn report_metric(&self, name: &str, value: f64) {
        self.health.report_metric(name, value);
    }

    /// Fire-and-forget event, QoS 0.
    pub async fn publish_event(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let env = Envelope::event(&self.name, payload);
        self.client
            .publish_envelope(topic, &env, QoS::AtMostOnce, false)
            .await
    }

    /// Event that must not be lost silently (voice audio, command
    /// resolutions), QoS 1.
    pub async fn publish_event_durable(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let env = Envelope::event(&self.name, payload);
        self.client
            .publish_envelope(topic, &env, QoS::AtLeastOnce, false)
            .await
    }

    /// Retained event, QoS 0 — the broker replays it to late subscribers
    /// (device state, registry rebuild).
    pub async fn publish_retained(&self, topic: &str, payload: Value) -> Result<(), BusError> {
        let env = Envelope::event(&self.name, payload);
        self.client
            .publish_envelope(topic, &env, QoS::AtMostOnce, true)
            .await
    }

    /// Clear a retained message (empty payload tombstone).
    pub async fn clear_retained(&self, topic: &str) -> Result<(), BusError> {
        self.client
            .publish_bytes(topic, QoS::AtLeastOnce, true, Vec::new())
            .await
    }

    /// Command envelope to a device topic, QoS 1.
    pub async fn publish_command(
        &self,
        topic: &str,
        destination: &str,
        payload: Value,
    ) -> Result<(), BusError> {
        let env = Envelope::command(&self.name, destination, payload);
        self.client
            .publish_envelope(topic, &env, QoS::AtLeastOnce, false)
            .await
    }

    /// One-shot request/response over the bus.
    ///
    /// Publishes to `alicia/<destination>/request`, then awaits the
    /// correlated reply on this service's response topic. Exactly one of
    /// response / responder-error / timeout comes back, the timeout no
    /// later than `timeout + sweep_interval`.
    pub async fn request(
        &self,
        destination: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, RequestError> {
        let timeout = timeout.unwrap_or(self.request_timeout);
        let env = Envelope::request(&self.name, destination, payload);
        let correlation_id = env.correlation_id.expect("request envelopes carry an id");

        let rx = self
            .correlations
            .register(correlation_id, Instant::now() + timeout);

        if let Err(e) = self
            .client
            .publish_envelope(&topics::service_request(destination), &env, QoS::AtLeastOnce, false)
            .await
        {
            self.correlations.cancel(correlation_id);
            return Err(RequestError::Bus(e.to_string()));
        }

        match rx.await {
            Ok(RequestOutcome::Response(envelope)) => Ok(envelope),
            Ok(RequestOutcome::Error(envelope)) => {
                let err: ErrorPayload = envelope.payload_as().unwrap_or_else(|_| {
                    ErrorPayload::new("error", "unstructured error payload")
                });
                Err(RequestError::Responder {
                    code: err.code,
                    message: err.message,
                })
            }
            Ok(RequestOutcome::Timeout) => Err(RequestError::Timeout),
            Ok(RequestOutcome::Cancelled) | Err(_) => Err(RequestError::Cancelled),
        }
    }

    /// Reply to a request envelope.
    pub async fn respond(&self, request: &Envelope, payload: Value) -> Result<(), BusError> {
        let env = Envelope::response(&self.name, request, payload);
        self.client
            .publish_envelope(
                &topics::service_response(&request.source),
                &env,
                QoS::AtLeastOnce,
                false,
            )
            .await
    }

    /// Reply to a request envelope with a structured error.
    pub async fn respond_error(
        &self,
        request: &Envelope,
        error: ErrorPayload,
    ) -> Result<(), BusError> {
        let env = Envelope::error_reply(&self.name, request, error);
        self.client
            .publish_envelope(
                &topics::service_response(&request.source),
                &env,
                QoS::AtLeastOnce,
                false,
            )
            .await
    }

    /// Cancel an in-flight request by correlation id.
    pub fn cancel_request(&self, correlation_id: uuid::Uuid) -> bool {
        self.correlations.cancel(correlation_id)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Builder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Fluent builder for a [`Service`].
///
/// # Example
///
/// ```rust,no_run
/// # use alicia_bus::{ServiceBuilder, handler_fn};
/// # use alicia_domain::Config;
/// # async fn demo(config: Config) -> anyhow::Result<()> {
/// let service = ServiceBuilder::new(config, env!("CARGO_PKG_VERSION"))
///     .handler("alicia/voice/command", handler_fn(|_ctx, _topic, _env| async { Ok(()) }))
///     .build()?;
/// service.run(tokio_util::sync::CancellationToken::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBuilder {
    config: Config,
    version: String,
    router: TopicRouter,
    on_ready: Option<Hook>,
    on_stop: Option<Hook>,
}

impl ServiceBuilder {
    pub fn new(config: Config, version: &str) -> Self {
        Self {
            config,
            version: version.to_owned(),
            router: TopicRouter::new(),
            on_ready: None,
            on_stop: None,
        }
    }

    /// Register a handler under a topic filter (`+`/`#` wildcards ok).
    pub fn handler(mut self, filter: &str, handler: Arc<dyn BusHandler>) -> Self {
        self.router.register(filter, handler);
        self
    }

    /// Hook run after the bus is connected and subscribed, before `Ready`.
    pub fn on_ready<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(ServiceHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_ready = Some(Box::new(move |h| f(h).boxed()));
        self
    }

    /// Hook run during graceful stop, bounded by `shutdown_grace`.
    pub fn on_stop<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(ServiceHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move |h| f(h).boxed()));
        self
    }

    pub fn build(self) -> Result<Service, BusError> {
        if self.config.service_name.is_empty() {
            return Err(BusError::Config("service_name is required".into()));
        }

        let health = Arc::new(HealthState::new(&self.config.service_name, &self.version));
        let instance_suffix = health.instance_id().simple().to_string()[..8].to_owned();
        let options = mqtt_options(&self.config, &instance_suffix)?;

        let (client, eventloop) = AsyncClient::new(options, 64);
        let client = BusClient::new(client, health.clone(), self.config.mqtt.publish_buffer);

        let handle = ServiceHandle {
            name: Arc::from(self.config.service_name.as_str()),
            client,
            correlations: Arc::new(CorrelationTracker::new()),
            health,
            lifecycle: Arc::new(Lifecycle::new()),
            request_timeout: Duration::from_millis(self.config.request_timeout_ms),
        };

        Ok(Service {
            config: self.config,
            router: self.router,
            handle,
            eventloop,
            on_ready: self.on_ready,
            on_stop: self.on_stop,
            http_routes: None,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully-wired service process: owns the MQTT event loop, the
/// correlation sweeper, the heartbeat, and the HTTP surface.
pub struct Service {
    config: Config,
    router: TopicRouter,
    handle: ServiceHandle,
    eventloop: EventLoop,
    on_ready: Option<Hook>,
    on_stop: Option<Hook>,
    http_routes: Option<axum::Router>,
}

impl Service {
    /// The capability handle, for wiring collaborators before `run`.
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    /// Register a handler after `build()` — for collaborators that need
    /// the [`ServiceHandle`] at construction time.
    pub fn register_handler(&mut self, filter: &str, handler: Arc<dyn BusHandler>) {
        self.router.register(filter, handler);
    }

    /// Attach service-specific HTTP routes (already stated) next to the
    /// common `/health`, `/metrics`, `/shutdown` surface.
    pub fn set_http_routes(&mut self, routes: axum::Router) {
        self.http_routes = Some(routes);
    }

    /// Replace the `on_ready` hook after `build()`.
    pub fn set_on_ready<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(ServiceHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_ready = Some(Box::new(move |h| f(h).boxed()));
    }

    /// Replace the `on_stop` hook after `build()`.
    pub fn set_on_stop<F, Fut>(&mut self, f: F)
    where
        F: FnOnce(ServiceHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_stop = Some(Box::new(move |h| f(h).boxed()));
    }

    /// Run until the shutdown token fires or startup fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BusError> {
        let Service {
            config,
            router,
            handle,
            mut eventloop,
            mut on_ready,
            mut on_stop,
            http_routes,
        } = self;
        let lifecycle = handle.lifecycle.clone();
        let health = handle.health.clone();

        lifecycle.transition(ServiceState::Initializing);
        tracing::info!(service = %handle.name, "service starting");

        // Declare the RPC response subscription plus every handler filter.
        handle
            .client
            .subscribe(&topics::service_response(&handle.name), QoS::AtLeastOnce)
            .await?;
        for filter in router.filters() {
            handle.client.subscribe(&filter, QoS::AtLeastOnce).await?;
        }

        // HTTP surface lives for the whole run.
        let http_task = tokio::spawn(http::serve(
            config.http.clone(),
            handle.clone(),
            http_routes,
            shutdown.clone(),
        ));

        let backoff = ReconnectBackoff::from_millis(
            config.mqtt.reconnect_initial_ms,
            config.mqtt.reconnect_max_backoff_ms,
        );
        let startup_deadline = Instant::now() + Duration::from_millis(config.startup_timeout_ms);
        let heartbeat_period = Duration::from_millis(config.heartbeat_interval_ms);

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_period,
            heartbeat_period,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let handler_cancel = CancellationToken::new();
        let mut reconnect_attempt: u32 = 0;
        let mut awaiting_subacks: usize = 0;

        let run_result: Result<(), BusError> = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),

                _ = sweep.tick() => {
                    let timed_out = handle.correlations.sweep(Instant::now());
                    if timed_out > 0 {
                        tracing::debug!(timed_out, "correlation sweep expired entries");
                    }
                    lifecycle.maybe_recover(health.mqtt_connected.load(Ordering::Relaxed));
                }

                _ = heartbeat.tick() => {
                    publish_heartbeat(&handle).await;
                }

                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!(service = %handle.name, "mqtt connected");
                        reconnect_attempt = 0;
                        awaiting_subacks = handle.client.subscription_count();
                        handle.client.on_connack().await;
                        lifecycle.set_connected(true);
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        awaiting_subacks = awaiting_subacks.saturating_sub(1);
                        if awaiting_subacks == 0
                            && lifecycle.state() == ServiceState::Initializing
                        {
                            if let Some(hook) = on_ready.take() {
                                if let Err(e) = hook(handle.clone()).await {
                                    lifecycle.transition(ServiceState::Failed);
                                    break Err(BusError::Mqtt(format!("on_ready hook: {e}")));
                                }
                            }
                            lifecycle.transition(ServiceState::Ready);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        dispatch(&handle, &router, publish, &handler_cancel);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if health.mqtt_connected.load(Ordering::Relaxed) {
                            tracing::warn!(error = %e, "mqtt connection lost");
                            handle.client.on_disconnect();
                            lifecycle.set_connected(false);
                        }
                        if lifecycle.state() == ServiceState::Initializing
                            && Instant::now() >= startup_deadline
                        {
                            lifecycle.transition(ServiceState::Failed);
                            break Err(BusError::StartupTimeout);
                        }
                        let delay = backoff.delay_for_attempt(reconnect_attempt);
                        reconnect_attempt = reconnect_attempt.saturating_add(1);
                        tracing::debug!(
                            attempt = reconnect_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "reconnecting"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.cancelled() => break Ok(()),
                        }
                    }
                },
            }
        };

        // ── Graceful stop ────────────────────────────────────────────
        lifecycle.transition(ServiceState::Stopping);
        handler_cancel.cancel();

        let grace = Duration::from_millis(config.shutdown_grace_ms);
        if let Some(hook) = on_stop.take() {
            if tokio::time::timeout(grace, hook(handle.clone())).await.is_err() {
                tracing::warn!(
                    grace_ms = grace.as_millis() as u64,
                    "on_stop hook overran grace, forcing stop"
                );
            }
        }
        let cancelled = handle.correlations.cancel_all();
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled in-flight requests on shutdown");
        }
        handle.client.disconnect().await;
        http_task.abort();
        lifecycle.transition(ServiceState::Stopped);
        tracing::info!(service = %handle.name, "service stopped");

        run_result
    }
}

async fn publish_heartbeat(handle: &ServiceHandle) {
    let snapshot = handle.health.snapshot(handle.lifecycle.state());
    let payload = match serde_json::to_value(&snapshot) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize heartbeat");
            return;
        }
    };
    let env = Envelope::heartbeat(&handle.name, payload);
    if let Err(e) = handle
        .client
        .publish_envelope(&topics::health(&handle.name), &env, QoS::AtMostOnce, true)
        .await
    {
        tracing::warn!(error = %e, "heartbeat publish failed");
    }
}

/// Decode, TTL-check, correlate or route one inbound publish.
fn dispatch(
    handle: &ServiceHandle,
    router: &TopicRouter,
    publish: Publish,
    handler_cancel: &CancellationToken,
) {
    let topic = publish.topic.clone();

    // Empty payloads are retained-message tombstones, not envelopes.
    if publish.payload.is_empty() {
        return;
    }

    let envelope = match alicia_protocol::decode(&publish.payload) {
        Ok(env) => env,
        Err(DecodeError::UnknownMessageType { kind, .. }) => {
            tracing::debug!(topic = %topic, kind = %kind, "unknown message_type, dropped");
            handle.health.dropped_envelopes.fetch_add(1, Ordering::Relaxed);
            return;
        }
        Err(e) => {
            tracing::debug!(topic = %topic, error = %e, "invalid envelope, dropped");
            handle.health.dropped_envelopes.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if envelope.is_expired(chrono::Utc::now()) {
        handle.health.dropped_envelopes.fetch_add(1, Ordering::Relaxed);
        return;
    }

    // Replies are correlation-driven, not router-driven.
    if matches!(envelope.message_type, MessageType::Response | MessageType::Error)
        && envelope.correlation_id.is_some()
    {
        if handle.correlations.resolve(envelope) {
            handle.health.record_message(&topic);
        } else {
            handle.health.late_responses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(topic = %topic, "late or duplicate reply dropped");
        }
        return;
    }

    let handlers = router.route(&topic);
    if handlers.is_empty() {
        handle.health.unrouted_messages.fetch_add(1, Ordering::Relaxed);
        return;
    }
    handle.health.record_message(&topic);

    for handler in handlers {
        let ctx = HandlerContext {
            handle: handle.clone(),
            cancel: handler_cancel.child_token(),
        };
        let envelope = envelope.clone();
        let topic = topic.clone();
        let health = handle.health.clone();
        let lifecycle = handle.lifecycle.clone();

        // Handlers run off the I/O loop; a panicking handler is an
        // error, not a crash.
        tokio::spawn(async move {
            let result =
                AssertUnwindSafe(handler.handle(ctx, &topic, envelope)).catch_unwind().await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(topic = %topic, error = %e, "handler error");
                    health.record_error(format!("{topic}: {e}"));
                    lifecycle.record_error();
                }
                Err(_panic) => {
                    tracing::error!(topic = %topic, "handler panicked");
                    health.record_error(format!("{topic}: handler panicked"));
                    lifecycle.record_error();
                }
            }
        });
    }
}
