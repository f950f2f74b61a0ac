// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Correlated request/response over two pub/sub channels.
//!
//! ```text
//!  requester                                   responder(s)
//!  ─────────                                   ────────────
//!  request(req)
//!    pending[id] = (now, tx)
//!    PUBLISH request_channel {id, req} ───────► respond(req, origin)
//!                                                  │ Some(resp)
//!    pending.remove(id) ◄───────────────────────── PUBLISH response_channel {id, resp}
//!    tx.send(Ok(resp))
//!
//!  sweep (every sweep_interval)
//!    pending older than timeout ─► tx.send(Err(RequestTimeout))
//! ```
//!
//! Every process sees every request and every response. Processes whose
//! responder returns `None` stay silent; responses for unknown ids (another
//! process's request, a duplicate delivery, or one already swept) are
//! dropped without comment.
//!
//! A request that gets no answer fails with [`SyncError::RequestTimeout`]
//! once swept, so the worst-case wait is `timeout + sweep_interval`. Closing
//! the channel fails every outstanding request with [`SyncError::Shutdown`].

use crate::config::{RequestChannelConfig, RequestConfig};
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::transport::{SharedTransport, Subscription};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

/// Anything that can travel as a request or response body.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Payload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Future returned by a [`Responder`].
pub type RespondFuture<'a, Resp> = Pin<Box<dyn Future<Output = Option<Resp>> + Send + 'a>>;

/// Answers requests on behalf of this process.
pub trait Responder<Req, Resp>: Send + Sync + 'static {
    /// `None` means this process has nothing to say (e.g. the player is not
    /// here); some other process may answer.
    fn respond<'a>(&'a self, request: Req, origin: &'a str) -> RespondFuture<'a, Resp>;
}

/// Adapts an async closure into a [`Responder`].
pub struct ResponderFn<F>(F);

/// Build a [`Responder`] from `|request, origin| async move { ... }`.
pub fn responder_fn<Req, Resp, F, Fut>(f: F) -> ResponderFn<F>
where
    F: Fn(Req, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Resp>> + Send + 'static,
{
    ResponderFn(f)
}

impl<Req, Resp, F, Fut> Responder<Req, Resp> for ResponderFn<F>
where
    F: Fn(Req, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Resp>> + Send + 'static,
{
    fn respond<'a>(&'a self, request: Req, origin: &'a str) -> RespondFuture<'a, Resp> {
        Box::pin((self.0)(request, origin.to_string()))
    }
}

/// Wire form of both directions.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<B> {
    correlation_id: Uuid,
    body: B,
}

struct Pending<Resp> {
    created: Instant,
    tx: oneshot::Sender<Result<Resp>>,
}

type PendingMap<Resp> = DashMap<Uuid, Pending<Resp>>;

struct TaskSet {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// One request/response protocol, e.g. "where is player X?".
pub struct RequestChannel<Req, Resp> {
    config: RequestChannelConfig,
    timeout: Duration,
    transport: SharedTransport,
    pending: Arc<PendingMap<Resp>>,
    tasks: Mutex<Option<TaskSet>>,
    closed: AtomicBool,
    _request: PhantomData<fn(Req)>,
}

impl<Req: Payload, Resp: Payload> RequestChannel<Req, Resp> {
    /// Subscribe and start the sweep. With a `responder`, this process also
    /// answers requests on the channel.
    pub async fn open(
        config: RequestChannelConfig,
        timeouts: &RequestConfig,
        transport: SharedTransport,
        responder: Option<Arc<dyn Responder<Req, Resp>>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pending: Arc<PendingMap<Resp>> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let span = info_span!("request_channel", channel = %config.request_channel);
        let mut handles = Vec::with_capacity(3);

        let responses = transport.subscribe(&config.response_channel).await?;
        handles.push(tokio::spawn(
            run_response_listener(responses, Arc::clone(&pending), config.request_channel.clone(), shutdown_rx.clone())
                .instrument(span.clone()),
        ));

        if let Some(responder) = responder {
            let requests = transport.subscribe(&config.request_channel).await?;
            handles.push(tokio::spawn(
                run_request_listener(
                    requests,
                    responder,
                    Arc::clone(&transport),
                    config.response_channel.clone(),
                    shutdown_rx.clone(),
                )
                .instrument(span.clone()),
            ));
        }

        let timeout = timeouts.timeout_duration();
        handles.push(tokio::spawn(
            run_sweep(
                Arc::clone(&pending),
                config.request_channel.clone(),
                timeout,
                timeouts.sweep_interval_duration(),
                shutdown_rx,
            )
            .instrument(span),
        ));

        info!(
            request_channel = %config.request_channel,
            response_channel = %config.response_channel,
            timeout_ms = timeout.as_millis() as u64,
            "Request channel open"
        );

        Ok(Arc::new(Self {
            config,
            timeout,
            transport,
            pending,
            tasks: Mutex::new(Some(TaskSet { shutdown_tx, handles })),
            closed: AtomicBool::new(false),
            _request: PhantomData,
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.request_channel
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Requests still waiting for an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Publish a request and wait for the first response.
    pub async fn request(&self, request: Req) -> Result<Resp> {
        if self.is_closed() {
            return Err(SyncError::Shutdown);
        }

        let correlation_id = Uuid::new_v4();
        let payload = serde_json::to_vec(&Envelope {
            correlation_id,
            body: &request,
        })
        .map_err(|e| SyncError::serialization(&self.config.request_channel, e))?;

        let created = Instant::now();
        let rx = self.register(correlation_id, created)?;

        if let Err(e) = self.transport.publish(&self.config.request_channel, payload).await {
            self.pending.remove(&correlation_id);
            return Err(e);
        }
        metrics::record_request_sent(&self.config.request_channel);
        metrics::set_pending_requests(&self.config.request_channel, self.pending.len());
        trace!(%correlation_id, "Request sent");

        match rx.await {
            Ok(Ok(response)) => {
                metrics::record_request_resolved(&self.config.request_channel, created.elapsed());
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Shutdown),
        }
    }

    /// Add a pending entry for `correlation_id`. A `close()` that ran since
    /// the caller's first check has already drained the map, so the entry is
    /// withdrawn rather than left waiting on a sender nobody will fire.
    fn register(&self, correlation_id: Uuid, created: Instant) -> Result<oneshot::Receiver<Result<Resp>>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, Pending { created, tx });
        if self.is_closed() {
            self.pending.remove(&correlation_id);
            return Err(SyncError::Shutdown);
        }
        Ok(rx)
    }

    /// Stop listening and fail every outstanding request.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let tasks = self.tasks.lock().take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown_tx.send(true);
            for handle in tasks.handles {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Request channel task panicked");
                    }
                }
            }
        }

        let ids: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(SyncError::Shutdown));
            }
        }
        metrics::set_pending_requests(&self.config.request_channel, 0);
        info!(request_channel = %self.config.request_channel, "Request channel closed");
    }
}

async fn run_response_listener<Resp: Payload>(
    mut subscription: Subscription,
    pending: Arc<PendingMap<Resp>>,
    name: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else {
                    warn!("Response subscription closed");
                    break;
                };
                let envelope: Envelope<Resp> = match serde_json::from_slice(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(origin = %message.origin, error = %e, "Dropping undecodable response");
                        continue;
                    }
                };
                match pending.remove(&envelope.correlation_id) {
                    Some((_, entry)) => {
                        let _ = entry.tx.send(Ok(envelope.body));
                        metrics::set_pending_requests(&name, pending.len());
                    }
                    None => trace!(correlation_id = %envelope.correlation_id, "No pending request for response"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_request_listener<Req: Payload, Resp: Payload>(
    mut subscription: Subscription,
    responder: Arc<dyn Responder<Req, Resp>>,
    transport: SharedTransport,
    response_channel: String,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            message = subscription.next() => {
                let Some(message) = message else {
                    warn!("Request subscription closed");
                    break;
                };
                let envelope: Envelope<Req> = match serde_json::from_slice(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(origin = %message.origin, error = %e, "Dropping undecodable request");
                        continue;
                    }
                };

                let responder = Arc::clone(&responder);
                let transport = Arc::clone(&transport);
                let response_channel = response_channel.clone();
                tokio::spawn(async move {
                    let correlation_id = envelope.correlation_id;
                    let Some(body) = responder.respond(envelope.body, &message.origin).await else {
                        return;
                    };
                    let payload = match serde_json::to_vec(&Envelope { correlation_id, body }) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(%correlation_id, error = %e, "Cannot encode response");
                            return;
                        }
                    };
                    match transport.publish(&response_channel, payload).await {
                        Ok(()) => metrics::record_request_answered(&response_channel),
                        Err(e) => warn!(%correlation_id, error = %e, "Failed to publish response"),
                    }
                }.in_current_span());
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Fail every request older than `timeout`. Returns how many were swept.
fn sweep_expired<Resp>(pending: &PendingMap<Resp>, timeout: Duration) -> usize {
    let now = Instant::now();
    let expired: Vec<Uuid> = pending
        .iter()
        .filter(|e| now.duration_since(e.value().created) >= timeout)
        .map(|e| *e.key())
        .collect();

    let mut swept = 0;
    for correlation_id in expired {
        if let Some((_, entry)) = pending.remove(&correlation_id) {
            let waited_ms = now.duration_since(entry.created).as_millis() as u64;
            let _ = entry.tx.send(Err(SyncError::RequestTimeout {
                correlation_id,
                waited_ms,
            }));
            swept += 1;
        }
    }
    swept
}

async fn run_sweep<Resp: Payload>(
    pending: Arc<PendingMap<Resp>>,
    name: String,
    timeout: Duration,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let swept = sweep_expired(&pending, timeout);
                if swept > 0 {
                    debug!(swept, "Timed out pending requests");
                    metrics::record_requests_timed_out(&name, swept);
                    metrics::set_pending_requests(&name, pending.len());
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
