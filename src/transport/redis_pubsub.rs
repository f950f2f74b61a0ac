// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed transport.
//!
//! Hash operations and `PUBLISH` go through a shared
//! `redis::aio::ConnectionManager`, which reconnects on its own and
//! multiplexes concurrent commands over one socket. Each subscription gets a
//! dedicated pub/sub connection driven by a background task that decodes
//! frames and forwards them to the [`Subscription`].
//!
//! # Subscription Lifecycle
//!
//! ```text
//! subscribe() ──► SUBSCRIBE ──► pump messages ──► stream ends
//!                     ▲                                │
//!                     └────── backoff (reconnect) ◄────┘
//! ```
//!
//! The task exits when the [`Subscription`] is dropped.

use super::frame::{decode_frame, encode_frame};
use super::{BoxFuture, Message, Subscription, Transport};
use crate::config::RedisConfig;
use crate::error::{Result, SyncError};
use crate::metrics;
use crate::resilience::RetryConfig;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Production transport over Redis.
pub struct RedisTransport {
    server_id: String,
    config: RedisConfig,
    client: Client,
    conn: ConnectionManager,
    reconnect: RetryConfig,
}

impl RedisTransport {
    /// Connect with the bounded startup retry policy.
    pub async fn connect(server_id: impl Into<String>, config: RedisConfig) -> Result<Self> {
        Self::connect_with_retry(server_id, config, RetryConfig::startup()).await
    }

    /// Connect with an explicit retry policy.
    pub async fn connect_with_retry(
        server_id: impl Into<String>,
        config: RedisConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        let server_id = server_id.into();
        let client = Client::open(config.url.as_str())
            .map_err(|e| SyncError::Config(format!("Invalid Redis URL: {}", e)))?;

        info!(server_id = %server_id, url = %config.url, "Connecting to Redis");

        let mut backoff = retry.backoff();
        loop {
            let error = match timeout(retry.connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    if backoff.attempts() > 0 {
                        info!(attempts = backoff.attempts() + 1, "Connected to Redis after retry");
                    } else {
                        info!("Connected to Redis");
                    }
                    return Ok(Self {
                        server_id,
                        config,
                        client,
                        conn,
                        reconnect: RetryConfig::reconnect(),
                    });
                }
                Ok(Err(e)) => SyncError::redis("connect", e),
                Err(_) => SyncError::redis_msg(
                    "connect",
                    format!("timed out after {}ms", retry.connection_timeout.as_millis()),
                ),
            };

            match backoff.next() {
                Some(delay) => {
                    warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Redis connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(attempts = backoff.attempts() + 1, error = %error, "Failed to connect to Redis");
                    return Err(error);
                }
            }
        }
    }

    /// Override the policy used to re-establish dropped subscriptions.
    pub fn with_reconnect_policy(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

async fn open_pubsub(client: &Client, key: &str) -> Result<PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| SyncError::redis("SUBSCRIBE", e))?;
    pubsub
        .subscribe(key)
        .await
        .map_err(|e| SyncError::redis("SUBSCRIBE", e))?;
    Ok(pubsub)
}

/// Forward decoded frames until the subscriber goes away, resubscribing
/// whenever the pub/sub connection drops.
async fn pump(
    client: Client,
    key: String,
    channel: String,
    first: PubSub,
    tx: mpsc::UnboundedSender<Message>,
    retry: RetryConfig,
) {
    let mut next_pubsub = Some(first);

    loop {
        let pubsub = match next_pubsub.take() {
            Some(pubsub) => pubsub,
            None => {
                let mut backoff = retry.backoff();
                loop {
                    match open_pubsub(&client, &key).await {
                        Ok(pubsub) => {
                            metrics::record_subscription_connect(&channel, true);
                            info!("Resubscribed");
                            break pubsub;
                        }
                        Err(e) => {
                            metrics::record_subscription_connect(&channel, false);
                            let Some(delay) = backoff.next() else {
                                error!(error = %e, "Giving up on subscription");
                                return;
                            };
                            warn!(error = %e, delay_ms = delay.as_millis() as u64, "Resubscribe failed");
                            tokio::select! {
                                _ = tx.closed() => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        };

        let mut messages = Box::pin(pubsub.into_on_message());
        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("Subscriber dropped, closing subscription");
                    return;
                }
                msg = messages.next() => {
                    let Some(msg) = msg else { break };
                    match decode_frame(msg.get_payload_bytes()) {
                        Ok((origin, payload)) => {
                            let message = Message {
                                channel: channel.clone(),
                                origin,
                                payload,
                            };
                            if tx.send(message).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Dropping malformed frame");
                            metrics::record_dropped_frame(&channel);
                        }
                    }
                }
            }
        }

        warn!("Subscription stream ended, reconnecting");
    }
}

impl Transport for RedisTransport {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) -> BoxFuture<'_, ()> {
        let key = self.config.namespaced(channel);
        Box::pin(async move {
            let frame = encode_frame(&self.server_id, &payload)?;
            let mut conn = self.conn.clone();
            let _receivers: i64 = conn
                .publish(&key, frame)
                .await
                .map_err(|e| SyncError::redis("PUBLISH", e))?;
            Ok(())
        })
    }

    fn subscribe(&self, channel: &str) -> BoxFuture<'_, Subscription> {
        let channel = channel.to_string();
        let key = self.config.namespaced(&channel);
        Box::pin(async move {
            let pubsub = open_pubsub(&self.client, &key).await?;
            let (tx, rx) = mpsc::unbounded_channel();

            let span = info_span!("subscription", channel = %channel);
            tokio::spawn(
                pump(
                    self.client.clone(),
                    key,
                    channel.clone(),
                    pubsub,
                    tx,
                    self.reconnect.clone(),
                )
                .instrument(span),
            );

            debug!(channel = %channel, "Subscribed");
            Ok(Subscription::new(channel, rx))
        })
    }

    fn hash_set(&self, bucket: &str, field: &str, value: Vec<u8>) -> BoxFuture<'_, ()> {
        let key = self.config.namespaced(bucket);
        let field = field.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.hset::<_, _, _, ()>(&key, &field, value)
                .await
                .map_err(|e| SyncError::redis("HSET", e))
        })
    }

    fn hash_get(&self, bucket: &str, field: &str) -> BoxFuture<'_, Option<Vec<u8>>> {
        let key = self.config.namespaced(bucket);
        let field = field.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.hget::<_, _, Option<Vec<u8>>>(&key, &field)
                .await
                .map_err(|e| SyncError::redis("HGET", e))
        })
    }

    fn hash_get_all(&self, bucket: &str) -> BoxFuture<'_, HashMap<String, Vec<u8>>> {
        let key = self.config.namespaced(bucket);
        Box::pin(async move {
            let mut conn = self.conn.clone();
            conn.hgetall::<_, HashMap<String, Vec<u8>>>(&key)
                .await
                .map_err(|e| SyncError::redis("HGETALL", e))
        })
    }

    fn hash_delete(&self, bucket: &str, field: &str) -> BoxFuture<'_, bool> {
        let key = self.config.namespaced(bucket);
        let field = field.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let removed: i64 = conn
                .hdel(&key, &field)
                .await
                .map_err(|e| SyncError::redis("HDEL", e))?;
            Ok(removed > 0)
        })
    }
}
