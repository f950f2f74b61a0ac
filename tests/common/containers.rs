// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up Redis containers for integration tests.

use crossync::{NodeConfig, RedisConfig, RedisTransport, SyncNode};
use std::sync::Arc;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container.
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// One shared Redis that several "servers" connect to.
pub struct TestRedis<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestRedis<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self { container, redis_url }
    }

    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            url: self.redis_url.clone(),
            key_prefix: "test:".to_string(),
        }
    }

    /// Node config for a server attached to this Redis.
    pub fn node_config(&self, server_id: &str) -> NodeConfig {
        NodeConfig {
            redis: self.redis_config(),
            ..NodeConfig::for_testing(server_id)
        }
    }

    pub async fn transport(&self, server_id: &str) -> Arc<RedisTransport> {
        Arc::new(
            RedisTransport::connect(server_id, self.redis_config())
                .await
                .expect("connect to test redis"),
        )
    }

    /// A started node named `server_id`.
    pub async fn node(&self, server_id: &str) -> SyncNode {
        let node = SyncNode::connect_redis(self.node_config(server_id))
            .await
            .expect("connect node");
        node.start().expect("start node");
        node
    }

    /// Read a raw stored field, bypassing the crate.
    pub async fn stored(&self, bucket: &str, field: &str) -> redis::RedisResult<Option<Vec<u8>>> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        use redis::AsyncCommands;
        conn.hget(format!("test:{}", bucket), field).await
    }
}
