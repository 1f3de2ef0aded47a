//! Redis testcontainer for store integration tests.

use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;
use velocity_jobs::{RedisConfig, RedisConnector};

/// Test Redis container wrapper.
///
/// Each instance gets a fresh server, so tests never share keys.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    config: RedisConfig,
}

impl TestRedis {
    /// Starts a new Redis container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 4,
            key_prefix: "test-jobs".to_string(),
        };

        Self {
            _container: container,
            config,
        }
    }

    /// Connection settings for the container.
    pub fn config(&self) -> RedisConfig {
        self.config.clone()
    }

    /// A connector with the default five priority levels.
    pub fn connector(&self, pop_timeout: Duration) -> RedisConnector {
        RedisConnector::new(self.config(), 5, pop_timeout)
    }
}
