use redis::RedisResult;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Fixed-window counter. Returns whether this hit is within `limit`.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, window_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

/// `rl:{scope}:{client}:{window}` for the fixed window containing `unix_seconds`
pub fn rate_limit_key(scope: &str, client: &str, unix_seconds: i64, window_seconds: i64) -> String {
    let window = unix_seconds.div_euclid(window_seconds.max(1));
    format!("rl:{}:{}:{}", scope, client, window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_key_buckets_by_window() {
        let a = rate_limit_key("orders", "10.0.0.1", 1_790_000_000, 60);
        let b = rate_limit_key("orders", "10.0.0.1", 1_790_000_039, 60);
        let c = rate_limit_key("orders", "10.0.0.1", 1_790_000_040, 60);
        assert_eq!(a, b);
        assert_ne!(b, c);
        assert!(a.starts_with("rl:orders:10.0.0.1:"));
    }
}
