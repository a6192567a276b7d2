use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Limits for authentication attempts, per source address and per token hash
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_per_source: u32,
    pub max_per_token: u32,
    pub block_duration: Duration,
    pub window: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_source: 10,
            max_per_token: 5,
            block_duration: Duration::from_secs(15 * 60),
            window: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
struct SourceAttempts {
    count: u32,
    first_attempt: Instant,
    last_attempt: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Debug)]
struct TokenAttempts {
    count: u32,
    first_attempt: Instant,
    blocked_until: Option<Instant>,
}

#[derive(Default)]
struct Maps {
    by_source: HashMap<String, SourceAttempts>,
    by_token: HashMap<String, TokenAttempts>,
}

/// In-memory brute-force protection for the auth stage. Per-instance and
/// best-effort across restarts; all operations are O(1) under one mutex.
pub struct AuthRateLimiter {
    maps: Mutex<Maps>,
    config: RateLimitConfig,
}

impl AuthRateLimiter {
    pub fn new(config: RateLimitConfig) -> Arc<Self> {
        let limiter = Arc::new(Self {
            maps: Mutex::new(Maps::default()),
            config,
        });

        let sweep = Arc::clone(&limiter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep.config.cleanup_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweep.cleanup();
            }
        });

        limiter
    }

    /// May this source address attempt authentication?
    /// Returns the remaining block duration on denial.
    pub fn check_source(&self, addr: &str) -> Result<(), Duration> {
        let mut maps = self.maps.lock().unwrap();
        let now = Instant::now();

        let attempts = maps
            .by_source
            .entry(addr.to_string())
            .or_insert_with(|| SourceAttempts {
                count: 0,
                first_attempt: now,
                last_attempt: now,
                blocked_until: None,
            });

        if let Some(until) = attempts.blocked_until
            && now < until
        {
            return Err(until - now);
        }

        // A fresh window restarts the count
        if now.duration_since(attempts.first_attempt) > self.config.window {
            attempts.count = 0;
            attempts.first_attempt = now;
        }

        if attempts.count >= self.config.max_per_source {
            attempts.blocked_until = Some(now + self.config.block_duration);
            return Err(self.config.block_duration);
        }

        Ok(())
    }

    /// May this token hash be validated? Check only; failures are counted
    /// separately via record_failure.
    pub fn check_token(&self, token_hash: &str) -> Result<(), Duration> {
        if token_hash.is_empty() {
            return Ok(());
        }

        let maps = self.maps.lock().unwrap();
        let now = Instant::now();

        if let Some(attempts) = maps.by_token.get(token_hash)
            && let Some(until) = attempts.blocked_until
            && now < until
        {
            return Err(until - now);
        }

        Ok(())
    }

    /// Count a failed authentication attempt against the source and,
    /// when known, the token hash. The token is locked out once it
    /// reaches its limit.
    pub fn record_failure(&self, addr: &str, token_hash: &str) {
        let mut maps = self.maps.lock().unwrap();
        let now = Instant::now();

        match maps.by_source.get_mut(addr) {
            Some(attempts) => {
                attempts.count += 1;
                attempts.last_attempt = now;
            }
            None => {
                maps.by_source.insert(
                    addr.to_string(),
                    SourceAttempts {
                        count: 1,
                        first_attempt: now,
                        last_attempt: now,
                        blocked_until: None,
                    },
                );
            }
        }

        if !token_hash.is_empty() {
            let attempts = maps
                .by_token
                .entry(token_hash.to_string())
                .or_insert_with(|| TokenAttempts {
                    count: 0,
                    first_attempt: now,
                    blocked_until: None,
                });
            attempts.count += 1;
            if attempts.count >= self.config.max_per_token {
                attempts.blocked_until = Some(now + self.config.block_duration);
            }
        }
    }

    /// Zero the source counter after a successful authentication. The token
    /// counter is left alone: success implies a valid token, and reuse
    /// after a brief failure spike stays allowed.
    pub fn record_success(&self, addr: &str) {
        let mut maps = self.maps.lock().unwrap();
        if let Some(attempts) = maps.by_source.get_mut(addr) {
            attempts.count = 0;
            attempts.first_attempt = Instant::now();
        }
    }

    /// Drop records idle for over an hour whose block has lapsed
    fn cleanup(&self) {
        let mut maps = self.maps.lock().unwrap();
        let now = Instant::now();
        let cutoff = Duration::from_secs(3600);

        let before = maps.by_source.len() + maps.by_token.len();

        maps.by_source.retain(|_, a| {
            let expired = a.blocked_until.is_none_or(|until| now >= until);
            !(now.duration_since(a.last_attempt) > cutoff && expired)
        });
        maps.by_token.retain(|_, a| {
            let expired = a.blocked_until.is_none_or(|until| now >= until);
            !(now.duration_since(a.first_attempt) > cutoff && expired)
        });

        let removed = before - (maps.by_source.len() + maps.by_token.len());
        if removed > 0 {
            debug!(removed, "rate limiter cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(config: RateLimitConfig) -> AuthRateLimiter {
        AuthRateLimiter {
            maps: Mutex::new(Maps::default()),
            config,
        }
    }

    #[test]
    fn source_is_blocked_after_max_failures() {
        let rl = limiter(RateLimitConfig::default());

        for _ in 0..10 {
            assert!(rl.check_source("10.0.0.1").is_ok());
            rl.record_failure("10.0.0.1", "");
        }

        let retry_after = rl.check_source("10.0.0.1").unwrap_err();
        assert!(retry_after <= Duration::from_secs(15 * 60));

        // Stays blocked on the next check, even with a valid token in hand
        assert!(rl.check_source("10.0.0.1").is_err());
        // Other sources are unaffected
        assert!(rl.check_source("10.0.0.2").is_ok());
    }

    #[test]
    fn success_resets_the_source_counter() {
        let rl = limiter(RateLimitConfig::default());

        for _ in 0..9 {
            assert!(rl.check_source("10.0.0.1").is_ok());
            rl.record_failure("10.0.0.1", "");
        }
        rl.record_success("10.0.0.1");

        for _ in 0..10 {
            assert!(rl.check_source("10.0.0.1").is_ok());
            rl.record_failure("10.0.0.1", "");
        }
        assert!(rl.check_source("10.0.0.1").is_err());
    }

    #[test]
    fn token_is_locked_after_max_failures() {
        let rl = limiter(RateLimitConfig::default());
        let hash = "deadbeef";

        for _ in 0..4 {
            rl.record_failure("10.0.0.1", hash);
            assert!(rl.check_token(hash).is_ok());
        }
        rl.record_failure("10.0.0.1", hash);
        assert!(rl.check_token(hash).is_err());

        // Token lockouts follow the hash across sources
        rl.record_success("10.0.0.1");
        assert!(rl.check_token(hash).is_err());
    }

    #[test]
    fn empty_token_hash_is_never_limited() {
        let rl = limiter(RateLimitConfig::default());
        for _ in 0..20 {
            rl.record_failure("10.0.0.1", "");
        }
        assert!(rl.check_token("").is_ok());
    }

    #[test]
    fn window_expiry_restarts_the_count() {
        let rl = limiter(RateLimitConfig {
            window: Duration::from_millis(10),
            ..RateLimitConfig::default()
        });

        for _ in 0..10 {
            assert!(rl.check_source("10.0.0.1").is_ok());
            rl.record_failure("10.0.0.1", "");
        }
        std::thread::sleep(Duration::from_millis(15));
        // Window elapsed before the limit was tripped: counter restarts
        assert!(rl.check_source("10.0.0.1").is_ok());
    }

    #[test]
    fn block_expires_after_duration() {
        let rl = limiter(RateLimitConfig {
            max_per_source: 1,
            block_duration: Duration::from_millis(10),
            ..RateLimitConfig::default()
        });

        assert!(rl.check_source("10.0.0.1").is_ok());
        rl.record_failure("10.0.0.1", "");
        assert!(rl.check_source("10.0.0.1").is_err());

        std::thread::sleep(Duration::from_millis(15));
        // Block lapsed, but the count is still over the limit within the
        // window, so the next check re-blocks
        assert!(rl.check_source("10.0.0.1").is_err());
    }

    #[test]
    fn cleanup_keeps_active_blocks() {
        let rl = limiter(RateLimitConfig {
            max_per_source: 1,
            ..RateLimitConfig::default()
        });
        rl.record_failure("10.0.0.1", "hash1");
        let _ = rl.check_source("10.0.0.1");
        rl.cleanup();
        // Recent records survive the sweep
        assert!(rl.maps.lock().unwrap().by_source.contains_key("10.0.0.1"));
    }
}
