// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Sliding-window limiter for routing policy updates, keyed per channel.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use torq_core::types::ChannelId;

/// Limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Updates allowed per channel inside one window.
    pub max_updates: usize,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_updates: 2,
            window: Duration::from_secs(300),
        }
    }
}

/// Per-channel sliding-window limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    recent: HashMap<ChannelId, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            recent: HashMap::new(),
        }
    }

    /// Record an update of `channel_id` if the window allows one.
    pub fn try_acquire(&mut self, channel_id: ChannelId) -> bool {
        let now = Instant::now();
        let window = self.config.window;
        let recent = self.recent.entry(channel_id).or_default();
        while recent
            .front()
            .is_some_and(|at| now.duration_since(*at) >= window)
        {
            recent.pop_front();
        }
        if recent.len() >= self.config.max_updates {
            return false;
        }
        recent.push_back(now);
        true
    }

    /// Give back the most recent slot of `channel_id`, used when the node
    /// rejected the update.
    pub fn release(&mut self, channel_id: ChannelId) {
        if let Some(recent) = self.recent.get_mut(&channel_id) {
            recent.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            max_updates: 2,
            window: Duration::from_secs(300),
        });
        assert!(limiter.try_acquire(1));
        assert!(limiter.try_acquire(1));
        assert!(!limiter.try_acquire(1));
        assert!(limiter.try_acquire(2));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(limiter.try_acquire(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_returns_slot() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            max_updates: 1,
            window: Duration::from_secs(60),
        });
        assert!(limiter.try_acquire(1));
        limiter.release(1);
        assert!(limiter.try_acquire(1));
    }
}
