//! SSE auth/limits (spec.md §4.7 "Auth/limits"): bearer-token check, IP
//! allowlist, UA prefix allowlist, and a per-IP connection-rate sliding
//! window grounded on the backend's `middleware/rate_limit.rs` counter.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub enum AuthDecision {
    Allow,
    Unauthorized,
    Forbidden,
}

pub fn check_token(configured: &Option<String>, provided: Option<&str>) -> AuthDecision {
    match configured {
        None => AuthDecision::Allow,
        Some(expected) => match provided {
            Some(token) if token == expected => AuthDecision::Allow,
            _ => AuthDecision::Unauthorized,
        },
    }
}

pub fn check_ip_allowlist(allowlist: &[String], ip: IpAddr) -> AuthDecision {
    if allowlist.is_empty() {
        return AuthDecision::Allow;
    }
    let ip_str = ip.to_string();
    if allowlist.iter().any(|a| a == &ip_str) {
        AuthDecision::Allow
    } else {
        AuthDecision::Forbidden
    }
}

pub fn check_ua_allowlist(allow_prefixes: &[String], user_agent: Option<&str>) -> AuthDecision {
    if allow_prefixes.is_empty() {
        return AuthDecision::Allow;
    }
    match user_agent {
        Some(ua) if allow_prefixes.iter().any(|p| ua.starts_with(p.as_str())) => AuthDecision::Allow,
        _ => AuthDecision::Forbidden,
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Sliding per-IP connection-rate limiter (spec.md "Per-IP connection rate
/// limit (sliding window); 429 when exceeded").
pub struct ConnectionRateLimiter {
    max_per_minute: u32,
    window: Duration,
    state: Mutex<HashMap<IpAddr, WindowEntry>>,
}

impl ConnectionRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            window: Duration::from_secs(60),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if this connection attempt is allowed.
    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.max_per_minute == 0 {
            return true;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        let entry = state.entry(ip).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });
        if now.duration_since(entry.window_start) >= self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        entry.count <= self.max_per_minute
    }
}
