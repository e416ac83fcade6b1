use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

use voicemesh_common::ClusterError;

const WINDOW_SECS: u64 = 60;

/// Soft cap on tracked client IPs. Crossing it wipes the whole per-IP map;
/// an evicted IP merely restarts its window from zero.
const IP_MAP_SOFT_CAP: usize = 1024;

/// Request counts bucketed per second, confined to a sliding window.
#[derive(Debug)]
pub struct SlidingWindow {
    window_secs: u64,
    limit: u32,
    buckets: BTreeMap<u64, u32>,
}

impl SlidingWindow {
    pub fn new(window_secs: u64, limit: u32) -> Self {
        Self {
            window_secs,
            limit,
            buckets: BTreeMap::new(),
        }
    }

    fn prune(&mut self, now_secs: u64) {
        let cutoff = now_secs.saturating_sub(self.window_secs);
        self.buckets = self.buckets.split_off(&cutoff);
    }

    fn in_window(&self) -> u32 {
        self.buckets.values().sum()
    }

    /// Admit one request at `now_secs` if the window still has room, and
    /// record it. Prunes expired buckets first.
    pub fn try_acquire(&mut self, now_secs: u64) -> bool {
        self.prune(now_secs);
        if self.in_window() >= self.limit {
            return false;
        }
        *self.buckets.entry(now_secs).or_insert(0) += 1;
        true
    }

    pub fn remaining(&mut self, now_secs: u64) -> u32 {
        self.prune(now_secs);
        self.limit.saturating_sub(self.in_window())
    }
}

/// Limiter statistics exposed through the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStats {
    pub total_requests: u64,
    pub rejected_requests: u64,
    pub rejection_rate: f64,
    pub current_concurrent: u32,
    pub concurrent_limit: u32,
    pub global_rpm: u32,
    pub ip_rpm: u32,
}

/// Remaining quota for one client.
#[derive(Debug, Clone, Serialize)]
pub struct RemainingQuota {
    pub global_remaining: u32,
    pub ip_remaining: u32,
    pub concurrent_available: u32,
}

/// Multi-tier request limiter: a global sliding window, lazily-created
/// per-IP windows, optional per-endpoint windows, and an in-flight
/// concurrency gate. All layers must admit a request.
pub struct RateLimiter {
    global_rpm: u32,
    ip_rpm: u32,
    concurrent_limit: u32,
    global: Mutex<SlidingWindow>,
    per_ip: DashMap<String, SlidingWindow>,
    endpoint_rpm: HashMap<String, u32>,
    per_endpoint: DashMap<String, SlidingWindow>,
    current_concurrent: AtomicU32,
    total_requests: AtomicU64,
    rejected_requests: AtomicU64,
}

impl RateLimiter {
    pub fn new(global_rpm: u32, ip_rpm: u32, endpoint_rpm: HashMap<String, u32>, concurrent_limit: u32) -> Self {
        info!(
            global_rpm,
            ip_rpm,
            concurrent_limit,
            endpoint_limits = endpoint_rpm.len(),
            "Rate limiter configured"
        );
        Self {
            global_rpm,
            ip_rpm,
            concurrent_limit,
            global: Mutex::new(SlidingWindow::new(WINDOW_SECS, global_rpm)),
            per_ip: DashMap::new(),
            endpoint_rpm,
            per_endpoint: DashMap::new(),
            current_concurrent: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            rejected_requests: AtomicU64::new(0),
        }
    }

    fn now_secs() -> u64 {
        Utc::now().timestamp().max(0) as u64
    }

    fn reject(&self, message: String) -> ClusterError {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        counter!("gateway_rate_limited_total", 1);
        warn!("{message}");
        ClusterError::RateLimitExceeded(message)
    }

    /// Check the window tiers for one request. Rejection at any tier fails
    /// the request; an admitted request is recorded in every tier it passed.
    pub fn check(&self, client_ip: &str, endpoint: &str) -> Result<(), ClusterError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Self::now_secs();

        {
            let mut global = self.global.lock().expect("limiter lock poisoned");
            if !global.try_acquire(now) {
                return Err(self.reject("Global rate limit exceeded".to_string()));
            }
        }

        // Coarse cleanup: wipe the map rather than track per-IP recency.
        if self.per_ip.len() > IP_MAP_SOFT_CAP {
            info!(tracked_ips = self.per_ip.len(), "Clearing per-IP rate limiter state");
            self.per_ip.clear();
        }

        let allowed = self
            .per_ip
            .entry(client_ip.to_string())
            .or_insert_with(|| SlidingWindow::new(WINDOW_SECS, self.ip_rpm))
            .try_acquire(now);
        if !allowed {
            return Err(self.reject(format!("Rate limit exceeded for IP: {client_ip}")));
        }

        if let Some(&limit) = self.endpoint_rpm.get(endpoint) {
            let allowed = self
                .per_endpoint
                .entry(endpoint.to_string())
                .or_insert_with(|| SlidingWindow::new(WINDOW_SECS, limit))
                .try_acquire(now);
            if !allowed {
                return Err(self.reject(format!("Rate limit exceeded for endpoint: {endpoint}")));
            }
        }

        Ok(())
    }

    /// Claim an in-flight slot. Compare-exchange keeps concurrent callers
    /// from overshooting the limit.
    pub fn acquire_concurrent(&self) -> Result<(), ClusterError> {
        loop {
            let current = self.current_concurrent.load(Ordering::Acquire);
            if current >= self.concurrent_limit {
                return Err(self.reject(format!(
                    "Concurrent limit exceeded: {}",
                    self.concurrent_limit
                )));
            }
            if self
                .current_concurrent
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Release an in-flight slot. Called on every exit path.
    pub fn release_concurrent(&self) {
        let _ = self
            .current_concurrent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
    }

    pub fn stats(&self) -> LimiterStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let rejected = self.rejected_requests.load(Ordering::Relaxed);
        LimiterStats {
            total_requests: total,
            rejected_requests: rejected,
            rejection_rate: if total > 0 {
                rejected as f64 / total as f64
            } else {
                0.0
            },
            current_concurrent: self.current_concurrent.load(Ordering::Relaxed),
            concurrent_limit: self.concurrent_limit,
            global_rpm: self.global_rpm,
            ip_rpm: self.ip_rpm,
        }
    }

    pub fn remaining(&self, client_ip: &str) -> RemainingQuota {
        let now = Self::now_secs();
        let global_remaining = self
            .global
            .lock()
            .expect("limiter lock poisoned")
            .remaining(now);
        let ip_remaining = match self.per_ip.get_mut(client_ip) {
            Some(mut window) => window.remaining(now),
            None => self.ip_rpm,
        };
        RemainingQuota {
            global_remaining,
            ip_remaining,
            concurrent_available: self
                .concurrent_limit
                .saturating_sub(self.current_concurrent.load(Ordering::Relaxed)),
        }
    }
}
