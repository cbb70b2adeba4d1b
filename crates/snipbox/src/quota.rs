//! Session & quota manager
//!
//! Each anonymous session gets a token bucket (a keyed GCRA limiter), a cap on
//! requests in flight and an abuse counter. Sessions that keep hitting
//! resource ceilings are rejected outright for a while. When the network
//! origin of a session is known, the origin carries its own in-flight cap and
//! abuse counter, so a fresh session label does not escape a ban.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::StateInformationMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::QuotaConfig;
use crate::execution::{Outcome, SessionId};

type KeyedLimiter = RateLimiter<
    SessionId,
    DefaultKeyedStateStore<SessionId>,
    DefaultClock,
    StateInformationMiddleware,
>;

/// Answer to an admission request
#[derive(Debug)]
pub enum Admission {
    /// Holds one of the session's concurrency slots until dropped
    Allowed(AdmissionGuard),
    Throttled { retry_after: Duration },
    /// Session is flagged for abuse
    Rejected { retry_after: Duration },
}

/// Releases the session's (and its origin's) concurrency slot on drop
#[derive(Debug)]
pub struct AdmissionGuard {
    concurrent: Arc<AtomicUsize>,
    origin: Option<Arc<AtomicUsize>>,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        if let Some(ref origin) = self.origin {
            origin.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Snapshot of one session's quota state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionQuota {
    pub client_session_id: SessionId,
    pub tokens_remaining: u32,
    pub concurrent_count: usize,
    /// When the bucket is full again
    pub window_reset_at: SystemTime,
    pub banned: bool,
}

#[derive(Debug)]
struct SessionState {
    concurrent: Arc<AtomicUsize>,
    strikes: VecDeque<Instant>,
    banned_until: Option<Instant>,
    last_seen: Instant,
    /// Bucket level right after the last admission
    tokens_after_admit: u32,
    admitted_at: Option<Instant>,
}

impl SessionState {
    fn new(now: Instant, burst: u32) -> Self {
        Self {
            concurrent: Arc::new(AtomicUsize::new(0)),
            strikes: VecDeque::new(),
            banned_until: None,
            last_seen: now,
            tokens_after_admit: burst,
            admitted_at: None,
        }
    }

    fn ban_remaining(&mut self, now: Instant) -> Option<Duration> {
        match self.banned_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                self.banned_until = None;
                None
            }
            None => None,
        }
    }
}

struct QuotaInner {
    config: QuotaConfig,
    limiter: KeyedLimiter,
    sessions: DashMap<SessionId, SessionState>,
}

impl fmt::Debug for QuotaInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaInner")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct QuotaManager {
    inner: Arc<QuotaInner>,
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Self {
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(config.refill_interval())
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        let limiter = RateLimiter::keyed(quota).with_middleware::<StateInformationMiddleware>();

        Self {
            inner: Arc::new(QuotaInner {
                config,
                limiter,
                sessions: DashMap::new(),
            }),
        }
    }

    /// Decide whether `session` may submit another request
    pub fn admit(&self, session: &SessionId) -> Admission {
        let origin = session.origin();
        if let Some(ref origin) = origin
            && let Some(refusal) = self.check_origin(origin)
        {
            return refusal;
        }

        match self.admit_session(session) {
            Admission::Allowed(mut guard) => {
                guard.origin = origin.map(|origin| self.hold_origin(&origin));
                Admission::Allowed(guard)
            }
            refusal => refusal,
        }
    }

    /// Ban and in-flight checks shared by every session from `origin`
    fn check_origin(&self, origin: &SessionId) -> Option<Admission> {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut state = self
            .inner
            .sessions
            .entry(origin.clone())
            .or_insert_with(|| SessionState::new(now, config.burst));
        state.last_seen = now;

        if let Some(retry_after) = state.ban_remaining(now) {
            debug!(%origin, ?retry_after, "rejecting flagged origin");
            return Some(Admission::Rejected { retry_after });
        }
        if state.concurrent.load(Ordering::SeqCst) >= config.max_concurrent_per_origin {
            debug!(%origin, "too many requests in flight from origin");
            return Some(Admission::Throttled {
                retry_after: config.refill_interval(),
            });
        }
        None
    }

    fn hold_origin(&self, origin: &SessionId) -> Arc<AtomicUsize> {
        let config = &self.inner.config;
        let state = self
            .inner
            .sessions
            .entry(origin.clone())
            .or_insert_with(|| SessionState::new(Instant::now(), config.burst));
        state.concurrent.fetch_add(1, Ordering::SeqCst);
        Arc::clone(&state.concurrent)
    }

    fn admit_session(&self, session: &SessionId) -> Admission {
        let inner = &self.inner;
        let config = &inner.config;
        let now = Instant::now();
        let mut state = inner
            .sessions
            .entry(session.clone())
            .or_insert_with(|| SessionState::new(now, config.burst));
        state.last_seen = now;

        if let Some(retry_after) = state.ban_remaining(now) {
            debug!(%session, ?retry_after, "rejecting flagged session");
            return Admission::Rejected { retry_after };
        }

        if state.concurrent.load(Ordering::SeqCst) >= config.max_concurrent_per_session {
            debug!(%session, "too many requests in flight");
            return Admission::Throttled {
                retry_after: config.refill_interval(),
            };
        }

        match inner.limiter.check_key(session) {
            Ok(snapshot) => {
                state.tokens_after_admit = snapshot.remaining_burst_capacity();
                state.admitted_at = Some(now);
                state.concurrent.fetch_add(1, Ordering::SeqCst);
                Admission::Allowed(AdmissionGuard {
                    concurrent: Arc::clone(&state.concurrent),
                    origin: None,
                })
            }
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(inner.limiter.clock().now());
                debug!(%session, ?retry_after, "token bucket empty");
                Admission::Throttled { retry_after }
            }
        }
    }

    /// Count resource-ceiling hits toward the abuse threshold of the session
    /// and of its origin
    pub fn record_outcome(&self, session: &SessionId, outcome: Outcome) {
        if outcome != Outcome::ResourceExceeded {
            return;
        }
        self.strike(session);
        if let Some(origin) = session.origin() {
            self.strike(&origin);
        }
    }

    fn strike(&self, session: &SessionId) {
        let config = &self.inner.config;
        let Some(mut state) = self.inner.sessions.get_mut(session) else {
            return;
        };

        let now = Instant::now();
        let window = config.abuse_window();
        state.strikes.push_back(now);
        while let Some(&oldest) = state.strikes.front() {
            if now.duration_since(oldest) <= window {
                break;
            }
            state.strikes.pop_front();
        }

        if state.strikes.len() >= config.abuse_threshold {
            warn!(
                %session,
                strikes = state.strikes.len(),
                ban_secs = config.ban_duration_secs,
                "flagging session for repeated resource exhaustion"
            );
            state.banned_until = Some(now + config.ban_duration());
            state.strikes.clear();
        }
    }

    pub fn snapshot(&self, session: &SessionId) -> SessionQuota {
        let config = &self.inner.config;
        let refill = config.refill_interval().max(Duration::from_millis(1));
        let now = Instant::now();

        let Some(mut state) = self.inner.sessions.get_mut(session) else {
            return SessionQuota {
                client_session_id: session.clone(),
                tokens_remaining: config.burst,
                concurrent_count: 0,
                window_reset_at: SystemTime::now(),
                banned: false,
            };
        };

        let refilled = state
            .admitted_at
            .map(|at| (now.duration_since(at).as_millis() / refill.as_millis()) as u32)
            .unwrap_or(config.burst);
        let tokens_remaining = state
            .tokens_after_admit
            .saturating_add(refilled)
            .min(config.burst);
        let full_at = state
            .admitted_at
            .map(|at| at + refill * config.burst.saturating_sub(state.tokens_after_admit))
            .unwrap_or(now);

        SessionQuota {
            client_session_id: session.clone(),
            tokens_remaining,
            concurrent_count: state.concurrent.load(Ordering::SeqCst),
            window_reset_at: SystemTime::now() + full_at.saturating_duration_since(now),
            banned: state.ban_remaining(now).is_some(),
        }
    }

    /// Forget sessions that are idle, not banned and have nothing in flight.
    /// Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let inner = &self.inner;
        let idle = inner.config.idle_session();
        let now = Instant::now();
        let before = inner.sessions.len();

        inner.sessions.retain(|_, state| {
            state.concurrent.load(Ordering::SeqCst) > 0
                || state.ban_remaining(now).is_some()
                || now.duration_since(state.last_seen) < idle
        });
        inner.limiter.retain_recent();
        inner.limiter.shrink_to_fit();

        before.saturating_sub(inner.sessions.len())
    }

    pub fn tracked_sessions(&self) -> usize {
        self.inner.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst: u32, refill_ms: u64, concurrent: usize) -> QuotaConfig {
        QuotaConfig {
            burst,
            refill_interval_ms: refill_ms,
            max_concurrent_per_session: concurrent,
            max_concurrent_per_origin: 4,
            abuse_threshold: 3,
            abuse_window_secs: 60,
            ban_duration_secs: 60,
            idle_session_secs: 3600,
        }
    }

    fn manager(burst: u32, refill_ms: u64, concurrent: usize) -> QuotaManager {
        QuotaManager::new(config(burst, refill_ms, concurrent))
    }

    fn exhaust(quota: &QuotaManager, session: &SessionId) {
        for _ in 0..3 {
            quota.record_outcome(session, Outcome::ResourceExceeded);
        }
    }

    fn allowed(admission: Admission) -> AdmissionGuard {
        match admission {
            Admission::Allowed(guard) => guard,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    #[test]
    fn bucket_throttles_after_burst() {
        let quota = manager(2, 60_000, 10);
        let session = SessionId::new("alice");

        let _a = allowed(quota.admit(&session));
        let _b = allowed(quota.admit(&session));
        match quota.admit(&session) {
            Admission::Throttled { retry_after } => {
                assert!(retry_after > Duration::from_secs(50));
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected throttling, got {other:?}"),
        }
    }

    #[test]
    fn sessions_have_separate_buckets() {
        let quota = manager(1, 60_000, 10);
        let _a = allowed(quota.admit(&SessionId::new("alice")));
        assert!(matches!(
            quota.admit(&SessionId::new("alice")),
            Admission::Throttled { .. }
        ));
        let _b = allowed(quota.admit(&SessionId::new("bob")));
    }

    #[test]
    fn concurrency_slot_released_by_guard() {
        let quota = manager(10, 10, 1);
        let session = SessionId::new("alice");

        let guard = allowed(quota.admit(&session));
        assert_eq!(quota.snapshot(&session).concurrent_count, 1);
        assert!(matches!(
            quota.admit(&session),
            Admission::Throttled { .. }
        ));

        drop(guard);
        assert_eq!(quota.snapshot(&session).concurrent_count, 0);
        let _again = allowed(quota.admit(&session));
    }

    #[test]
    fn repeated_resource_exhaustion_flags_session() {
        let quota = manager(100, 10, 10);
        let session = SessionId::new("mallory");
        drop(allowed(quota.admit(&session)));

        quota.record_outcome(&session, Outcome::RuntimeError);
        quota.record_outcome(&session, Outcome::ResourceExceeded);
        quota.record_outcome(&session, Outcome::ResourceExceeded);
        assert!(matches!(quota.admit(&session), Admission::Allowed(_)));

        quota.record_outcome(&session, Outcome::ResourceExceeded);
        match quota.admit(&session) {
            Admission::Rejected { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(quota.snapshot(&session).banned);
        assert!(matches!(
            quota.admit(&SessionId::new("alice")),
            Admission::Allowed(_)
        ));
    }

    #[test]
    fn snapshot_of_unknown_session_is_full() {
        let quota = manager(5, 1000, 2);
        let snapshot = quota.snapshot(&SessionId::new("new"));
        assert_eq!(snapshot.tokens_remaining, 5);
        assert_eq!(snapshot.concurrent_count, 0);
        assert!(snapshot.window_reset_at <= SystemTime::now());
    }

    #[test]
    fn snapshot_tracks_spent_tokens() {
        let quota = manager(5, 60_000, 5);
        let session = SessionId::new("alice");
        let _a = allowed(quota.admit(&session));
        let _b = allowed(quota.admit(&session));

        let snapshot = quota.snapshot(&session);
        assert_eq!(snapshot.tokens_remaining, 3);
        assert_eq!(snapshot.concurrent_count, 2);
        let until = snapshot
            .window_reset_at
            .duration_since(SystemTime::now())
            .unwrap();
        assert!(until > Duration::from_secs(119));
        assert!(until <= Duration::from_secs(120));
    }

    #[tokio::test]
    async fn bucket_refills_after_interval() {
        let quota = manager(2, 50, 10);
        let session = SessionId::new("alice");

        drop(allowed(quota.admit(&session)));
        drop(allowed(quota.admit(&session)));
        assert!(matches!(
            quota.admit(&session),
            Admission::Throttled { .. }
        ));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(quota.snapshot(&session).tokens_remaining, 2);
        assert!(quota.snapshot(&session).window_reset_at <= SystemTime::now());
        drop(allowed(quota.admit(&session)));
        drop(allowed(quota.admit(&session)));
    }

    #[tokio::test]
    async fn ban_expires_after_duration() {
        let quota = QuotaManager::new(QuotaConfig {
            ban_duration_secs: 1,
            ..config(100, 10, 10)
        });
        let session = SessionId::new("mallory");
        drop(allowed(quota.admit(&session)));
        exhaust(&quota, &session);
        assert!(matches!(
            quota.admit(&session),
            Admission::Rejected { .. }
        ));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(!quota.snapshot(&session).banned);
        drop(allowed(quota.admit(&session)));

        // Strikes were cleared by the ban, so one more does not re-flag
        quota.record_outcome(&session, Outcome::ResourceExceeded);
        drop(allowed(quota.admit(&session)));
    }

    #[test]
    fn banned_origin_stays_banned_under_new_session() {
        let quota = manager(100, 10, 10);
        let first = SessionId::new("session:a").with_origin("ip:10.0.0.7");
        drop(allowed(quota.admit(&first)));
        exhaust(&quota, &first);

        let renamed = SessionId::new("session:b").with_origin("ip:10.0.0.7");
        assert!(matches!(
            quota.admit(&renamed),
            Admission::Rejected { .. }
        ));
        assert!(matches!(
            quota.admit(&SessionId::new("ip:10.0.0.7")),
            Admission::Rejected { .. }
        ));
        let elsewhere = SessionId::new("session:b").with_origin("ip:10.0.0.8");
        drop(allowed(quota.admit(&elsewhere)));
    }

    #[test]
    fn origin_caps_requests_in_flight_across_sessions() {
        let quota = manager(100, 10, 10);
        let guards: Vec<_> = (0..4)
            .map(|i| {
                let session = SessionId::new(format!("session:{i}")).with_origin("ip:10.0.0.7");
                allowed(quota.admit(&session))
            })
            .collect();

        let fifth = SessionId::new("session:4").with_origin("ip:10.0.0.7");
        assert!(matches!(
            quota.admit(&fifth),
            Admission::Throttled { .. }
        ));
        assert_eq!(
            quota.snapshot(&SessionId::new("ip:10.0.0.7")).concurrent_count,
            4
        );

        drop(guards);
        assert_eq!(
            quota.snapshot(&SessionId::new("ip:10.0.0.7")).concurrent_count,
            0
        );
        drop(allowed(quota.admit(&fifth)));
    }

    #[test]
    fn prune_keeps_sessions_with_requests_in_flight() {
        let quota = QuotaManager::new(QuotaConfig {
            idle_session_secs: 0,
            ..QuotaConfig::default()
        });
        let busy = SessionId::new("busy");
        let _guard = allowed(quota.admit(&busy));
        drop(allowed(quota.admit(&SessionId::new("idle"))));

        assert_eq!(quota.prune(), 1);
        assert_eq!(quota.tracked_sessions(), 1);
        assert_eq!(quota.snapshot(&busy).concurrent_count, 1);
    }
}
