//! Intrusion-style ban rules.
//!
//! Fail2ban blocks fingerprints whose circuit breaker is open; failures are
//! pushed in by the host application through [`Fail2BanRule::count`] after
//! it observes a suspicious outcome (a 404 probe, a bad login). Allow2ban is
//! the counterpart: enough well-behaved requests reset the paired breaker.

use super::{Extractor, Fail2BanData, FilterMatch, MatchData, MatchKind, RuleContext};
use crate::breaker::WindowedBreaker;
use crate::error::Result;
use crate::traits::breaker::CircuitBreaker;
use axum::extract::Request;
use std::sync::Arc;

/// Blocks fingerprints banned by a circuit breaker.
pub struct Fail2BanRule {
    name: String,
    maxretry: u32,
    findtime: f64,
    bantime: f64,
    extractor: Extractor,
    breaker: Arc<dyn CircuitBreaker>,
}

impl Fail2BanRule {
    /// Create a fail2ban rule backed by the default [`WindowedBreaker`]
    /// with `failure_threshold = maxretry`, `failure_window = findtime`,
    /// `reset_timeout = bantime`.
    pub fn new(
        name: impl Into<String>,
        maxretry: u32,
        findtime: f64,
        bantime: f64,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        let breaker = Arc::new(WindowedBreaker::new(maxretry, findtime, bantime));
        Self::with_breaker(name, maxretry, findtime, bantime, extractor, breaker)
    }

    /// Create a fail2ban rule over an externally supplied breaker.
    pub fn with_breaker(
        name: impl Into<String>,
        maxretry: u32,
        findtime: f64,
        bantime: f64,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
        breaker: Arc<dyn CircuitBreaker>,
    ) -> Self {
        Self {
            name: name.into(),
            maxretry,
            findtime,
            bantime,
            extractor: Arc::new(extractor),
            breaker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn breaker(&self) -> &Arc<dyn CircuitBreaker> {
        &self.breaker
    }

    /// Whether this request's fingerprint is banned. Annotates on match.
    pub(crate) fn matches(&self, req: &mut Request) -> bool {
        let Some(fingerprint) = (self.extractor)(&*req).filter(|f| !f.is_empty()) else {
            return false;
        };
        if !self.breaker.is_open(&fingerprint) {
            return false;
        }

        FilterMatch {
            rule: self.name.clone(),
            kind: MatchKind::Fail2Ban,
            discriminator: fingerprint.clone(),
            data: MatchData::Fail2Ban(Fail2BanData {
                maxretry: self.maxretry,
                findtime: self.findtime,
                bantime: self.bantime,
                failures: self.breaker.failure_count(&fingerprint),
                time_until_unban: self.breaker.time_until_close(&fingerprint),
            }),
        }
        .annotate(req);
        true
    }

    /// Host back-channel: record the outcome of a request after the fact.
    ///
    /// Returns whether the fingerprint is banned after recording. Requests
    /// without a fingerprint are ignored.
    pub fn count(&self, req: &Request, did_fail: bool) -> bool {
        let Some(fingerprint) = (self.extractor)(req).filter(|f| !f.is_empty()) else {
            return false;
        };
        if did_fail {
            self.breaker.record_failure(&fingerprint);
        } else {
            self.breaker.record_success(&fingerprint);
        }
        self.breaker.is_open(&fingerprint)
    }
}

/// Resets a paired fail2ban breaker after enough successful requests.
///
/// Keeps its own counter per fingerprint: once `maxretry` requests land
/// within `findtime` seconds, the breaker of the fail2ban rule with the
/// same name is reset for that fingerprint. Never blocks a request.
pub struct Allow2BanRule {
    name: String,
    maxretry: u32,
    findtime: f64,
    extractor: Extractor,
}

impl Allow2BanRule {
    pub fn new(
        name: impl Into<String>,
        maxretry: u32,
        findtime: f64,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            maxretry,
            findtime,
            extractor: Arc::new(extractor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Count this request; on reaching the threshold, reset the paired
    /// breaker and start a fresh count.
    pub(crate) async fn observe(
        &self,
        req: &mut Request,
        ctx: &RuleContext,
        fail2bans: &[Fail2BanRule],
    ) -> Result<()> {
        let Some(fingerprint) = (self.extractor)(req).filter(|f| !f.is_empty()) else {
            return Ok(());
        };

        let key = format!("allow2ban:{}:{}", self.name, fingerprint);
        let window = (self.findtime.ceil() as u64).max(1);
        let count = ctx.storage.increment_counter(&key, window, 1).await?;
        if count < self.maxretry as u64 {
            return Ok(());
        }

        if let Some(paired) = fail2bans.iter().find(|f| f.name() == self.name) {
            paired.breaker().reset(&fingerprint);
            tracing::info!(
                target: "breakwater.filter",
                rule = %self.name,
                fingerprint = %fingerprint,
                successes = count,
                "Allow2ban reset paired ban"
            );
        }
        ctx.storage.reset_counter(&key, window).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::events::NullSink;
    use crate::rules::test::{request, request_with_header};
    use crate::storage::{InMemoryStorage, MemoryStorageConfig};

    fn ip_extractor(req: &Request) -> Option<String> {
        req.headers()
            .get("x-client-ip")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    fn rule_with_clock(
        maxretry: u32,
        findtime: f64,
        bantime: f64,
        clock: Arc<MockClock>,
    ) -> Fail2BanRule {
        let breaker = Arc::new(WindowedBreaker::with_clock(
            maxretry, findtime, bantime, clock,
        ));
        Fail2BanRule::with_breaker("probes", maxretry, findtime, bantime, ip_extractor, breaker)
    }

    #[test]
    fn test_ban_after_maxretry_failures() {
        let clock = Arc::new(MockClock::new(1000.0));
        let rule = rule_with_clock(3, 60.0, 300.0, clock.clone());
        let req = request_with_header("/wp-admin", "x-client-ip", "1.2.3.4");

        assert!(!rule.count(&req, true));
        assert!(!rule.count(&req, true));
        assert!(rule.count(&req, true));

        let mut banned = request_with_header("/", "x-client-ip", "1.2.3.4");
        assert!(rule.matches(&mut banned));
        let matched = banned.extensions().get::<FilterMatch>().unwrap();
        assert_eq!(matched.kind, MatchKind::Fail2Ban);
        match &matched.data {
            MatchData::Fail2Ban(data) => {
                assert_eq!(data.maxretry, 3);
                assert_eq!(data.failures, 3);
                assert!(data.time_until_unban > 299.0);
            }
            other => panic!("expected fail2ban data, got {:?}", other),
        }
    }

    #[test]
    fn test_ban_expires_after_bantime() {
        let clock = Arc::new(MockClock::new(1000.0));
        let rule = rule_with_clock(1, 60.0, 300.0, clock.clone());
        let req = request_with_header("/", "x-client-ip", "1.2.3.4");

        rule.count(&req, true);
        let mut banned = request_with_header("/", "x-client-ip", "1.2.3.4");
        assert!(rule.matches(&mut banned));

        clock.advance(301.0);
        let mut unbanned = request_with_header("/", "x-client-ip", "1.2.3.4");
        assert!(!rule.matches(&mut unbanned));
    }

    #[test]
    fn test_success_closes_ban_only_after_timeout() {
        let clock = Arc::new(MockClock::new(1000.0));
        let rule = rule_with_clock(1, 60.0, 300.0, clock.clone());
        let req = request_with_header("/", "x-client-ip", "1.2.3.4");

        assert!(rule.count(&req, true));

        // Successes reported while the ban holds do not lift it.
        assert!(rule.count(&req, false));
        clock.advance(299.0);
        assert!(rule.count(&req, false));

        // Past the reset timeout a success closes the circuit.
        clock.advance(2.0);
        assert!(!rule.count(&req, false));
        let mut check = request_with_header("/", "x-client-ip", "1.2.3.4");
        assert!(!rule.matches(&mut check));

        // The failure count restarted with the closed circuit.
        assert_eq!(rule.breaker().failure_count("1.2.3.4"), 0);
        assert!(rule.count(&req, true));
    }

    #[test]
    fn test_no_fingerprint_is_never_banned() {
        let clock = Arc::new(MockClock::new(1000.0));
        let rule = rule_with_clock(1, 60.0, 300.0, clock);

        let anonymous = request("/");
        assert!(!rule.count(&anonymous, true));
        let mut check = request("/");
        assert!(!rule.matches(&mut check));
    }

    #[tokio::test]
    async fn test_allow2ban_resets_paired_breaker() {
        let clock = Arc::new(MockClock::new(1000.0));
        let storage = Arc::new(InMemoryStorage::with_clock(
            MemoryStorageConfig::default(),
            clock.clone(),
        ));
        let ctx = RuleContext {
            storage,
            clock: clock.clone(),
            events: Arc::new(NullSink),
        };

        let fail2ban = rule_with_clock(1, 60.0, 300.0, clock.clone());
        let allow2ban = Allow2BanRule::new("probes", 2, 60.0, ip_extractor);
        let fail2bans = vec![fail2ban];

        // Ban the fingerprint.
        let mut req = request_with_header("/", "x-client-ip", "1.2.3.4");
        fail2bans[0].count(&req, true);
        assert!(fail2bans[0].breaker().is_open("1.2.3.4"));

        // One good request is not enough.
        allow2ban.observe(&mut req, &ctx, &fail2bans).await.unwrap();
        assert!(fail2bans[0].breaker().is_open("1.2.3.4"));

        // The second reaches maxretry and lifts the ban.
        allow2ban.observe(&mut req, &ctx, &fail2bans).await.unwrap();
        assert!(!fail2bans[0].breaker().is_open("1.2.3.4"));
    }
}
