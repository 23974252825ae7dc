//! Filter configuration DSL.
//!
//! A [`FilterConfig`] is an owned value: build one, hand it to a
//! [`Filter`](super::Filter), and the middleware instance evaluates exactly
//! that rule set. Hot-reload means building a new config and swapping the
//! middleware, not mutating ambient globals.

use super::fingerprint::client_ip;
use crate::events::{EventSink, NullSink};
use crate::limiter::Algorithm;
use crate::rules::{
    Allow2BanRule, BlocklistRule, Fail2BanRule, Param, SafelistRule, ThrottleRule, TrackRule,
};
use axum::extract::Request;
use axum::response::Response;
use std::sync::Arc;

/// Renders a canned response from the annotated request.
pub type Responder = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// Rule set and rendering hooks for one filter instance.
pub struct FilterConfig {
    pub(crate) enabled: bool,
    pub(crate) trust_proxy: bool,
    pub(crate) safelists: Vec<SafelistRule>,
    pub(crate) blocklists: Vec<BlocklistRule>,
    pub(crate) throttles: Vec<ThrottleRule>,
    pub(crate) tracks: Vec<TrackRule>,
    pub(crate) fail2bans: Vec<Fail2BanRule>,
    pub(crate) allow2bans: Vec<Allow2BanRule>,
    pub(crate) throttled_responder: Option<Responder>,
    pub(crate) blocklisted_responder: Option<Responder>,
    pub(crate) events: Arc<dyn EventSink>,
}

impl FilterConfig {
    pub fn builder() -> FilterConfigBuilder {
        FilterConfigBuilder::new()
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trust_proxy: false,
            safelists: Vec::new(),
            blocklists: Vec::new(),
            throttles: Vec::new(),
            tracks: Vec::new(),
            fail2bans: Vec::new(),
            allow2bans: Vec::new(),
            throttled_responder: None,
            blocklisted_responder: None,
            events: Arc::new(NullSink),
        }
    }
}

/// Builder exposing the rule DSL.
#[must_use = "builder does nothing until you call build()"]
pub struct FilterConfigBuilder {
    config: FilterConfig,
}

impl FilterConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FilterConfig::default(),
        }
    }

    /// Disable the whole filter; requests delegate straight downstream.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Trust `X-Forwarded-For` / `X-Real-IP` when resolving client IPs.
    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.config.trust_proxy = trust;
        self
    }

    /// Add a named safelist predicate.
    pub fn safelist(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&Request) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.safelists.push(SafelistRule::new(name, predicate));
        self
    }

    /// Safelist a single client IP.
    pub fn safelist_ip(self, ip: impl Into<String>) -> Self {
        let ip = ip.into();
        let name = format!("safelist_ip:{}", ip);
        self.safelist(name, move |req| client_ip(req).as_deref() == Some(ip.as_str()))
    }

    /// Add a named blocklist predicate.
    pub fn blocklist(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&Request) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.blocklists.push(BlocklistRule::new(name, predicate));
        self
    }

    /// Blocklist a single client IP.
    pub fn blocklist_ip(self, ip: impl Into<String>) -> Self {
        let ip = ip.into();
        let name = format!("blocklist_ip:{}", ip);
        self.blocklist(name, move |req| client_ip(req).as_deref() == Some(ip.as_str()))
    }

    /// Add a throttle of `limit` requests per `period` seconds.
    pub fn throttle(
        mut self,
        name: impl Into<String>,
        limit: impl Into<Param<u64>>,
        period: impl Into<Param<f64>>,
        algorithm: Algorithm,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.config
            .throttles
            .push(ThrottleRule::new(name, limit, period, algorithm, extractor));
        self
    }

    /// Add a tracker. Use [`TrackRule::with_quota`] via [`Self::track_rule`]
    /// for a parameterized tracker.
    pub fn track(
        mut self,
        name: impl Into<String>,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.config.tracks.push(TrackRule::new(name, extractor));
        self
    }

    /// Add a fully built tracker.
    pub fn track_rule(mut self, rule: TrackRule) -> Self {
        self.config.tracks.push(rule);
        self
    }

    /// Add a fail2ban rule banning fingerprints for `bantime` seconds after
    /// `maxretry` failures within `findtime` seconds.
    pub fn fail2ban(
        mut self,
        name: impl Into<String>,
        maxretry: u32,
        findtime: f64,
        bantime: f64,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.config
            .fail2bans
            .push(Fail2BanRule::new(name, maxretry, findtime, bantime, extractor));
        self
    }

    /// Add a fully built fail2ban rule (e.g. one sharing an external
    /// breaker).
    pub fn fail2ban_rule(mut self, rule: Fail2BanRule) -> Self {
        self.config.fail2bans.push(rule);
        self
    }

    /// Add an allow2ban rule: `maxretry` requests within `findtime` seconds
    /// reset the fail2ban rule of the same name for that fingerprint.
    pub fn allow2ban(
        mut self,
        name: impl Into<String>,
        maxretry: u32,
        findtime: f64,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.config
            .allow2bans
            .push(Allow2BanRule::new(name, maxretry, findtime, extractor));
        self
    }

    /// Override the throttled response renderer.
    pub fn throttled_responder(
        mut self,
        responder: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.config.throttled_responder = Some(Arc::new(responder));
        self
    }

    /// Override the blocklisted response renderer.
    pub fn blocklisted_responder(
        mut self,
        responder: impl Fn(&Request) -> Response + Send + Sync + 'static,
    ) -> Self {
        self.config.blocklisted_responder = Some(Arc::new(responder));
        self
    }

    /// Attach an event sink forwarded to every throttle's limiter.
    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.config.events = events;
        self
    }

    pub fn build(self) -> FilterConfig {
        self.config
    }
}

impl Default for FilterConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_enabled_and_empty() {
        let config = FilterConfig::default();
        assert!(config.enabled);
        assert!(!config.trust_proxy);
        assert!(config.safelists.is_empty());
        assert!(config.throttles.is_empty());
    }

    #[test]
    fn test_builder_collects_rules() {
        let config = FilterConfig::builder()
            .safelist_ip("127.0.0.1")
            .blocklist_ip("1.2.3.4")
            .throttle("req/ip", 300u64, 300.0, Algorithm::FixedWindow, client_ip)
            .track("everything", client_ip)
            .fail2ban("probes", 3, 60.0, 300.0, client_ip)
            .allow2ban("probes", 10, 60.0, client_ip)
            .build();

        assert_eq!(config.safelists.len(), 1);
        assert_eq!(config.blocklists.len(), 1);
        assert_eq!(config.throttles.len(), 1);
        assert_eq!(config.tracks.len(), 1);
        assert_eq!(config.fail2bans.len(), 1);
        assert_eq!(config.allow2bans.len(), 1);
        assert_eq!(config.safelists[0].name(), "safelist_ip:127.0.0.1");
    }

    #[test]
    fn test_disabled_builder() {
        let config = FilterConfig::builder().enabled(false).build();
        assert!(!config.enabled);
    }
}
