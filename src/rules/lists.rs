//! Safelist and blocklist rules: pure predicates over the request.

use super::{FilterMatch, MatchData, MatchKind, Predicate};
use axum::extract::Request;
use std::sync::Arc;

/// Requests matching a safelist bypass every other rule.
pub struct SafelistRule {
    name: String,
    predicate: Predicate,
}

impl SafelistRule {
    pub fn new(name: impl Into<String>, predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn matches(&self, req: &mut Request) -> bool {
        if !(self.predicate)(&*req) {
            return false;
        }
        FilterMatch {
            rule: self.name.clone(),
            kind: MatchKind::Safelist,
            discriminator: String::new(),
            data: MatchData::None,
        }
        .annotate(req);
        true
    }
}

/// Requests matching a blocklist receive the blocklisted response.
pub struct BlocklistRule {
    name: String,
    predicate: Predicate,
}

impl BlocklistRule {
    pub fn new(name: impl Into<String>, predicate: impl Fn(&Request) -> bool + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn matches(&self, req: &mut Request) -> bool {
        if !(self.predicate)(&*req) {
            return false;
        }
        tracing::info!(
            target: "breakwater.filter",
            rule = %self.name,
            "Request blocklisted"
        );
        FilterMatch {
            rule: self.name.clone(),
            kind: MatchKind::Blocklist,
            discriminator: String::new(),
            data: MatchData::None,
        }
        .annotate(req);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::test::request;

    #[test]
    fn test_safelist_annotates_on_match() {
        let rule = SafelistRule::new("health", |req: &Request| req.uri().path() == "/health");

        let mut hit = request("/health");
        assert!(rule.matches(&mut hit));
        let matched = hit.extensions().get::<FilterMatch>().unwrap();
        assert_eq!(matched.kind, MatchKind::Safelist);
        assert_eq!(matched.rule, "health");

        let mut miss = request("/api");
        assert!(!rule.matches(&mut miss));
        assert!(miss.extensions().get::<FilterMatch>().is_none());
    }

    #[test]
    fn test_blocklist_annotates_on_match() {
        let rule = BlocklistRule::new("bad-agent", |req: &Request| {
            req.headers()
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .map(|ua| ua.contains("EvilBot"))
                .unwrap_or(false)
        });

        let mut hit = crate::rules::test::request_with_header("/", "user-agent", "EvilBot/1.0");
        assert!(rule.matches(&mut hit));
        assert_eq!(
            hit.extensions().get::<FilterMatch>().unwrap().kind,
            MatchKind::Blocklist
        );

        let mut miss = request("/");
        assert!(!rule.matches(&mut miss));
    }
}
