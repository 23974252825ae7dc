//! Filter rules.
//!
//! Each rule inspects a request and produces a verdict for the pipeline,
//! annotating the request's extensions with what matched. Side effects are
//! confined to those annotations and to limiter/breaker state.

mod ban;
mod lists;
mod throttle;

pub use ban::{Allow2BanRule, Fail2BanRule};
pub use lists::{BlocklistRule, SafelistRule};
pub use throttle::{ThrottleRule, TrackRule};

use crate::clock::SharedClock;
use crate::events::EventSink;
use crate::storage::Storage;
use axum::extract::Request;
use std::fmt;
use std::sync::Arc;

/// Derives a request's per-rule identity. `None` (or empty) means the rule
/// does not apply to this request.
pub type Extractor = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

/// A pure request predicate, used by safelists and blocklists.
pub type Predicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// A rule parameter that is either a constant or a function of the request.
///
/// Per-request parameters are resolved on every evaluation, never cached.
#[derive(Clone)]
pub enum Param<T> {
    Fixed(T),
    PerRequest(Arc<dyn Fn(&Request) -> T + Send + Sync>),
}

impl<T: Copy> Param<T> {
    pub fn fixed(value: T) -> Self {
        Self::Fixed(value)
    }

    pub fn per_request(f: impl Fn(&Request) -> T + Send + Sync + 'static) -> Self {
        Self::PerRequest(Arc::new(f))
    }

    pub(crate) fn resolve(&self, req: &Request) -> T {
        match self {
            Self::Fixed(value) => *value,
            Self::PerRequest(f) => f(req),
        }
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Param<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "Fixed({:?})", value),
            Self::PerRequest(_) => f.write_str("PerRequest(..)"),
        }
    }
}

impl From<u64> for Param<u64> {
    fn from(value: u64) -> Self {
        Self::Fixed(value)
    }
}

impl From<f64> for Param<f64> {
    fn from(value: f64) -> Self {
        Self::Fixed(value)
    }
}

/// Which rule category produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Safelist,
    Blocklist,
    Throttle,
    Track,
    Fail2Ban,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Safelist => "safelist",
            Self::Blocklist => "blocklist",
            Self::Throttle => "throttle",
            Self::Track => "track",
            Self::Fail2Ban => "fail2ban",
        };
        f.write_str(name)
    }
}

/// Numeric annotations for a throttle or track match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleData {
    pub count: u64,
    pub limit: u64,
    pub period: f64,
    pub retry_after: f64,
}

/// Numeric annotations for a fail2ban match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fail2BanData {
    pub maxretry: u32,
    pub findtime: f64,
    pub bantime: f64,
    pub failures: u64,
    pub time_until_unban: f64,
}

/// Match metadata attached to the request extensions.
#[derive(Debug, Clone)]
pub struct FilterMatch {
    /// Name of the rule that matched.
    pub rule: String,
    pub kind: MatchKind,
    /// The fingerprint (or predicate target) the rule keyed on.
    pub discriminator: String,
    pub data: MatchData,
}

/// Rule-specific numeric payload of a [`FilterMatch`].
#[derive(Debug, Clone)]
pub enum MatchData {
    None,
    Throttle(ThrottleData),
    Fail2Ban(Fail2BanData),
}

impl FilterMatch {
    pub(crate) fn annotate(self, req: &mut Request) {
        req.extensions_mut().insert(self);
    }
}

/// Shared handles rules evaluate against.
#[derive(Clone)]
pub struct RuleContext {
    pub storage: Arc<dyn Storage>,
    pub clock: SharedClock,
    pub events: Arc<dyn EventSink>,
}

#[cfg(test)]
pub(crate) mod test {
    use axum::extract::Request;
    use axum::body::Body;

    pub fn request(path: &str) -> Request {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    pub fn request_with_header(path: &str, name: &str, value: &str) -> Request {
        Request::builder()
            .uri(path)
            .header(name, value)
            .body(Body::empty())
            .unwrap()
    }
}
