//! The filter tower layer.
//!
//! Evaluation order per request: safelists, then blocklists and fail2bans,
//! then allow2bans (side effects only), then throttles, then trackers.
//! The first decisive verdict short-circuits and renders its canned
//! response; storage errors render the crate error (fail closed).

use super::config::FilterConfig;
use super::fingerprint::{ClientIp, resolve_client_ip};
use crate::clock::{SharedClock, system_clock};
use crate::error::BreakwaterError;
use crate::rules::{FilterMatch, MatchData, RuleContext};
use crate::storage::Storage;
use axum::{
    extract::Request,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tower::{Layer, Service};

/// Re-entry guard: nested filter instances delegate unchanged.
#[derive(Debug, Clone, Copy)]
struct FilterEntered;

/// Outcome of evaluating the rule set for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    Blocked,
    Throttled,
}

pub(crate) struct FilterState {
    config: FilterConfig,
    ctx: RuleContext,
}

impl FilterState {
    async fn evaluate(&self, req: &mut Request) -> Result<Verdict, BreakwaterError> {
        for rule in &self.config.safelists {
            if rule.matches(req) {
                return Ok(Verdict::Pass);
            }
        }
        for rule in &self.config.blocklists {
            if rule.matches(req) {
                return Ok(Verdict::Blocked);
            }
        }
        for rule in &self.config.fail2bans {
            if rule.matches(req) {
                return Ok(Verdict::Blocked);
            }
        }
        for rule in &self.config.allow2bans {
            rule.observe(req, &self.ctx, &self.config.fail2bans).await?;
        }
        for rule in &self.config.throttles {
            if rule.matches(req, &self.ctx).await? {
                return Ok(Verdict::Throttled);
            }
        }
        for rule in &self.config.tracks {
            rule.observe(req, &self.ctx).await?;
        }
        Ok(Verdict::Pass)
    }

    fn render_throttled(&self, req: &Request) -> Response {
        match &self.config.throttled_responder {
            Some(responder) => responder(req),
            None => default_throttled_response(req, &self.ctx.clock),
        }
    }

    fn render_blocklisted(&self, req: &Request) -> Response {
        match &self.config.blocklisted_responder {
            Some(responder) => responder(req),
            None => default_blocklisted_response(),
        }
    }
}

fn default_throttled_response(req: &Request, clock: &SharedClock) -> Response {
    let (limit, retry_after) = match req.extensions().get::<FilterMatch>() {
        Some(FilterMatch {
            data: MatchData::Throttle(data),
            ..
        }) => (data.limit, data.retry_after),
        _ => (0, 0.0),
    };
    let retry_secs = retry_after.max(0.0).ceil() as u64;
    let reset = (clock.now() + retry_after.max(0.0)).ceil() as u64;

    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (header::RETRY_AFTER, retry_secs.to_string()),
            (header::CONTENT_TYPE, "text/plain".to_string()),
            (
                header::HeaderName::from_static("x-ratelimit-limit"),
                limit.to_string(),
            ),
            (
                header::HeaderName::from_static("x-ratelimit-remaining"),
                "0".to_string(),
            ),
            (
                header::HeaderName::from_static("x-ratelimit-reset"),
                reset.to_string(),
            ),
        ],
        "Retry later\n",
    )
        .into_response()
}

fn default_blocklisted_response() -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONTENT_TYPE, "text/plain".to_string())],
        "Forbidden\n",
    )
        .into_response()
}

/// The request filter: owns a rule set and produces tower layers.
///
/// Keep the handle around if the application records fail2ban outcomes via
/// [`count_failure`](Self::count_failure); layers derived from one filter
/// share all rule state.
#[derive(Clone)]
pub struct Filter {
    state: Arc<FilterState>,
}

impl Filter {
    pub fn new(config: FilterConfig, storage: Arc<dyn Storage>) -> Self {
        Self::with_clock(config, storage, system_clock())
    }

    /// Build a filter with an injected clock. Used by tests.
    pub fn with_clock(config: FilterConfig, storage: Arc<dyn Storage>, clock: SharedClock) -> Self {
        let events = config.events.clone();
        Self {
            state: Arc::new(FilterState {
                ctx: RuleContext {
                    storage,
                    clock,
                    events,
                },
                config,
            }),
        }
    }

    /// A tower layer evaluating this filter's rules.
    pub fn layer(&self) -> FilterLayer {
        FilterLayer {
            state: self.state.clone(),
        }
    }

    /// Record an after-action outcome against the named fail2ban rule.
    ///
    /// The host calls this once it knows whether the request misbehaved
    /// (e.g. after rendering a 404). Pass the request as it left the
    /// filter so extractors see its annotations. Returns whether the
    /// fingerprint is now banned; unknown rule names are a configuration
    /// error.
    pub fn count_failure(
        &self,
        rule_name: &str,
        req: &Request,
        did_fail: bool,
    ) -> Result<bool, BreakwaterError> {
        let rule = self
            .state
            .config
            .fail2bans
            .iter()
            .find(|rule| rule.name() == rule_name)
            .ok_or_else(|| {
                BreakwaterError::config(format!("Unknown fail2ban rule: {:?}", rule_name))
            })?;
        Ok(rule.count(req, did_fail))
    }
}

/// Tower layer wrapping services in the filter.
#[derive(Clone)]
pub struct FilterLayer {
    state: Arc<FilterState>,
}

impl<S> Layer<S> for FilterLayer {
    type Service = FilterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        FilterService {
            inner,
            state: self.state.clone(),
        }
    }
}

/// Tower service evaluating the filter per request.
#[derive(Clone)]
pub struct FilterService<S> {
    inner: S,
    state: Arc<FilterState>,
}

impl<S> Service<Request> for FilterService<S>
where
    S: Service<Request> + Clone + Send + Sync + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let state = self.state.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut req = req;

            if req.extensions().get::<FilterEntered>().is_some() {
                let response = inner.call(req).await?;
                return Ok(response.into_response());
            }
            req.extensions_mut().insert(FilterEntered);

            if !state.config.enabled {
                let response = inner.call(req).await?;
                return Ok(response.into_response());
            }

            let ip = resolve_client_ip(&req, state.config.trust_proxy);
            req.extensions_mut().insert(ClientIp(ip));

            match state.evaluate(&mut req).await {
                Ok(Verdict::Pass) => {
                    let response = inner.call(req).await?;
                    Ok(response.into_response())
                }
                Ok(Verdict::Blocked) => Ok(state.render_blocklisted(&req)),
                Ok(Verdict::Throttled) => Ok(state.render_throttled(&req)),
                Err(error) => Ok(error.into_response()),
            }
        })
    }
}
