//! Throttle and track rules.

use super::{
    Extractor, FilterMatch, MatchData, MatchKind, Param, RuleContext, ThrottleData,
};
use crate::error::{BreakwaterError, Result};
use crate::limiter::{Algorithm, Limiter};
use axum::extract::Request;
use std::sync::Arc;

/// A rate limit keyed by a request fingerprint.
pub struct ThrottleRule {
    name: String,
    limit: Param<u64>,
    period: Param<f64>,
    algorithm: Algorithm,
    extractor: Extractor,
}

impl ThrottleRule {
    /// Create a throttle. `limit` and `period` accept constants or
    /// [`Param::per_request`] closures, resolved against each request.
    pub fn new(
        name: impl Into<String>,
        limit: impl Into<Param<u64>>,
        period: impl Into<Param<f64>>,
        algorithm: Algorithm,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            limit: limit.into(),
            period: period.into(),
            algorithm,
            extractor: Arc::new(extractor),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate the throttle: consume one unit for this request's
    /// fingerprint. Returns `Ok(true)` when the request must be rejected.
    pub(crate) async fn matches(&self, req: &mut Request, ctx: &RuleContext) -> Result<bool> {
        let Some(fingerprint) = (self.extractor)(&*req).filter(|f| !f.is_empty()) else {
            return Ok(false);
        };

        let limit = self.limit.resolve(&*req);
        let period = self.period.resolve(&*req);
        let key = format!("{}:{}", self.name, fingerprint);

        let limiter = Limiter::new(key, limit, period, self.algorithm, ctx.storage.clone())?
            .with_clock(ctx.clock.clone())
            .with_events(ctx.events.clone());

        let (matched, data) = match limiter.acquire().await {
            Ok(admission) => (
                false,
                ThrottleData {
                    count: admission.count,
                    limit,
                    period,
                    retry_after: 0.0,
                },
            ),
            Err(BreakwaterError::Throttled { retry_after, .. }) => (
                true,
                ThrottleData {
                    count: limit,
                    limit,
                    period,
                    retry_after,
                },
            ),
            Err(other) => return Err(other),
        };

        FilterMatch {
            rule: self.name.clone(),
            kind: MatchKind::Throttle,
            discriminator: fingerprint,
            data: MatchData::Throttle(data),
        }
        .annotate(req);

        Ok(matched)
    }
}

/// Annotates matching requests without ever blocking them.
///
/// When parameterized with a limit and period, the rule peeks at the
/// matching counter so downstream handlers can see how busy the fingerprint
/// is; it never consumes.
pub struct TrackRule {
    name: String,
    extractor: Extractor,
    limit: Option<Param<u64>>,
    period: Option<Param<f64>>,
}

impl TrackRule {
    pub fn new(
        name: impl Into<String>,
        extractor: impl Fn(&Request) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            extractor: Arc::new(extractor),
            limit: None,
            period: None,
        }
    }

    /// Attach a limit/period pair to observe against.
    #[must_use]
    pub fn with_quota(mut self, limit: impl Into<Param<u64>>, period: impl Into<Param<f64>>) -> Self {
        self.limit = Some(limit.into());
        self.period = Some(period.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Annotate the request. Never decisive.
    pub(crate) async fn observe(&self, req: &mut Request, ctx: &RuleContext) -> Result<()> {
        let Some(fingerprint) = (self.extractor)(&*req).filter(|f| !f.is_empty()) else {
            return Ok(());
        };

        let data = match (&self.limit, &self.period) {
            (Some(limit), Some(period)) => {
                let limit = limit.resolve(&*req);
                let period = period.resolve(&*req);
                let key = format!("{}:{}", self.name, fingerprint);
                let window = (period.ceil() as u64).max(1);
                let count = ctx.storage.get_counter(&key, window).await?;
                MatchData::Throttle(ThrottleData {
                    count,
                    limit,
                    period,
                    retry_after: 0.0,
                })
            }
            _ => MatchData::None,
        };

        FilterMatch {
            rule: self.name.clone(),
            kind: MatchKind::Track,
            discriminator: fingerprint,
            data,
        }
        .annotate(req);

        Ok(())
    }
}
