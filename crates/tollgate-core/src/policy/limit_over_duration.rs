//! Built-in restriction method: a ceiling over an ISO-8601 window.
//!
//! `methodOptions = {limit, duration}`. The method sums the counts of the
//! governed resource's stored acquisitions and of the matching request
//! items whose `requested` falls inside `[now - window, ..)`, and refuses
//! with the overflow amount when the sum exceeds `limit`. Future-dated
//! requests count against the window; stored entries older than the window
//! are ignored and left to the pruning machinery.

use async_trait::async_trait;
use serde::Deserialize;

use crate::duration::parse_window;

use super::error::MethodError;
use super::{MethodContext, MethodOutcome, RestrictionMethod};

/// Wire name of the built-in method.
pub const LIMIT_OVER_DURATION: &str = "limitOverDuration";

/// Options for [`LimitOverDuration`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitOverDurationOptions {
    /// Maximum units acquirable within the window; must be positive.
    pub limit: u64,
    /// ISO-8601 duration of the window.
    pub duration: String,
}

impl LimitOverDurationOptions {
    /// Parses and validates options from a restriction's `methodOptions`.
    ///
    /// # Errors
    ///
    /// Returns [`MethodError::InvalidOptions`] for a shape mismatch, a zero
    /// limit, or an unparseable duration.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, MethodError> {
        let options: Self =
            serde_json::from_value(value.clone()).map_err(|e| MethodError::InvalidOptions {
                method: LIMIT_OVER_DURATION.to_string(),
                reason: e.to_string(),
            })?;
        if options.limit == 0 {
            return Err(MethodError::InvalidOptions {
                method: LIMIT_OVER_DURATION.to_string(),
                reason: "limit must be a positive integer".to_string(),
            });
        }
        options.window_millis()?;
        Ok(options)
    }

    /// The window in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`MethodError::InvalidOptions`] when the duration does not
    /// parse.
    pub fn window_millis(&self) -> Result<u64, MethodError> {
        parse_window(&self.duration).map_err(|e| MethodError::InvalidOptions {
            method: LIMIT_OVER_DURATION.to_string(),
            reason: e.to_string(),
        })
    }
}

/// The built-in limit-over-duration method.
#[derive(Debug)]
pub struct LimitOverDuration;

#[async_trait]
impl RestrictionMethod for LimitOverDuration {
    async fn apply(&self, ctx: MethodContext<'_>) -> Result<MethodOutcome, MethodError> {
        let options = LimitOverDurationOptions::from_value(&ctx.restriction.method_options)?;
        let window = options.window_millis()?;
        let start = ctx.now.saturating_sub(window);
        let resource = &ctx.restriction.resource;

        let mut total: u64 = 0;
        if let Some(entries) = ctx.acquired.get(resource) {
            total += entries
                .iter()
                .filter(|e| e.requested >= start)
                .map(|e| e.count)
                .sum::<u64>();
        }
        total += ctx
            .request
            .iter()
            .filter(|item| {
                item.resource == *resource
                    && item.requested.is_some_and(|requested| requested >= start)
            })
            .map(|item| item.count)
            .sum::<u64>();

        let excess = total.saturating_sub(options.limit);
        if excess > 0 {
            tracing::debug!(
                restriction = %ctx.restriction.id,
                resource = %resource,
                total,
                limit = options.limit,
                excess,
                "limit over duration exceeded"
            );
        }
        Ok(MethodOutcome {
            authorized: excess == 0,
            excess,
            ttl: Some(window),
            tracked_resources: None,
        })
    }
}
