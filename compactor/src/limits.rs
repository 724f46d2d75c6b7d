// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Per tenant retention limits.

use std::{collections::HashMap, sync::Arc, time::Duration};

use common_util::config::ReadableDuration;
use serde::{Deserialize, Serialize};

use crate::labels::Matcher;

/// Retention override for streams matching a selector. Higher priority rules
/// win when several match the same stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamRetention {
    pub priority: i32,
    pub period: ReadableDuration,
    pub matchers: Vec<Matcher>,
}

impl Default for StreamRetention {
    fn default() -> Self {
        Self {
            priority: 0,
            period: ReadableDuration::days(31),
            matchers: Vec::new(),
        }
    }
}

/// Source of per tenant retention settings.
pub trait Limits: Send + Sync {
    /// Default retention for `tenant`.
    fn retention_period(&self, tenant: &str) -> Duration;

    /// Per stream overrides for `tenant`, any order.
    fn stream_retention(&self, tenant: &str) -> Vec<StreamRetention>;

    /// The smallest retention period configured anywhere, the conservative
    /// bound used to decide whether a table may hold expired chunks at all.
    fn smallest_retention_period(&self) -> Duration;
}

pub type LimitsRef = Arc<dyn Limits>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantLimits {
    pub retention_period: Option<ReadableDuration>,
    pub stream_retention: Vec<StreamRetention>,
}

/// Limits loaded once from configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticLimits {
    pub retention_period: ReadableDuration,
    pub tenants: HashMap<String, TenantLimits>,
}

impl Default for StaticLimits {
    fn default() -> Self {
        Self {
            retention_period: ReadableDuration::days(31),
            tenants: HashMap::new(),
        }
    }
}

impl Limits for StaticLimits {
    fn retention_period(&self, tenant: &str) -> Duration {
        self.tenants
            .get(tenant)
            .and_then(|t| t.retention_period)
            .unwrap_or(self.retention_period)
            .into()
    }

    fn stream_retention(&self, tenant: &str) -> Vec<StreamRetention> {
        self.tenants
            .get(tenant)
            .map(|t| t.stream_retention.clone())
            .unwrap_or_default()
    }

    fn smallest_retention_period(&self) -> Duration {
        let mut smallest = self.retention_period;
        for tenant in self.tenants.values() {
            if let Some(period) = tenant.retention_period {
                smallest = smallest.min(period);
            }
            for rule in &tenant.stream_retention {
                smallest = smallest.min(rule.period);
            }
        }
        smallest.into()
    }
}
