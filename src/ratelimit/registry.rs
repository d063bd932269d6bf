//! Named limiters, one per protected endpoint class.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use super::limiter::{Backend, LimiterOptions, RateLimiter};
use super::policy::Policy;
use super::redis_log::RedisEventLog;
use crate::config::{BackendConfig, FloodgateConfig, PolicyOverride};
use crate::error::{FloodgateError, Result};

/// A class of endpoint sharing one rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    /// One-time password issuance and email subscription
    Otp,
    /// Generic API traffic
    Api,
    /// Contact form submissions
    ContactForm,
    /// Bulk data exports
    BulkData,
}

impl EndpointClass {
    /// Every class, in registry order.
    pub const ALL: [EndpointClass; 4] = [
        EndpointClass::Otp,
        EndpointClass::Api,
        EndpointClass::ContactForm,
        EndpointClass::BulkData,
    ];

    /// Stable name used in configuration and external keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Otp => "otp",
            EndpointClass::Api => "api",
            EndpointClass::ContactForm => "contact_form",
            EndpointClass::BulkData => "bulk_data",
        }
    }

    /// Window and budget applied when configuration does not override them.
    pub fn default_limits(&self) -> (Duration, u64) {
        match self {
            EndpointClass::Otp => (Duration::from_secs(15 * 60), 5),
            EndpointClass::Api => (Duration::from_secs(60 * 60), 100),
            EndpointClass::ContactForm => (Duration::from_secs(10 * 60), 3),
            EndpointClass::BulkData => (Duration::from_secs(60 * 60), 1000),
        }
    }

    /// The default policy for this class.
    pub fn default_policy(&self) -> Result<Policy> {
        let (window, max_requests) = self.default_limits();
        Policy::new(window, max_requests)
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointClass {
    type Err = FloodgateError;

    fn from_str(s: &str) -> Result<Self> {
        EndpointClass::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| FloodgateError::Config(format!("unknown endpoint class: {}", s)))
    }
}

impl Serialize for EndpointClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EndpointClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// The fixed table of limiters, built once at startup.
///
/// Every endpoint class has exactly one limiter. The table is never mutated
/// after construction; share it behind an `Arc` and look limiters up with
/// [`get`](Self::get).
#[derive(Debug)]
pub struct LimiterRegistry {
    limiters: HashMap<EndpointClass, RateLimiter>,
}

impl LimiterRegistry {
    /// Build the registry with the default policy for every class.
    pub fn new(backend: Backend, options: &LimiterOptions) -> Result<Self> {
        Self::with_overrides(backend, options, &HashMap::new())
    }

    /// Build the registry, replacing the default policy of any class in `overrides`.
    pub fn with_overrides(
        backend: Backend,
        options: &LimiterOptions,
        overrides: &HashMap<EndpointClass, PolicyOverride>,
    ) -> Result<Self> {
        let mut limiters = HashMap::with_capacity(EndpointClass::ALL.len());

        for class in EndpointClass::ALL {
            let policy = match overrides.get(&class) {
                Some(o) => Policy::new(Duration::from_secs(o.window_secs), o.max_requests)
                    .map_err(|e| match e {
                        FloodgateError::InvalidPolicy(msg) => {
                            FloodgateError::InvalidPolicy(format!("{} limiter: {}", class, msg))
                        }
                        other => other,
                    })?,
                None => class.default_policy()?,
            };

            info!(
                class = %class,
                window = ?policy.window(),
                limit = policy.max_requests(),
                backend = ?backend.kind(),
                "Rate limiter configured"
            );

            limiters.insert(
                class,
                RateLimiter::with_options(class.as_str(), policy, backend.clone(), options),
            );
        }

        Ok(Self { limiters })
    }

    /// Build the registry described by `config`, connecting to Redis if it names one.
    pub async fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let backend = match &config.backend {
            BackendConfig::InProcess => Backend::InProcess,
            BackendConfig::Redis { url } => {
                Backend::Distributed(Arc::new(RedisEventLog::connect(url).await?))
            }
        };

        Self::with_overrides(backend, &config.limiter_options(), &config.policies)
    }

    /// The limiter for `class`.
    pub fn get(&self, class: EndpointClass) -> &RateLimiter {
        // Construction inserts every class.
        &self.limiters[&class]
    }

    /// Arm the cleanup sweep of every in-process limiter.
    pub fn start(&self) -> Result<()> {
        for limiter in self.limiters.values() {
            limiter.start()?;
        }
        Ok(())
    }

    /// Cancel every cleanup sweep.
    pub fn stop(&self) {
        for limiter in self.limiters.values() {
            limiter.stop();
        }
    }

    /// Iterate over all limiters.
    pub fn iter(&self) -> impl Iterator<Item = (EndpointClass, &RateLimiter)> {
        EndpointClass::ALL.into_iter().map(move |class| (class, self.get(class)))
    }
}
