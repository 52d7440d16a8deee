//! Environment-variable configuration of the lifecycle controllers.

use std::time::Duration;

use snafu::{ResultExt, Snafu};

/// How long the ownership controller waits for a claim's owner to appear
/// before treating the claim as a potential orphan.
pub const GRACE_PERIOD_ENV: &str = "RESOURCECLAIM_GRACE_PERIOD";

/// Age past which a granted claim whose owner never appeared is deleted.
pub const MAX_ORPHAN_AGE_ENV: &str = "RESOURCECLAIM_MAX_ORPHAN_AGE";

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ORPHAN_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("invalid duration {value:?} in {variable}"))]
    InvalidDuration {
        source: humantime::DurationError,
        variable: &'static str,
        value: String,
    },
}

/// Thresholds of the ownership controller.
#[derive(Clone, Copy, Debug)]
pub struct OwnershipConfig {
    pub grace_period: Duration,
    pub max_orphan_age: Duration,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            max_orphan_age: DEFAULT_MAX_ORPHAN_AGE,
        }
    }
}

impl OwnershipConfig {
    /// Reads the thresholds from the environment, keeping the 30 second
    /// defaults for unset variables.
    pub fn from_env() -> Result<Self, Error> {
        Ok(Self {
            grace_period: duration_from_env(GRACE_PERIOD_ENV)?.unwrap_or(DEFAULT_GRACE_PERIOD),
            max_orphan_age: duration_from_env(MAX_ORPHAN_AGE_ENV)?.unwrap_or(DEFAULT_MAX_ORPHAN_AGE),
        })
    }
}

fn duration_from_env(variable: &'static str) -> Result<Option<Duration>, Error> {
    match std::env::var(variable) {
        Ok(value) => humantime::parse_duration(&value)
            .map(Some)
            .context(InvalidDurationSnafu { variable, value }),
        Err(_) => Ok(None),
    }
}
