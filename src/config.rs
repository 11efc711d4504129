//! Token issuance configuration.

use std::time::Duration;

use rand::Rng;

/// Lower bound of the default token lifetime.
pub const DEFAULT_MIN_LIFETIME: Duration = Duration::from_secs(10);

/// Upper bound of the default token lifetime.
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30);

/// Errors from [`TokenConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The minimum lifetime is zero.
    ZeroLifetime,
    /// The lifetime window is inverted.
    InvertedLifetime { min: Duration, max: Duration },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroLifetime => write!(f, "min_lifetime must be > 0"),
            ConfigError::InvertedLifetime { min, max } => {
                write!(f, "min_lifetime ({min:?}) must be <= max_lifetime ({max:?})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parameters applied when a new token is created.
///
/// Each token draws its lifetime uniformly from `[min_lifetime, max_lifetime]`
/// so that tokens created together do not all expire in the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenConfig {
    pub min_lifetime: Duration,
    pub max_lifetime: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            min_lifetime: DEFAULT_MIN_LIFETIME,
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }
}

impl TokenConfig {
    /// Fixed lifetime, no jitter. Used for long-lived identities.
    pub fn with_lifetime(lifetime: Duration) -> Self {
        Self {
            min_lifetime: lifetime,
            max_lifetime: lifetime,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_lifetime.is_zero() {
            return Err(ConfigError::ZeroLifetime);
        }
        if self.min_lifetime > self.max_lifetime {
            return Err(ConfigError::InvertedLifetime {
                min: self.min_lifetime,
                max: self.max_lifetime,
            });
        }
        Ok(())
    }

    /// Draw a lifetime in seconds. An inverted window collapses to the
    /// minimum.
    pub fn draw_lifetime_secs(&self) -> f64 {
        let min = self.min_lifetime.as_secs_f64();
        let max = self.max_lifetime.as_secs_f64();
        if max <= min {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }
}
