//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::workflow::Facility;

/// Enrollment flow configuration.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Storage key holding the persisted envelope.
    pub storage_key: String,
    /// Envelope schema version. Bump when `StatePatch` changes shape.
    pub schema_version: u32,
    /// How long a persisted envelope stays resumable.
    pub state_ttl: Duration,
    /// Authenticated session lifetime.
    pub session_timeout: Duration,
    /// How long before expiry the warning fires.
    pub warning_lead: Duration,
    /// Debounce window for auto-save.
    pub autosave_debounce: Duration,
    /// Whether envelopes are obfuscated before hitting storage.
    pub obfuscate: bool,
    /// Currency for plans and payment records.
    pub currency: String,
    /// Shown on the confirmation when the user never picked a facility.
    pub default_facility: Facility,
    pub registration: RegistrationConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            storage_key: "enrollment_flow_state".to_string(),
            schema_version: 1,
            state_ttl: Duration::from_secs(30 * 60),
            session_timeout: Duration::from_secs(30 * 60),
            warning_lead: Duration::from_secs(2 * 60),
            autosave_debounce: Duration::from_millis(500),
            obfuscate: true,
            currency: "INR".to_string(),
            default_facility: Facility::default(),
            registration: RegistrationConfig::default(),
        }
    }
}

/// Secondary registration retry configuration.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Attempt budget per idempotency key.
    pub max_attempts: u32,
    /// Delay unit for exponential backoff.
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Jitter factor in `[0, 1]`. Zero disables jitter.
    pub jitter_factor: f64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }
}

/// Connection settings for an HTTP collaborator.
#[derive(Debug, Clone)]
pub struct HttpEndpointConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub timeout: Duration,
}

impl HttpEndpointConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.into()),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build an HTTP client honouring this endpoint's timeout.
    pub fn build_client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("enrollment-flow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "http_client".into(),
                message: e.to_string(),
            })
    }

    /// `{base_url}/{path}` without doubled slashes.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl FlowConfig {
    /// Build a config from defaults overlaid with `ENROLLMENT_*` env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`FlowConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(key) = lookup("ENROLLMENT_STORAGE_KEY") {
            config.storage_key = key;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "ENROLLMENT_SCHEMA_VERSION")? {
            config.schema_version = v;
        }
        if let Some(ttl) = minutes_var(&lookup, "ENROLLMENT_STATE_TTL_MIN")? {
            config.state_ttl = ttl;
        }
        if let Some(timeout) = minutes_var(&lookup, "ENROLLMENT_SESSION_TIMEOUT_MIN")? {
            config.session_timeout = timeout;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "ENROLLMENT_AUTOSAVE_DEBOUNCE_MS")? {
            config.autosave_debounce = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<bool>(&lookup, "ENROLLMENT_OBFUSCATE")? {
            config.obfuscate = v;
        }
        if let Some(currency) = lookup("ENROLLMENT_CURRENCY") {
            config.currency = currency;
        }
        if let Some(v) = parse_var::<u32>(&lookup, "ENROLLMENT_MAX_ATTEMPTS")? {
            config.registration.max_attempts = v;
        }
        if let Some(v) = parse_var::<u64>(&lookup, "ENROLLMENT_BASE_DELAY_MS")? {
            config.registration.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<f64>(&lookup, "ENROLLMENT_JITTER")? {
            config.registration.jitter_factor = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "storage_key".into(),
                message: "must not be empty".into(),
            });
        }
        if i64::try_from(self.state_ttl.as_millis()).is_err() {
            return Err(ConfigError::InvalidValue {
                key: "state_ttl".into(),
                message: format!("{:?} does not fit in epoch milliseconds", self.state_ttl),
            });
        }
        if self.warning_lead >= self.session_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "warning lead {:?} must be shorter than session timeout {:?}",
                self.warning_lead, self.session_timeout
            )));
        }
        // In-memory session and stored envelope must expire together.
        let drift = if self.state_ttl > self.session_timeout {
            self.state_ttl - self.session_timeout
        } else {
            self.session_timeout - self.state_ttl
        };
        if drift > self.autosave_debounce {
            return Err(ConfigError::Inconsistent(format!(
                "state TTL {:?} and session timeout {:?} diverge by more than the debounce window",
                self.state_ttl, self.session_timeout
            )));
        }
        if self.registration.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "registration.max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.registration.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                key: "registration.jitter_factor".into(),
                message: format!("{} is outside [0, 1]", self.registration.jitter_factor),
            });
        }
        Ok(())
    }

    /// Envelope TTL in whole minutes (rounded up).
    pub fn state_ttl_minutes(&self) -> i64 {
        (self.state_ttl.as_secs() as i64 + 59) / 60
    }
}

/// A whole-minute duration variable, refusing values that overflow.
fn minutes_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(minutes) = parse_var::<u64>(lookup, key)? else {
        return Ok(None);
    };
    minutes
        .checked_mul(60)
        .map(|secs| Some(Duration::from_secs(secs)))
        .ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{minutes} minutes is out of range"),
        })
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
