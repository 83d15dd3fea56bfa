use std::time::Duration;

use crate::error::{AgentError, Result};

pub const DEFAULT_MODEL: &str = "gpt-5.2";
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Knobs for one agent process. Every session started by the process reads
/// the same values.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Steps allowed before the session ends as budget-exhausted.
    pub max_steps: usize,
    /// Consecutive error steps that abort the session.
    pub error_threshold: u32,
    pub navigation_timeout: Duration,
    /// Pause after load-complete so client-side rendering can catch up.
    pub navigation_settle: Duration,
    pub bridge_timeout: Duration,
    pub reinject_pause: Duration,
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    /// DevTools endpoint of an already running Chrome, tried before launching one.
    pub chrome_debug_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 50,
            error_threshold: 3,
            navigation_timeout: Duration::from_secs(10),
            navigation_settle: Duration::from_millis(800),
            bridge_timeout: Duration::from_secs(5),
            reinject_pause: Duration::from_millis(300),
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            chrome_debug_url: "http://127.0.0.1:9222".to_string(),
        }
    }
}

impl AgentConfig {
    /// Reads the process environment. Call `dotenvy::dotenv()` first if a
    /// `.env` file should take part. Range checks are left to `validate`,
    /// so callers can layer overrides on top before checking.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(key) = lookup("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()) {
            config.api_key = Some(key);
        }
        if let Some(base) = lookup("OPENAI_BASE_URL") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(model) = lookup("TABPILOT_MODEL") {
            config.model = model;
        }
        if let Some(url) = lookup("TABPILOT_CHROME_DEBUG_URL") {
            config.chrome_debug_url = url;
        }
        if let Some(raw) = lookup("TABPILOT_MAX_STEPS") {
            config.max_steps = parse_number("TABPILOT_MAX_STEPS", &raw)?;
        }
        if let Some(raw) = lookup("TABPILOT_ERROR_THRESHOLD") {
            config.error_threshold = parse_number("TABPILOT_ERROR_THRESHOLD", &raw)?;
        }
        if let Some(raw) = lookup("TABPILOT_NAV_TIMEOUT_MS") {
            config.navigation_timeout =
                Duration::from_millis(parse_number("TABPILOT_NAV_TIMEOUT_MS", &raw)?);
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(AgentError::Config("max_steps must be at least 1".into()));
        }
        if self.error_threshold == 0 {
            return Err(AgentError::Config(
                "error_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| AgentError::Config(format!("{key} must be a number, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_steps, 50);
        assert_eq!(config.error_threshold, 3);
        assert_eq!(config.navigation_timeout, Duration::from_secs(10));
        assert_eq!(config.navigation_settle, Duration::from_millis(800));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn env_overrides_budget_and_threshold() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("TABPILOT_MAX_STEPS", "12"),
            ("TABPILOT_ERROR_THRESHOLD", "5"),
            ("OPENAI_BASE_URL", "http://localhost:8080/v1/"),
        ]))
        .unwrap();
        assert_eq!(config.max_steps, 12);
        assert_eq!(config.error_threshold, 5);
        assert_eq!(config.api_base, "http://localhost:8080/v1");
    }

    #[test]
    fn unparsable_values_are_rejected_on_load() {
        assert!(matches!(
            AgentConfig::from_lookup(lookup(&[("TABPILOT_ERROR_THRESHOLD", "three")])),
            Err(AgentError::Config(_))
        ));
    }

    #[test]
    fn zero_is_rejected_by_validate_not_by_load() {
        let config = AgentConfig::from_lookup(lookup(&[("TABPILOT_MAX_STEPS", "0")])).unwrap();
        assert_eq!(config.max_steps, 0);
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));

        let config = AgentConfig {
            error_threshold: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(AgentError::Config(_))));
    }

    #[test]
    fn override_after_load_rescues_a_zero_budget() {
        let mut config = AgentConfig::from_lookup(lookup(&[("TABPILOT_MAX_STEPS", "0")])).unwrap();
        config.max_steps = 5;
        assert!(config.validate().is_ok());
    }
}
