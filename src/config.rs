//! Engine configuration.
//!
//! Loaded from TOML. Every section and field is optional:
//!
//! ```toml
//! [guard]
//! max_stack_depth = 256
//! max_allocated_bytes = 10000000
//! max_iterations = 1000000
//! explicit_layout_exception = '^<StaticData>(\.|$)'
//!
//! [guard.api]
//! allow = ["console.*", "math.*"]
//! deny = ["fs.*"]
//!
//! [isolation]
//! libraries = ["console", "math"]
//! stack_size = 8388608
//!
//! [logging]
//! filter = "tracebox=debug"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::guard::{
    ApiRules, GuardLimits, GuardPolicy, PolicyError, DEFAULT_ALLOWED_APIS, DEFAULT_DENIED_APIS,
    DEFAULT_EXPLICIT_LAYOUT_EXCEPTION,
};
use crate::isolation::ContextSetup;

/// Smallest worker stack accepted (64 KiB)
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// File is not valid TOML for this schema
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// Guard section does not describe a valid policy
    #[error("invalid guard policy: {0}")]
    Policy(#[from] PolicyError),
    /// A value is out of range
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// API rule lists
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Allowed patterns
    pub allow: Vec<String>,
    /// Denied patterns, taking precedence
    pub deny: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            allow: DEFAULT_ALLOWED_APIS.iter().map(ToString::to_string).collect(),
            deny: DEFAULT_DENIED_APIS.iter().map(ToString::to_string).collect(),
        }
    }
}

/// `[guard]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Resource limits
    #[serde(flatten)]
    pub limits: GuardLimits,
    /// Regex of type names allowed to declare explicit layout
    pub explicit_layout_exception: String,
    /// API rules
    pub api: ApiConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            limits: GuardLimits::default(),
            explicit_layout_exception: DEFAULT_EXPLICIT_LAYOUT_EXCEPTION.to_string(),
            api: ApiConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Build the policy this section describes
    ///
    /// # Errors
    /// Returns error if a limit is zero or a pattern is invalid
    pub fn policy(&self) -> Result<GuardPolicy, ConfigError> {
        let GuardLimits {
            max_stack_depth,
            max_allocated_bytes,
            max_iterations,
        } = self.limits;
        if max_stack_depth == 0 || max_allocated_bytes == 0 || max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "guard limits must be greater than zero".to_string(),
            ));
        }
        let api = ApiRules::new(&self.api.allow, &self.api.deny)?;
        Ok(GuardPolicy::new(
            self.limits,
            api,
            &self.explicit_layout_exception,
        )?)
    }
}

/// `[logging]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "tracebox=info".to_string(),
        }
    }
}

/// Complete engine configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Guard policy
    pub guard: GuardConfig,
    /// Isolation context setup
    pub isolation: ContextSetup,
    /// Logging
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load and validate a config file
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns error if the text cannot be parsed or validated
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that the schema alone cannot
    ///
    /// # Errors
    /// Returns the first invalid value found
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.guard.policy()?;
        if self.isolation.stack_size < MIN_STACK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "isolation stack size must be at least {MIN_STACK_SIZE} bytes"
            )));
        }
        if self.isolation.name_prefix.is_empty() {
            return Err(ConfigError::Invalid(
                "isolation name prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the policy and install it as the process-wide one
    ///
    /// # Errors
    /// Returns error if the policy is invalid or one is already installed
    pub fn install_policy(&self) -> Result<std::sync::Arc<GuardPolicy>, ConfigError> {
        Ok(GuardPolicy::install(self.guard.policy()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [guard]
            max_stack_depth = 32

            [guard.api]
            allow = ["console.*"]

            [isolation]
            libraries = ["console"]
            "#,
        )
        .unwrap();

        assert_eq!(config.guard.limits.max_stack_depth, 32);
        assert_eq!(
            config.guard.limits.max_iterations,
            GuardLimits::default().max_iterations
        );
        assert_eq!(config.guard.api.deny, ApiConfig::default().deny);
        assert_eq!(config.isolation.libraries, vec!["console".to_string()]);

        let policy = config.guard.policy().unwrap();
        assert!(policy.api.is_allowed("console.write"));
        assert!(!policy.api.is_allowed("math.abs"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            EngineConfig::from_toml_str("[guard]\nmax_iterations = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[guard]\nexplicit_layout_exception = '('"),
            Err(ConfigError::Policy(PolicyError::InvalidPattern(_)))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[guard.api]\ndeny = ['fs']"),
            Err(ConfigError::Policy(PolicyError::InvalidApiPattern(_)))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[isolation]\nstack_size = 16"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("[guard"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("tracebox-config-{}.toml", std::process::id()));
        std::fs::write(&path, "[logging]\nfilter = \"debug\"\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.logging.filter, "debug");
    }
}
