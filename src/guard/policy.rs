//! Guard policy: resource limits, API rules and the explicit-layout exception.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::PolicyError;

/// Resource limits enforced by the run-time checks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardLimits {
    /// Deepest call stack a program may reach
    pub max_stack_depth: usize,
    /// Cumulative bytes a program may allocate
    pub max_allocated_bytes: u64,
    /// Backward jumps plus function entries a program may take
    pub max_iterations: u64,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            max_stack_depth: 256,
            max_allocated_bytes: 10_000_000, // 10 MB
            max_iterations: 1_000_000,
        }
    }
}

/// One API pattern: `library.member` or `library.*`
#[derive(Clone, Debug, PartialEq, Eq)]
enum ApiPattern {
    Exact(String),
    Library(String),
}

impl ApiPattern {
    fn parse(pattern: &str) -> Result<Self, PolicyError> {
        let invalid = || PolicyError::InvalidApiPattern(pattern.to_string());
        let (library, member) = pattern.split_once('.').ok_or_else(invalid)?;
        if library.is_empty() || member.is_empty() || member.contains('.') {
            return Err(invalid());
        }
        if member == "*" {
            Ok(Self::Library(library.to_string()))
        } else {
            Ok(Self::Exact(pattern.to_string()))
        }
    }

    fn matches(&self, api: &str) -> bool {
        match self {
            Self::Exact(name) => name == api,
            Self::Library(library) => api
                .split_once('.')
                .is_some_and(|(prefix, _)| prefix == library),
        }
    }
}

/// Allow/deny rules for external API calls.
///
/// Deny rules take precedence; an API matched by no allow rule is denied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiRules {
    allow: Vec<ApiPattern>,
    deny: Vec<ApiPattern>,
}

impl ApiRules {
    /// Build rules from pattern lists
    ///
    /// # Errors
    /// Returns error if a pattern is malformed
    pub fn new<S: AsRef<str>>(allow: &[S], deny: &[S]) -> Result<Self, PolicyError> {
        let parse = |patterns: &[S]| {
            patterns
                .iter()
                .map(|p| ApiPattern::parse(p.as_ref()))
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(Self {
            allow: parse(allow)?,
            deny: parse(deny)?,
        })
    }

    /// Whether a program may call `api`
    #[must_use]
    pub fn is_allowed(&self, api: &str) -> bool {
        !self.deny.iter().any(|p| p.matches(api)) && self.allow.iter().any(|p| p.matches(api))
    }
}

/// Default allowed APIs: the pure host libraries
pub const DEFAULT_ALLOWED_APIS: &[&str] = &[
    "console.*",
    "output.*",
    "inspect.*",
    "string.*",
    "math.*",
];

/// Default denied APIs
pub const DEFAULT_DENIED_APIS: &[&str] = &["env.*", "fs.*", "net.*", "process.*"];

/// Compiler-generated static data blocks use explicit layout legitimately
pub const DEFAULT_EXPLICIT_LAYOUT_EXCEPTION: &str = r"^<StaticData>(\.|$)";

/// Everything the guard enforces
#[derive(Clone, Debug)]
pub struct GuardPolicy {
    /// Resource limits
    pub limits: GuardLimits,
    /// External API rules
    pub api: ApiRules,
    /// Types allowed to declare explicit layout
    pub explicit_layout_exception: Regex,
}

static GLOBAL: OnceLock<Arc<GuardPolicy>> = OnceLock::new();

impl GuardPolicy {
    /// Build a policy
    ///
    /// # Errors
    /// Returns error if the exception pattern is not a valid regex
    pub fn new(limits: GuardLimits, api: ApiRules, exception: &str) -> Result<Self, PolicyError> {
        let explicit_layout_exception =
            Regex::new(exception).map_err(|e| PolicyError::InvalidPattern(e.to_string()))?;
        Ok(Self {
            limits,
            api,
            explicit_layout_exception,
        })
    }

    /// The process-wide policy, built on first use
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::default())))
    }

    /// Install the process-wide policy. Only possible before first use.
    ///
    /// # Errors
    /// Returns error if a policy is already in place
    pub fn install(policy: Self) -> Result<Arc<Self>, PolicyError> {
        let policy = Arc::new(policy);
        GLOBAL
            .set(Arc::clone(&policy))
            .map_err(|_| PolicyError::AlreadyInstalled)?;
        Ok(policy)
    }

    /// Whether a type may declare explicit layout
    #[must_use]
    pub fn allows_explicit_layout(&self, type_name: &str) -> bool {
        self.explicit_layout_exception.is_match(type_name)
    }
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            limits: GuardLimits::default(),
            api: ApiRules::new(DEFAULT_ALLOWED_APIS, DEFAULT_DENIED_APIS)
                .expect("default API patterns are well-formed"),
            explicit_layout_exception: Regex::new(DEFAULT_EXPLICIT_LAYOUT_EXCEPTION)
                .expect("default layout exception is a valid regex"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let policy = GuardPolicy::default();
        assert!(policy.api.is_allowed("console.write_line"));
        assert!(policy.api.is_allowed("math.max"));
        assert!(!policy.api.is_allowed("fs.read_text"));
        assert!(!policy.api.is_allowed("unknown.thing"));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let rules = ApiRules::new(&["math.*"], &["math.random"]).unwrap();
        assert!(rules.is_allowed("math.abs"));
        assert!(!rules.is_allowed("math.random"));
    }

    #[test]
    fn test_library_pattern_does_not_match_prefixes() {
        let rules = ApiRules::new(&["math.*"], &[]).unwrap();
        assert!(!rules.is_allowed("mathx.abs"));
    }

    #[test]
    fn test_malformed_patterns_rejected() {
        assert!(ApiRules::new(&["console"], &[]).is_err());
        assert!(ApiRules::new(&[".write"], &[]).is_err());
        assert!(ApiRules::new(&["a.b.c"], &[]).is_err());
    }

    #[test]
    fn test_explicit_layout_exception() {
        let policy = GuardPolicy::default();
        assert!(policy.allows_explicit_layout("<StaticData>"));
        assert!(policy.allows_explicit_layout("<StaticData>.Block16"));
        assert!(!policy.allows_explicit_layout("Overlay"));
        assert!(!policy.allows_explicit_layout("My<StaticData>"));
    }

    #[test]
    fn test_invalid_exception_regex() {
        let err = GuardPolicy::new(GuardLimits::default(), ApiRules::default(), "(").unwrap_err();
        assert!(matches!(err, PolicyError::InvalidPattern(_)));
    }
}
