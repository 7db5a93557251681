/// Timeout expressions: the text a user configures for a timeout, kept verbatim,
/// and turned into a number only when an execution starts.
///
/// An expression is either a plain integer (`"60"`) or text containing
/// parameter references (`"${TIMEOUT}"`, `"$TIMEOUT"`) that are substituted from
/// the execution's parameters before parsing.
use regex::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
#[cfg(test)]
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Parameter bindings of one execution (name -> value).
pub type Parameters = BTreeMap<String, String>;

/// Shortest timeout the supervisor honours unless reconfigured.
///
/// Three minutes keeps a mistyped or unresolved expression from killing a
/// build within seconds of starting. Set `supervisor.minimum_timeout_secs`
/// to go lower.
pub const DEFAULT_MINIMUM_TIMEOUT: Duration = Duration::from_secs(3 * 60);

static MINIMUM_TIMEOUT_MILLIS: AtomicU64 =
    AtomicU64::new(DEFAULT_MINIMUM_TIMEOUT.as_millis() as u64);

#[cfg(test)]
static FLOOR_OVERRIDE_LOCK: Mutex<()> = Mutex::new(());

/// `${NAME}` or `$NAME`.
static PARAMETER_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_.]+)\}|\$([A-Za-z0-9_]+)").expect("parameter pattern compiles")
});

/// Current process-wide minimum timeout.
pub fn minimum_timeout() -> Duration {
    Duration::from_millis(MINIMUM_TIMEOUT_MILLIS.load(Ordering::Acquire))
}

/// Replace the process-wide minimum timeout.
pub fn set_minimum_timeout(floor: Duration) {
    let millis = u64::try_from(floor.as_millis()).unwrap_or(u64::MAX);
    MINIMUM_TIMEOUT_MILLIS.store(millis, Ordering::Release);
}

/// Scoped override of the process-wide minimum timeout.
///
/// The previous value is restored when the guard drops. Overrides are
/// serialized: a second `FloorOverride::set` blocks until the first guard
/// is gone, so parallel tests cannot observe each other's floor.
#[cfg(test)]
pub struct FloorOverride {
    previous: Duration,
    _lock: MutexGuard<'static, ()>,
}

#[cfg(test)]
impl FloorOverride {
    pub fn set(floor: Duration) -> Self {
        let lock = FLOOR_OVERRIDE_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = minimum_timeout();
        set_minimum_timeout(floor);
        Self {
            previous,
            _lock: lock,
        }
    }
}

#[cfg(test)]
impl Drop for FloorOverride {
    fn drop(&mut self) {
        set_minimum_timeout(self.previous);
    }
}

/// Result of resolving an expression against one execution's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTimeout {
    pub seconds: u64,
    pub is_valid: bool,
}

impl ResolvedTimeout {
    pub const INVALID: ResolvedTimeout = ResolvedTimeout {
        seconds: 0,
        is_valid: false,
    };

    /// The effective timeout: never below `floor`.
    pub fn clamp(self, floor: Duration) -> Duration {
        Duration::from_secs(self.seconds).max(floor)
    }
}

/// A configured timeout value, stored exactly as written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TimeoutExpression(String);

impl TimeoutExpression {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn from_number(value: u64) -> Self {
        Self(value.to_string())
    }

    /// The raw text, byte-for-byte as configured.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute parameter references.
    ///
    /// References to unbound parameters are left in place, so an expression
    /// such as `${TEST}` with no `TEST` parameter stays unparseable.
    pub fn expand(&self, parameters: &Parameters) -> String {
        PARAMETER_REF
            .replace_all(&self.0, |caps: &Captures<'_>| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match parameters.get(name) {
                    Some(value) => value.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Resolve to a non-negative integer, or `None` when the text (after
    /// substitution) is not one.
    pub fn resolve_value(&self, parameters: &Parameters) -> Option<u64> {
        if let Ok(literal) = self.0.trim().parse::<u64>() {
            return Some(literal);
        }
        self.expand(parameters).trim().parse::<u64>().ok()
    }

    /// Resolve as a number of seconds.
    pub fn resolve(&self, parameters: &Parameters) -> ResolvedTimeout {
        match self.resolve_value(parameters) {
            Some(seconds) => ResolvedTimeout {
                seconds,
                is_valid: true,
            },
            None => ResolvedTimeout::INVALID,
        }
    }

    /// Resolve as seconds and clamp against `floor` in one step.
    pub fn effective(&self, parameters: &Parameters, floor: Duration) -> Duration {
        let resolved = self.resolve(parameters);
        if !resolved.is_valid {
            tracing::warn!(
                expression = %self.0,
                floor_ms = floor.as_millis() as u64,
                "timeout expression did not resolve to a number, using the minimum timeout"
            );
        } else if Duration::from_secs(resolved.seconds) < floor {
            tracing::info!(
                expression = %self.0,
                seconds = resolved.seconds,
                floor_ms = floor.as_millis() as u64,
                "timeout is below the minimum timeout, raising it"
            );
        }
        resolved.clamp(floor)
    }
}

impl std::fmt::Display for TimeoutExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TimeoutExpression {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl From<u64> for TimeoutExpression {
    fn from(value: u64) -> Self {
        Self::from_number(value)
    }
}

// Config files may spell a literal timeout as a bare integer.
impl<'de> Deserialize<'de> for TimeoutExpression {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(text) => Self(text),
            Raw::Number(n) => Self(n.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Parameters {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_literal_ignores_parameters() {
        let expr = TimeoutExpression::new("60");
        let resolved = expr.resolve(&params(&[("TIMEOUT", "5")]));
        assert_eq!(
            resolved,
            ResolvedTimeout {
                seconds: 60,
                is_valid: true
            }
        );
    }

    #[test]
    fn test_unbound_reference_is_invalid() {
        let expr = TimeoutExpression::new("${TEST}");
        assert_eq!(expr.resolve(&Parameters::new()), ResolvedTimeout::INVALID);
        assert_eq!(expr.expand(&Parameters::new()), "${TEST}");
    }

    #[test]
    fn test_braced_reference_substituted() {
        let expr = TimeoutExpression::new("${TIMEOUT}");
        let resolved = expr.resolve(&params(&[("TIMEOUT", "15")]));
        assert_eq!(resolved.seconds, 15);
        assert!(resolved.is_valid);
    }

    #[test]
    fn test_bare_reference_substituted() {
        let expr = TimeoutExpression::new("$TIMEOUT");
        assert_eq!(expr.resolve_value(&params(&[("TIMEOUT", "42")])), Some(42));
    }

    #[test]
    fn test_reference_inside_larger_text() {
        let expr = TimeoutExpression::new("${A}0");
        assert_eq!(expr.resolve_value(&params(&[("A", "3")])), Some(30));
    }

    #[test]
    fn test_whitespace_around_value_tolerated() {
        let expr = TimeoutExpression::new(" ${T} ");
        assert_eq!(expr.resolve_value(&params(&[("T", "7 ")])), Some(7));
    }

    #[test]
    fn test_non_numeric_substitution_is_invalid() {
        let expr = TimeoutExpression::new("${TIMEOUT}");
        assert_eq!(
            expr.resolve(&params(&[("TIMEOUT", "soon")])),
            ResolvedTimeout::INVALID
        );
    }

    #[test]
    fn test_negative_is_invalid() {
        assert_eq!(
            TimeoutExpression::new("-5").resolve(&Parameters::new()),
            ResolvedTimeout::INVALID
        );
    }

    #[test]
    fn test_empty_parameter_value_is_invalid() {
        let expr = TimeoutExpression::new("${TIMEOUT}");
        assert!(!expr.resolve(&params(&[("TIMEOUT", "")])).is_valid);
    }

    #[test]
    fn test_clamp_raises_to_floor() {
        let floor = Duration::from_secs(10);
        assert_eq!(ResolvedTimeout::INVALID.clamp(floor), floor);
        let small = ResolvedTimeout {
            seconds: 3,
            is_valid: true,
        };
        assert_eq!(small.clamp(floor), floor);
        let large = ResolvedTimeout {
            seconds: 30,
            is_valid: true,
        };
        assert_eq!(large.clamp(floor), Duration::from_secs(30));
    }

    #[test]
    fn test_unresolvable_behaves_like_floor() {
        let floor = Duration::from_secs(5);
        let unresolved = TimeoutExpression::new("${MISSING}").effective(&Parameters::new(), floor);
        let zero = TimeoutExpression::new("0").effective(&Parameters::new(), floor);
        let explicit = TimeoutExpression::new("5").effective(&Parameters::new(), floor);
        assert_eq!(unresolved, explicit);
        assert_eq!(zero, explicit);
    }

    #[test]
    fn test_valid_value_below_default_floor_is_raised() {
        let eff =
            TimeoutExpression::new("5").effective(&Parameters::new(), DEFAULT_MINIMUM_TIMEOUT);
        assert_eq!(eff, Duration::from_secs(180));
    }

    #[test]
    fn test_zero_floor_keeps_zero() {
        let eff = TimeoutExpression::new("nonsense").effective(&Parameters::new(), Duration::ZERO);
        assert_eq!(eff, Duration::ZERO);
    }

    #[test]
    fn test_floor_override_restores_previous() {
        let before = minimum_timeout();
        {
            let _guard = FloorOverride::set(Duration::ZERO);
            assert_eq!(minimum_timeout(), Duration::ZERO);
        }
        assert_eq!(minimum_timeout(), before);
    }

    #[test]
    fn test_deserialize_accepts_integer_and_string() {
        #[derive(Deserialize)]
        struct Holder {
            timeout: TimeoutExpression,
        }
        let a: Holder = toml::from_str("timeout = 60").unwrap();
        assert_eq!(a.timeout.as_str(), "60");
        let b: Holder = toml::from_str("timeout = \"${TEST}\"").unwrap();
        assert_eq!(b.timeout.as_str(), "${TEST}");
    }

    #[test]
    fn test_serialize_keeps_text_verbatim() {
        let json = serde_json::to_string(&TimeoutExpression::new(" ${TEST} ")).unwrap();
        assert_eq!(json, "\" ${TEST} \"");
    }
}
