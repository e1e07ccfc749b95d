//! Threshold conditions.
//!
//! A condition is a comparison operator and a signed integer threshold, written
//! as e.g. `>100`, `<= -5` or `<>0`. Several spellings are accepted on input;
//! [`Condition`]'s `Display` produces a single canonical spelling per operator.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

static CONDITION_RE: OnceLock<Regex> = OnceLock::new();

fn condition_regex() -> &'static Regex {
    CONDITION_RE.get_or_init(|| {
        // Longest operators first so `>=` is not read as `>` followed by `=`.
        Regex::new(r"^\s*(==|!=|<>|>=|<=|=|>|<)\s*([+-]?\d+)\s*$")
            .unwrap_or_else(|e| unreachable!("condition grammar is a valid regex: {e}"))
    })
}

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `<=`
    Le,
}

impl Comparison {
    /// All operators, in canonical order.
    pub const ALL: [Self; 6] = [Self::Eq, Self::Ne, Self::Gt, Self::Lt, Self::Ge, Self::Le];

    /// Canonical spelling.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        match token {
            "=" | "==" => Some(Self::Eq),
            "!=" | "<>" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }

    /// The operator that holds exactly when `self` does not, at the same threshold.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Gt => Self::Le,
            Self::Lt => Self::Ge,
            Self::Ge => Self::Lt,
            Self::Le => Self::Gt,
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
        }
    }

    /// Apply the comparison as `value <op> threshold`.
    #[must_use]
    pub const fn holds(self, value: i64, threshold: i64) -> bool {
        match self {
            Self::Eq => value == threshold,
            Self::Ne => value != threshold,
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Ge => value >= threshold,
            Self::Le => value <= threshold,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A parsed threshold condition.
///
/// # Examples
///
/// ```
/// use kyrocount::{Comparison, Condition};
///
/// let cond: Condition = ">= 10".parse().unwrap();
/// assert_eq!(cond.comparison, Comparison::Ge);
/// assert_eq!(cond.to_string(), ">=10");
/// assert_eq!(cond.reverse().to_string(), "<10");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition {
    /// Comparison operator.
    pub comparison: Comparison,
    /// Integer threshold the value is compared against.
    pub threshold: i64,
}

impl Condition {
    /// Creates a condition from its parts.
    #[must_use]
    pub const fn new(comparison: Comparison, threshold: i64) -> Self {
        Self {
            comparison,
            threshold,
        }
    }

    /// Parses a condition string.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidCondition` when the text does not match
    /// the grammar or the threshold does not fit in an `i64`.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidCondition {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let caps = condition_regex()
            .captures(input)
            .ok_or_else(|| invalid("expected an operator (=, !=, <>, >, <, >=, <=) followed by an integer"))?;

        let comparison = Comparison::from_token(&caps[1]).ok_or_else(|| invalid("unrecognized operator"))?;
        let threshold = caps[2]
            .parse::<i64>()
            .map_err(|_| invalid("threshold is out of range"))?;

        Ok(Self::new(comparison, threshold))
    }

    /// The logically reversed condition at the same threshold.
    ///
    /// For every value exactly one of `self` and `self.reverse()` holds.
    #[must_use]
    pub const fn reverse(self) -> Self {
        Self::new(self.comparison.reverse(), self.threshold)
    }

    /// Returns true if `value` satisfies this condition.
    #[must_use]
    pub const fn is_satisfied_by(self, value: i64) -> bool {
        self.comparison.holds(value, self.threshold)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.comparison, self.threshold)
    }
}

impl FromStr for Condition {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_accepted_spelling() {
        let cases = [
            ("=5", Comparison::Eq),
            ("==5", Comparison::Eq),
            ("!=5", Comparison::Ne),
            ("<>5", Comparison::Ne),
            (">5", Comparison::Gt),
            ("<5", Comparison::Lt),
            (">=5", Comparison::Ge),
            ("<=5", Comparison::Le),
        ];
        for (input, expected) in cases {
            let cond = Condition::parse(input).unwrap();
            assert_eq!(cond.comparison, expected, "{input}");
            assert_eq!(cond.threshold, 5);
        }
    }

    #[test]
    fn parses_signed_thresholds_and_whitespace() {
        assert_eq!(Condition::parse("  >=  -12 ").unwrap(), Condition::new(Comparison::Ge, -12));
        assert_eq!(Condition::parse("<+3").unwrap(), Condition::new(Comparison::Lt, 3));
    }

    #[test]
    fn serialization_is_canonical() {
        assert_eq!(Condition::parse("<> 7").unwrap().to_string(), "!=7");
        assert_eq!(Condition::parse("== -1").unwrap().to_string(), "=-1");
        assert_eq!(Condition::parse("<=0").unwrap().to_string(), "<=0");
    }

    #[test]
    fn parse_serialize_parse_is_stable() {
        for input in ["=0", "<>-4", "> 100", "<-9000", ">= 1", "<=  42", "==7"] {
            let parsed = Condition::parse(input).unwrap();
            let reparsed = Condition::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "{input}");
        }
        for cmp in Comparison::ALL {
            let cond = Condition::new(cmp, i64::MIN);
            assert_eq!(Condition::parse(&cond.to_string()).unwrap(), cond);
        }
    }

    #[test]
    fn reverse_is_an_involution() {
        for cmp in Comparison::ALL {
            assert_eq!(cmp.reverse().reverse(), cmp);
        }
        assert_eq!(Comparison::Gt.reverse(), Comparison::Le);
        assert_eq!(Comparison::Lt.reverse(), Comparison::Ge);
        assert_eq!(Comparison::Eq.reverse(), Comparison::Ne);
    }

    #[test]
    fn reverse_partitions_values() {
        for cmp in Comparison::ALL {
            let cond = Condition::new(cmp, 100);
            for value in [99, 100, 101] {
                assert_ne!(
                    cond.is_satisfied_by(value),
                    cond.reverse().is_satisfied_by(value),
                    "{cond} at {value}"
                );
            }
        }
    }

    #[test]
    fn rejects_malformed_input() {
        for input in ["", ">", "100", ">>1", "=>5", "> 1.5", "> abc", "≥5", "> 99999999999999999999"] {
            let err = Condition::parse(input).unwrap_err();
            assert!(matches!(err, ValidationError::InvalidCondition { .. }), "{input}");
        }
    }

    #[test]
    fn serde_uses_canonical_string() {
        let cond = Condition::new(Comparison::Ne, 3);
        let json = serde_json::to_string(&cond).unwrap();
        assert_eq!(json, "\"!=3\"");
        let back: Condition = serde_json::from_str("\"<> 3\"").unwrap();
        assert_eq!(back, cond);
        assert!(serde_json::from_str::<Condition>("\"nope\"").is_err());
    }
}
