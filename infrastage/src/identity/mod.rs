//! Infrastructure family id generation.
//!
//! Every resource created during one orchestration run is tagged with a
//! single family id. The id is built from a second-resolution UTC timestamp
//! (so ids sort by creation time) and a short random segment, then conformed
//! to the naming rule of the target provider.

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use crate::core::Provider;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `YYMMDDHHMMSS`
const TIMESTAMP_FORMAT: &str = "%y%m%d%H%M%S";

/// Which characters a generated id may end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndConstraint {
    /// Must end with a lowercase letter.
    Letter,
    /// Must end with a lowercase letter or a digit.
    Alphanumeric,
}

impl EndConstraint {
    fn accepts(self, c: char) -> bool {
        match self {
            Self::Letter => c.is_ascii_lowercase(),
            Self::Alphanumeric => c.is_ascii_lowercase() || c.is_ascii_digit(),
        }
    }
}

/// A provider's resource naming rule.
#[derive(Debug, Clone)]
pub struct NamingRule {
    /// The provider this rule belongs to.
    pub provider: Provider,
    /// Maximum id length.
    pub max_len: usize,
    /// Number of random alphanumeric characters in the middle segment.
    pub random_len: usize,
    /// Whether the random segment starts with a letter.
    pub leading_letter: bool,
    /// End character constraint.
    pub end: EndConstraint,
    pattern: &'static Regex,
}

fn aws_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{0,30}[a-z]$").expect("aws naming regex"))
}

fn azure_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z][a-z0-9-]{0,61}[a-z0-9]$").expect("azure naming regex"))
}

fn gcp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z](?:[-a-z0-9]{0,61}[a-z0-9])?$").expect("gcp naming regex")
    })
}

impl NamingRule {
    /// Returns the naming rule for a provider.
    #[must_use]
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            // Start with letter, end with letter, under 32 chars.
            Provider::Aws => Self {
                provider,
                max_len: 32,
                random_len: 4,
                leading_letter: false,
                end: EndConstraint::Letter,
                pattern: aws_pattern(),
            },
            Provider::Azure => Self {
                provider,
                max_len: 63,
                random_len: 3,
                leading_letter: true,
                end: EndConstraint::Letter,
                pattern: azure_pattern(),
            },
            Provider::Gcp => Self {
                provider,
                max_len: 63,
                random_len: 3,
                leading_letter: true,
                end: EndConstraint::Alphanumeric,
                pattern: gcp_pattern(),
            },
        }
    }

    /// Returns true if `id` satisfies this rule.
    #[must_use]
    pub fn is_valid(&self, id: &str) -> bool {
        id.len() <= self.max_len && self.pattern.is_match(id)
    }

    /// Adjusts a candidate so it satisfies this rule.
    ///
    /// Lowercases, replaces disallowed characters with hyphens, forces a
    /// leading letter, truncates to the maximum length, trims trailing
    /// hyphens, fixes up the final character and pads names shorter than the
    /// rule's minimum.
    #[must_use]
    pub fn conform(&self, candidate: &str) -> String {
        let mut id: String = candidate
            .chars()
            .map(|c| {
                let c = c.to_ascii_lowercase();
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        if !id.starts_with(|c: char| c.is_ascii_lowercase()) {
            id.insert(0, 't');
        }
        id.truncate(self.max_len);
        while id.ends_with('-') {
            id.pop();
        }

        let ends_ok = id.chars().last().is_some_and(|c| self.end.accepts(c));
        if !ends_ok && id.len() > 1 {
            if id.len() >= self.max_len {
                id.pop();
            }
            id.push('z');
        }
        while !self.is_valid(&id) && id.len() < self.max_len {
            id.push('z');
        }
        id
    }
}

/// The identifier threading every resource of one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FamilyId(String);

impl FamilyId {
    /// Wraps an id read back from persisted state.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the random segment after the timestamp.
    ///
    /// Providers with tight resource-name limits use this instead of the
    /// full id. Ids without a hyphen are returned whole.
    #[must_use]
    pub fn short_id(&self) -> &str {
        self.0.split_once('-').map_or(self.0.as_str(), |(_, rest)| rest)
    }
}

impl fmt::Display for FamilyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FamilyId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn pick(rng: &mut impl Rng, charset: &[u8]) -> char {
    char::from(charset[rng.gen_range(0..charset.len())])
}

/// Generates a family id for `rule` from an explicit clock reading and
/// random source.
pub fn generate_at(rule: &NamingRule, now: DateTime<Utc>, rng: &mut impl Rng) -> FamilyId {
    let mut random = String::with_capacity(rule.random_len + 2);
    if rule.leading_letter {
        random.push(pick(rng, LETTERS));
    }
    for _ in 0..rule.random_len {
        random.push(pick(rng, ALPHANUMERIC));
    }
    random.push(match rule.end {
        EndConstraint::Letter => pick(rng, LETTERS),
        EndConstraint::Alphanumeric => pick(rng, ALPHANUMERIC),
    });

    let candidate = format!("t{}-{}", now.format(TIMESTAMP_FORMAT), random);
    FamilyId(rule.conform(&candidate))
}

/// Generates a family id for `rule` from the current time.
#[must_use]
pub fn generate(rule: &NamingRule) -> FamilyId {
    generate_at(rule, Utc::now(), &mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_aws_id_shape() {
        let rule = NamingRule::for_provider(Provider::Aws);
        let id = generate_at(&rule, fixed_time(), &mut StdRng::seed_from_u64(7));

        assert!(id.as_str().starts_with("t250101120000-"));
        assert_eq!(id.as_str().len(), "t250101120000-ab3cd".len());
        assert!(rule.is_valid(id.as_str()), "{id} should be valid");
    }

    #[test]
    fn test_generated_ids_comply_with_every_provider_rule() {
        let mut rng = StdRng::seed_from_u64(42);
        for provider in Provider::ALL {
            let rule = NamingRule::for_provider(provider);
            for _ in 0..500 {
                let id = generate_at(&rule, fixed_time(), &mut rng);
                assert!(rule.is_valid(id.as_str()), "{provider}: {id}");
            }
        }
    }

    #[test]
    fn test_aws_ids_satisfy_the_stricter_rules_too() {
        let aws = NamingRule::for_provider(Provider::Aws);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let id = generate_at(&aws, fixed_time(), &mut rng);
            for provider in Provider::ALL {
                assert!(NamingRule::for_provider(provider).is_valid(id.as_str()));
            }
        }
    }

    #[test]
    fn test_ids_sort_by_creation_time() {
        let rule = NamingRule::for_provider(Provider::Aws);
        let mut rng = StdRng::seed_from_u64(1);
        let earlier = generate_at(&rule, fixed_time(), &mut rng);
        let later = generate_at(
            &rule,
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 1).unwrap(),
            &mut rng,
        );
        assert!(earlier < later);
    }

    #[test]
    fn test_conform_fixes_invalid_candidates() {
        let rule = NamingRule::for_provider(Provider::Aws);

        assert_eq!(rule.conform("9ABC_def"), "t9abc-def");
        assert_eq!(rule.conform("abc-"), "abc");
        assert_eq!(rule.conform("abc1"), "abc1z");

        let long = rule.conform(&"a".repeat(40));
        assert_eq!(long.len(), 32);
        assert!(rule.is_valid(&long));

        let long_digits = rule.conform(&format!("a{}", "1".repeat(40)));
        assert_eq!(long_digits.len(), 32);
        assert!(rule.is_valid(&long_digits));
    }

    #[test]
    fn test_conform_pads_short_candidates() {
        let aws = NamingRule::for_provider(Provider::Aws);
        assert_eq!(aws.conform("a"), "az");
        assert_eq!(aws.conform(""), "tz");
        assert_eq!(aws.conform("-"), "tz");

        let azure = NamingRule::for_provider(Provider::Azure);
        assert!(azure.is_valid(&azure.conform("a")));

        let gcp = NamingRule::for_provider(Provider::Gcp);
        assert_eq!(gcp.conform("a"), "a");
    }

    #[test]
    fn test_gcp_accepts_trailing_digit() {
        let rule = NamingRule::for_provider(Provider::Gcp);
        assert_eq!(rule.conform("t250101120000-abc1"), "t250101120000-abc1");
        assert!(rule.is_valid("t250101120000-abc1"));
        assert!(!rule.is_valid("t250101120000-abc-"));
        assert!(!rule.is_valid("1abc"));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(FamilyId::new("t250101120000-ab3cd").short_id(), "ab3cd");
        assert_eq!(FamilyId::new("plain").short_id(), "plain");
    }

    #[test]
    fn test_generate_uses_current_time() {
        let rule = NamingRule::for_provider(Provider::Azure);
        let first = generate(&rule);
        let second = generate(&rule);

        assert!(rule.is_valid(first.as_str()));
        assert!(rule.is_valid(second.as_str()));
        assert!(first.as_str().starts_with('t'));
    }
}
