//! Bucket guard.
//!
//! Normalizes the bucket argument and decides whether the tool may modify
//! it.  The checks are layered and run in a fixed order:
//!
//! 1. protected-prefix check against the backup bucket name,
//! 2. naming pattern match, which also extracts the environment,
//! 3. reserved-environment check.
//!
//! Bucket naming and protected-bucket naming are independent, so a bucket
//! can slip past one check and still be caught by a later one.

use regex::Regex;

use crate::config::GuardConfig;
use crate::errors::GuardError;

/// `<org>-thanos-lts-<token>-<environment>`.
pub const BUCKET_PATTERN: &str = r"^[a-zA-Z0-9]+-thanos-lts-[-a-zA-Z0-9]+-([a-z]+)$";

/// A bucket name that passed the guard, plus the environment derived from
/// it.  Computed once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketBinding {
    bucket: String,
    environment: String,
}

impl BucketBinding {
    /// Bucket name without scheme or trailing separators.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Label value to insert into each metadata document.
    pub fn environment(&self) -> &str {
        &self.environment
    }
}

/// Validates bucket arguments against a fixed policy.
pub struct Guard {
    protected_bucket: String,
    reserved_environment: String,
    pattern: Regex,
}

impl Guard {
    pub fn new(config: &GuardConfig) -> anyhow::Result<Self> {
        let pattern = Regex::new(BUCKET_PATTERN)?;
        Ok(Self {
            protected_bucket: config.protected_bucket.clone(),
            reserved_environment: config.reserved_environment.clone(),
            pattern,
        })
    }

    /// Normalize `raw` and check it against the policy.
    pub fn validate(&self, raw: &str) -> Result<BucketBinding, GuardError> {
        let bucket = normalize_bucket(raw);
        if bucket.is_empty() {
            return Err(GuardError::Empty);
        }

        if bucket.starts_with(&self.protected_bucket) {
            return Err(GuardError::Protected {
                bucket: bucket.to_string(),
            });
        }

        let environment = self
            .pattern
            .captures(bucket)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| GuardError::PatternMismatch {
                bucket: bucket.to_string(),
                pattern: BUCKET_PATTERN.to_string(),
            })?;

        if environment == self.reserved_environment {
            return Err(GuardError::ReservedEnvironment {
                bucket: bucket.to_string(),
                environment,
            });
        }

        Ok(BucketBinding {
            bucket: bucket.to_string(),
            environment,
        })
    }
}

/// Strip a leading `scheme://` and any trailing `/`.
pub fn normalize_bucket(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_scheme = match trimmed.split_once("://") {
        Some((scheme, rest)) if is_scheme(scheme) => rest,
        _ => trimmed,
    };
    without_scheme.trim_end_matches('/')
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        _ => false,
    }
}
