//! Descriptor search expressions.
//!
//! Two kinds of expression are supported: a narrow byte pattern (fixed bytes,
//! wildcard bytes, wildcard spans) and an opt-in `regex::bytes` expression.
//! Both are anchored at the first byte of the candidate block.

pub mod patterns;
pub mod validator;

pub use patterns::BytePattern;
pub use validator::{check_checksum, ChecksumCheck, ChecksumField, FieldLocation, LengthField, LengthUnit};

use regex::bytes::{Regex, RegexBuilder};

use crate::error::{CardError, Result};
use crate::signatures::Variables;

/// One way of recognising a file header
#[derive(Debug, Clone)]
pub enum SearchExpression {
    Pattern(BytePattern),
    Regex(Regex),
}

impl SearchExpression {
    /// Parse pattern text (see [`BytePattern`])
    pub fn pattern(text: &str, variables: &Variables) -> Result<Self> {
        BytePattern::parse(text, variables).map(SearchExpression::Pattern)
    }

    /// Compile a byte regex anchored at the window start.
    ///
    /// Unicode mode is off so `.` and classes work on raw bytes.
    pub fn regex(text: &str, variables: &Variables) -> Result<Self> {
        let substituted = patterns::substitute_regex(text, variables)?;
        let anchored = format!("^(?:{})", substituted);
        RegexBuilder::new(&anchored)
            .unicode(false)
            .dot_matches_new_line(true)
            .build()
            .map(SearchExpression::Regex)
            .map_err(|e| CardError::Pattern(format!("invalid regex {:?}: {}", text, e)))
    }

    /// True when the expression matches at offset 0 of `window`
    #[inline]
    pub fn matches(&self, window: &[u8]) -> bool {
        match self {
            SearchExpression::Pattern(pattern) => pattern.matches_at_start(window),
            SearchExpression::Regex(regex) => regex.is_match(window),
        }
    }
}
