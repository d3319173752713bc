// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Interest matching for change-listener targets.
//!
//! Only databases somebody is interested in get a change listener. Before
//! the [`UpdateBatcher`] dirties change listeners it filters the touched
//! databases through an [`InterestMatcher`].
//!
//! [`UpdateBatcher`]: crate::batcher::UpdateBatcher

use regex::RegexSet;

use crate::error::{CoordinatorError, Result};
use crate::store::BoxFuture;

/// Decides which target keys have interested rules.
pub trait InterestMatcher: Send + Sync + 'static {
    /// Return the subset of `keys` that matched at least one rule.
    fn match_with_target_keys(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<String>>;
}

/// Every key is interesting.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl InterestMatcher for MatchAll {
    fn match_with_target_keys(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(keys) })
    }
}

/// Matches keys against a set of regular expressions.
///
/// Patterns are anchored: `user_.*` matches `user_1` but not `old_user_1`.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    set: RegexSet,
}

impl PatternMatcher {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let anchored: Vec<String> = patterns
            .into_iter()
            .map(|p| format!("^(?:{})$", p.as_ref()))
            .collect();
        let set = RegexSet::new(&anchored)
            .map_err(|e| CoordinatorError::Config(format!("invalid interest pattern: {}", e)))?;
        Ok(Self { set })
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.set.is_match(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl InterestMatcher for PatternMatcher {
    fn match_with_target_keys(&self, keys: Vec<String>) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(keys.into_iter().filter(|k| self.is_match(k)).collect()) })
    }
}
