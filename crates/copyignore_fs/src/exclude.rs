//! Exclusion pattern normalization and matching.
//!
//! Patterns are normalized once at construction:
//! - absolute patterns (`C:/x`, `//server/x`, `/x`) become case-insensitive prefixes;
//! - a bare name with no wildcard matches that name at any depth;
//! - `*/name` and `*/name/*` are widened to `**/name/**`;
//! - a wildcard pattern without `/` gets a `**/` prefix;
//! - anything else is a glob used as-is.
//!
//! Candidates are compared with forward slashes. Malformed globs are dropped.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use globset::{GlobBuilder, GlobMatcher};
use regex::Regex;

use crate::spec::EnumPatternForm;

static RE_SIMPLE_DIR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\*/([^*?\[]+?)(?:/\*)?$").expect("static pattern regex is valid")
});

/// Predicate deciding whether a path is left out of the backup.
pub trait Excluder: Send + Sync {
    fn should_exclude(&self, path: &Path) -> bool;
}

////////////////////////////////////////////////////////////////////////////////
// #region Normalization

fn _has_wildcard(c_pattern: &str) -> bool {
    c_pattern.contains(['*', '?', '['])
}

fn _is_absolute_pattern(c_pattern: &str) -> bool {
    let raw = c_pattern.as_bytes();
    let b_drive = raw.len() >= 3 && raw[0].is_ascii_alphabetic() && raw[1] == b':' && raw[2] == b'/';
    b_drive || c_pattern.starts_with('/')
}

/// Normalize one raw pattern. `None` for an empty or blank pattern.
///
/// Whitespace inside a pattern is significant and kept as given.
/// Normalizing an already-normalized pattern returns it unchanged.
pub fn normalize_pattern(pattern_raw: &str) -> Option<(EnumPatternForm, String)> {
    if pattern_raw.trim().is_empty() {
        return None;
    }
    let c_pattern = pattern_raw.replace('\\', "/");
    if _is_absolute_pattern(&c_pattern) {
        return Some((EnumPatternForm::AbsolutePrefix, c_pattern));
    }

    let c_trimmed = c_pattern.trim_end_matches('/');
    if c_trimmed.is_empty() {
        return None;
    }
    if !_has_wildcard(c_trimmed) {
        return Some((EnumPatternForm::Glob, format!("**/{c_trimmed}/**")));
    }
    if let Some(caps) = RE_SIMPLE_DIR_PATTERN.captures(c_trimmed) {
        return Some((EnumPatternForm::Glob, format!("**/{}/**", &caps[1])));
    }
    if !c_trimmed.contains('/') {
        return Some((EnumPatternForm::Glob, format!("**/{c_trimmed}")));
    }
    Some((EnumPatternForm::Glob, c_trimmed.to_string()))
}

/// Candidate path in matcher form: forward slashes, no trailing slash.
pub fn normalize_candidate(path: &Path) -> String {
    let c_path = path.to_string_lossy().replace('\\', "/");
    let c_trimmed = c_path.trim_end_matches('/');
    if c_trimmed.is_empty() {
        return c_path;
    }
    c_trimmed.strip_prefix("./").unwrap_or(c_trimmed).to_string()
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
// #region Matcher

#[derive(Debug, Clone)]
enum TypeCompiledPattern {
    Prefix(String),
    Glob(Vec<GlobMatcher>),
}

#[derive(Debug, Clone)]
struct SpecCompiledPattern {
    c_normalized: String,
    compiled: TypeCompiledPattern,
}

fn _compile_glob(c_glob: &str) -> Result<GlobMatcher, globset::Error> {
    Ok(GlobBuilder::new(c_glob)
        .literal_separator(true)
        .build()?
        .compile_matcher())
}

fn _compile(pattern_raw: &str) -> Option<SpecCompiledPattern> {
    let (enum_form, c_normalized) = normalize_pattern(pattern_raw)?;
    let compiled = match enum_form {
        EnumPatternForm::AbsolutePrefix => TypeCompiledPattern::Prefix(c_normalized.to_lowercase()),
        EnumPatternForm::Glob => {
            let mut l_matchers = Vec::with_capacity(2);
            match _compile_glob(&c_normalized) {
                Ok(matcher) => l_matchers.push(matcher),
                Err(e) => {
                    tracing::debug!(pattern = pattern_raw, error = %e, "Dropping malformed exclude pattern");
                    return None;
                }
            }
            // `dir/**` also matches `dir` itself.
            if let Some(c_dir) = c_normalized.strip_suffix("/**")
                && !c_dir.is_empty()
                && let Ok(matcher) = _compile_glob(c_dir)
            {
                l_matchers.push(matcher);
            }
            TypeCompiledPattern::Glob(l_matchers)
        }
    };
    Some(SpecCompiledPattern {
        c_normalized,
        compiled,
    })
}

/// Compiled set of exclusion patterns. A path is excluded if any pattern matches.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    l_patterns: Vec<SpecCompiledPattern>,
}

impl ExcludeMatcher {
    /// Compile raw patterns. Empty and malformed patterns are dropped.
    pub fn new<I, S>(patterns_raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let l_patterns = patterns_raw
            .into_iter()
            .filter_map(|p| _compile(p.as_ref()))
            .collect();
        Self { l_patterns }
    }

    /// Normalized forms of the retained patterns.
    pub fn patterns(&self) -> Vec<&str> {
        self.l_patterns
            .iter()
            .map(|p| p.c_normalized.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.l_patterns.is_empty()
    }

    /// Match an already-normalized candidate string.
    pub fn is_match_str(&self, c_candidate: &str) -> bool {
        if self.l_patterns.is_empty() {
            return false;
        }
        let c_folded = c_candidate.to_lowercase();
        self.l_patterns.iter().any(|p| match &p.compiled {
            TypeCompiledPattern::Prefix(c_prefix) => c_folded.starts_with(c_prefix.as_str()),
            TypeCompiledPattern::Glob(l_matchers) => l_matchers.iter().any(|m| m.is_match(c_candidate)),
        })
    }
}

impl Excluder for ExcludeMatcher {
    fn should_exclude(&self, path: &Path) -> bool {
        self.is_match_str(&normalize_candidate(path))
    }
}

impl fmt::Display for ExcludeMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.patterns().join(", "))
    }
}

// #endregion
////////////////////////////////////////////////////////////////////////////////
