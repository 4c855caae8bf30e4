//! Bearer token handling.
//!
//! The server checks tokens through a [`TokenValidator`]; the agent obtains
//! them from a [`TokenSource`]. Both are bound at startup, so an identity
//! provider integration only has to implement one of these traits.

use crate::error::{LeaseError, LeaseResult};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;

/// Server-side token check.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// Accepts any token from a fixed set.
#[derive(Clone, Default)]
pub struct StaticTokenValidator {
    tokens: Vec<String>,
}

impl StaticTokenValidator {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        let mut tokens: Vec<String> = tokens.into_iter().collect();
        tokens.sort();
        tokens.dedup();
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl std::fmt::Debug for StaticTokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenValidator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        // Compare against every entry so timing does not reveal which one matched.
        self.tokens.iter().fold(false, |found, candidate| {
            let equal: bool = candidate.as_bytes().ct_eq(token.as_bytes()).into();
            found | equal
        })
    }
}

/// Load accepted tokens from config values and/or a file.
///
/// # File Format
/// - One token per line
/// - Lines starting with `#` are comments
/// - Empty lines are ignored
/// - Inline comments after the token are supported with `#`
pub fn load_auth_tokens(inline: &[String], file: Option<&Path>) -> Result<Vec<String>> {
    let mut tokens = Vec::new();

    for token in inline {
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("Empty auth token in configuration");
        }
        tokens.push(token.to_string());
    }

    if let Some(path) = file {
        tokens.extend(load_auth_tokens_from_file(path)?);
    }

    Ok(tokens)
}

/// Load tokens from a file, one per line.
pub fn load_auth_tokens_from_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read auth tokens file: {}", path.display()))?;

    Ok(content
        .lines()
        .map(|line| line.split('#').next().unwrap_or(line).trim())
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect())
}

/// Agent-side token provider.
///
/// Called before every lease request. Implementations may block; the agent
/// runs them off the async runtime and bounds the wait.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> LeaseResult<String>;
}

/// A token fixed at startup.
#[derive(Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl TokenSource for StaticTokenSource {
    fn token(&self) -> LeaseResult<String> {
        Ok(self.token.clone())
    }
}

/// A token re-read from a file on every request, so an external helper can
/// refresh it in place.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenSource for FileTokenSource {
    fn token(&self) -> LeaseResult<String> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            LeaseError::AuthFailed(format!(
                "Cannot read token file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        content
            .lines()
            .map(|line| line.split('#').next().unwrap_or(line).trim())
            .find(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                LeaseError::AuthFailed(format!("Token file {} is empty", self.path.display()))
            })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_static_validator() {
        let validator = StaticTokenValidator::new(vec!["alpha".to_string(), "beta".to_string()]);
        assert!(validator.validate("alpha"));
        assert!(validator.validate("beta"));
        assert!(!validator.validate("gamma"));
        assert!(!validator.validate("alph"));
        assert!(!validator.validate(""));
    }

    #[test]
    fn test_empty_validator_rejects_all() {
        let validator = StaticTokenValidator::default();
        assert!(validator.is_empty());
        assert!(!validator.validate("anything"));
    }

    #[test]
    fn test_load_tokens_from_file_with_comments() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# agents").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "token-one  # laptop").unwrap();
        writeln!(file, "  token-two").unwrap();

        let tokens = load_auth_tokens(&["inline".to_string()], Some(file.path())).unwrap();
        assert_eq!(tokens, vec!["inline", "token-one", "token-two"]);
    }

    #[test]
    fn test_load_tokens_missing_file() {
        assert!(load_auth_tokens(&[], Some(Path::new("/nonexistent/tokens"))).is_err());
    }

    #[test]
    fn test_file_token_source_rereads() {
        let file = NamedTempFile::new().unwrap();
        let source = FileTokenSource::new(file.path());
        assert!(matches!(source.token(), Err(LeaseError::AuthFailed(_))));

        std::fs::write(file.path(), "first\n").unwrap();
        assert_eq!(source.token().unwrap(), "first");
        std::fs::write(file.path(), "# refreshed\nsecond\n").unwrap();
        assert_eq!(source.token().unwrap(), "second");
    }

    #[test]
    fn test_parse_bearer() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer   abc "), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc"), None);
    }
}
