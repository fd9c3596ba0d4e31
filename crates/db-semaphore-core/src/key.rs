//! Lock key validation and composition.
//!
//! Keys are stored verbatim in a `VARCHAR` column, so every key (including a
//! key qualified with an extra key) must fit [`MAX_LOCK_KEY_LENGTH`].

use crate::error::{LockError, LockResult};

/// Maximum length of a stored lock key, in characters.
pub const MAX_LOCK_KEY_LENGTH: usize = 100;

/// Maximum length of the free-text context attached to a permit.
pub const MAX_CONTEXT_CHARS: usize = 256;

/// Separator between a key and its extra key.
pub const EXTRA_KEY_SEPARATOR: char = ':';

/// Validates a caller-supplied lock key.
pub fn validate_key(key: &str) -> LockResult<()> {
    if key.trim().is_empty() {
        return Err(LockError::InvalidConfig(
            "lock key cannot be blank".to_string(),
        ));
    }
    let len = key.chars().count();
    if len > MAX_LOCK_KEY_LENGTH {
        return Err(LockError::InvalidConfig(format!(
            "lock key '{key}' is {len} characters, limit is {MAX_LOCK_KEY_LENGTH}"
        )));
    }
    Ok(())
}

/// Builds the stored key for `key` qualified by an optional `extra_key`.
///
/// The composite must itself satisfy [`validate_key`].
pub fn compose_key(key: &str, extra_key: Option<&str>) -> LockResult<String> {
    let composite = match extra_key {
        Some(extra) if !extra.is_empty() => format!("{key}{EXTRA_KEY_SEPARATOR}{extra}"),
        _ => key.to_string(),
    };
    validate_key(key)?;
    validate_key(&composite)?;
    Ok(composite)
}

/// Validates a permit context string.
pub fn validate_context(context: &str) -> LockResult<()> {
    if context.trim().is_empty() {
        return Err(LockError::InvalidConfig(
            "context cannot be blank".to_string(),
        ));
    }
    if context.chars().count() > MAX_CONTEXT_CHARS {
        return Err(LockError::InvalidConfig(format!(
            "context length cannot be more than {MAX_CONTEXT_CHARS}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_key_rejected() {
        assert!(validate_key("").is_err());
        assert!(validate_key(" \t").is_err());
    }

    #[test]
    fn test_key_at_limit() {
        let key = "k".repeat(MAX_LOCK_KEY_LENGTH);
        assert!(validate_key(&key).is_ok());
        let key = "k".repeat(MAX_LOCK_KEY_LENGTH + 1);
        assert!(matches!(validate_key(&key), Err(LockError::InvalidConfig(_))));
    }

    #[test]
    fn test_compose_without_extra() {
        assert_eq!(compose_key("migration", None).unwrap(), "migration");
        assert_eq!(compose_key("migration", Some("")).unwrap(), "migration");
    }

    #[test]
    fn test_compose_with_extra() {
        assert_eq!(
            compose_key("migration", Some("stack-42")).unwrap(),
            "migration:stack-42"
        );
    }

    #[test]
    fn test_composite_over_limit() {
        let key = "k".repeat(MAX_LOCK_KEY_LENGTH - 2);
        assert!(compose_key(&key, Some("a")).is_ok());
        assert!(compose_key(&key, Some("ab")).is_err());
    }

    #[test]
    fn test_context_limits() {
        assert!(validate_context("worker-7").is_ok());
        assert!(validate_context(" ").is_err());
        assert!(validate_context(&"a".repeat(MAX_CONTEXT_CHARS)).is_ok());
        let err = validate_context(&"a".repeat(MAX_CONTEXT_CHARS + 1)).unwrap_err();
        assert!(err.to_string().contains("256"));
    }
}
