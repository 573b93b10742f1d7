// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed parsing with defaults and validation, warning on malformed values

use std::str::FromStr;

/// Parse an environment variable with a fallback default value
/// Returns the parsed value or the default if the variable is not set or cannot be parsed
pub fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(var_name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Parse an environment variable with validation
/// Returns the parsed value if it passes validation, otherwise returns the default
/// Logs warnings when environment variables are set but fail validation or parsing
pub fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    F: Fn(T) -> bool,
{
    match std::env::var(var_name) {
        Ok(raw_value) => match raw_value.trim().parse::<T>() {
            Ok(parsed_value) if validator(parsed_value) => parsed_value,
            Ok(_) => {
                tracing::warn!(
                    "Environment variable {} has invalid value '{}', using default: {}",
                    var_name,
                    raw_value,
                    default
                );
                default
            }
            Err(_) => {
                tracing::warn!(
                    "Environment variable {} has unparseable value '{}', using default: {}",
                    var_name,
                    raw_value,
                    default
                );
                default
            }
        },
        // Not set is the common case
        Err(_) => default,
    }
}

/// Parse a boolean flag. Accepts true/false, 1/0, yes/no, on/off (case-insensitive).
pub fn parse_env_bool(var_name: &str, default: bool) -> bool {
    match std::env::var(var_name) {
        Ok(raw_value) => match raw_value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                tracing::warn!(
                    "Environment variable {} has invalid boolean '{}', using default: {}",
                    var_name,
                    raw_value,
                    default
                );
                default
            }
        },
        Err(_) => default,
    }
}

/// Read a non-empty string variable
pub fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_parse_env_or_default_not_set() {
        std::env::remove_var("BRANCHLAB_TEST_NOT_SET");
        assert_eq!(parse_env_or_default("BRANCHLAB_TEST_NOT_SET", 42u64), 42);
    }

    #[test]
    #[serial]
    fn test_parse_env_or_default_valid() {
        std::env::set_var("BRANCHLAB_TEST_VALID", " 17 ");
        assert_eq!(parse_env_or_default("BRANCHLAB_TEST_VALID", 42u64), 17);
        std::env::remove_var("BRANCHLAB_TEST_VALID");
    }

    #[test]
    #[serial]
    fn test_validation_rejects_out_of_range() {
        std::env::set_var("BRANCHLAB_TEST_RANGE", "0");
        let value = parse_env_or_default_with_validation("BRANCHLAB_TEST_RANGE", 10usize, |v| v > 0);
        assert_eq!(value, 10);
        std::env::remove_var("BRANCHLAB_TEST_RANGE");
    }

    #[test]
    #[serial]
    fn test_validation_rejects_garbage() {
        std::env::set_var("BRANCHLAB_TEST_GARBAGE", "lots");
        let value = parse_env_or_default_with_validation("BRANCHLAB_TEST_GARBAGE", 0.5f64, |v| v > 0.0);
        assert_eq!(value, 0.5);
        std::env::remove_var("BRANCHLAB_TEST_GARBAGE");
    }

    #[test]
    #[serial]
    fn test_parse_env_bool_variants() {
        std::env::set_var("BRANCHLAB_TEST_BOOL", "Off");
        assert!(!parse_env_bool("BRANCHLAB_TEST_BOOL", true));
        std::env::set_var("BRANCHLAB_TEST_BOOL", "YES");
        assert!(parse_env_bool("BRANCHLAB_TEST_BOOL", false));
        std::env::set_var("BRANCHLAB_TEST_BOOL", "maybe");
        assert!(parse_env_bool("BRANCHLAB_TEST_BOOL", true));
        std::env::remove_var("BRANCHLAB_TEST_BOOL");
    }

    #[test]
    #[serial]
    fn test_env_string_ignores_blank() {
        std::env::set_var("BRANCHLAB_TEST_STRING", "   ");
        assert_eq!(env_string("BRANCHLAB_TEST_STRING"), None);
        std::env::remove_var("BRANCHLAB_TEST_STRING");
    }
}
