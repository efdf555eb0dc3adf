//! `CHARON_*` environment overrides.
//!
//! Every variable is validated as it is read. Failures fall back to the
//! current value and are collected, so one run reports every bad variable.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use super::source::{ConfigSource, Sourced};

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("{var} must be {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: &'static str,
        value: String,
    },

    #[error("{var} points at {}, which does not exist", .path.display())]
    PathNotFound { var: String, path: PathBuf },

    #[error("{var} is not a positive duration: '{value}'")]
    InvalidDuration { var: String, value: String },

    #[error("Invalid settings file {}: {message}", .path.display())]
    InvalidFile { path: PathBuf, message: String },
}

/// Reads prefixed variables and accumulates validation errors.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "CHARON_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Drain the collected errors.
    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Read `<prefix><name>` with `parse`; unset keeps `default`, a parse
    /// failure keeps `default` and records `invalid(var, raw)`.
    fn read<T>(
        &mut self,
        name: &str,
        default: T,
        parse: impl FnOnce(&str) -> Option<T>,
        invalid: impl FnOnce(String, String) -> EnvError,
    ) -> Sourced<T> {
        let var = format!("{}{name}", self.prefix);
        let Ok(raw) = env::var(&var) else {
            return Sourced::default_value(default);
        };
        match parse(&raw) {
            Some(value) => Sourced::from_env(value, var),
            None => {
                self.errors.push(invalid(var, raw));
                Sourced::default_value(default)
            }
        }
    }

    /// `1/true/yes/on` or `0/false/no/off`, case-insensitive; empty is false.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        self.read(name, default, parse_bool, |var, value| EnvError::InvalidValue {
            var,
            expected: "a boolean (true/false/1/0/yes/no/on/off)",
            value,
        })
    }

    /// `250ms`, `5s`, `1m 30s` or bare seconds. Zero is rejected.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        self.read(name, default, parse_duration, |var, value| {
            EnvError::InvalidDuration { var, value }
        })
    }

    /// A path with a leading `~/` expanded. Blank values keep `default`.
    /// With `must_exist`, a missing path is recorded as an error but still
    /// returned.
    pub fn get_path(&mut self, name: &str, default: &Path, must_exist: bool) -> Sourced<PathBuf> {
        let var = format!("{}{name}", self.prefix);
        let Some(raw) = env::var(&var).ok().filter(|raw| !raw.trim().is_empty()) else {
            return Sourced::default_value(default.to_path_buf());
        };
        let path = expand_home(raw.trim());
        if must_exist && !path.exists() {
            self.errors.push(EnvError::PathNotFound {
                var: var.clone(),
                path: path.clone(),
            });
        }
        Sourced::from_env(path, var)
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Parse a duration as bare seconds or `humantime` syntax. Zero is rejected.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    let duration = match trimmed.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => humantime::parse_duration(trimmed).ok()?,
    };
    (!duration.is_zero()).then_some(duration)
}

pub(crate) fn expand_home(value: &str) -> PathBuf {
    if let Some(stripped) = value.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    PathBuf::from(value)
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::settings::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: callers hold env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: callers hold env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        let vars = ["CHARON_TEST_BOOL"];
        cleanup_env(&vars);

        for (raw, expected) in [("1", true), ("Yes", true), ("off", false), ("", false)] {
            set_env("CHARON_TEST_BOOL", raw);
            let mut parser = EnvParser::new();
            let result = parser.get_bool("TEST_BOOL", !expected);
            assert_eq!(result.value, expected, "value for '{raw}'");
            assert!(result.is_from_env());
            assert!(!parser.has_errors());
        }

        set_env("CHARON_TEST_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert!(parser.get_bool("TEST_BOOL", true).value);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration_accepts_humantime_and_seconds() {
        let _guard = env_test_lock();
        let vars = ["CHARON_TEST_DURATION"];
        cleanup_env(&vars);

        set_env("CHARON_TEST_DURATION", "250ms");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_DURATION", Duration::from_secs(1));
        assert_eq!(result.value, Duration::from_millis(250));
        assert_eq!(result.env_var.as_deref(), Some("CHARON_TEST_DURATION"));

        set_env("CHARON_TEST_DURATION", "7");
        let mut parser = EnvParser::new();
        assert_eq!(
            parser.get_duration("TEST_DURATION", Duration::from_secs(1)).value,
            Duration::from_secs(7)
        );

        for bad in ["soon", "0s", "-3"] {
            set_env("CHARON_TEST_DURATION", bad);
            let mut parser = EnvParser::new();
            let result = parser.get_duration("TEST_DURATION", Duration::from_secs(1));
            assert_eq!(result.value, Duration::from_secs(1));
            assert_eq!(result.source, ConfigSource::Default);
            assert!(matches!(
                parser.errors(),
                [EnvError::InvalidDuration { .. }]
            ));
        }

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_path_expands_home_and_checks_existence() {
        let _guard = env_test_lock();
        let vars = ["CHARON_TEST_PATH"];
        cleanup_env(&vars);

        let mut parser = EnvParser::new();
        let result = parser.get_path("TEST_PATH", Path::new("/default"), true);
        assert_eq!(result.value, PathBuf::from("/default"));
        assert!(!parser.has_errors());

        set_env("CHARON_TEST_PATH", "/definitely/not/here/charon");
        let mut parser = EnvParser::new();
        parser.get_path("TEST_PATH", Path::new("/default"), true);
        assert!(matches!(parser.errors(), [EnvError::PathNotFound { .. }]));

        if let Some(home) = dirs::home_dir() {
            set_env("CHARON_TEST_PATH", "~/charon-bin");
            let mut parser = EnvParser::new();
            let result = parser.get_path("TEST_PATH", Path::new("/default"), false);
            assert_eq!(result.value, home.join("charon-bin"));
        }

        cleanup_env(&vars);
    }

    mod proptest_parsing {
        use super::super::{parse_bool, parse_duration};
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            #[test]
            fn test_parse_bool_accepts_only_known_words(s in "[a-zA-Z0-9_-]{0,12}") {
                let known = ["1", "true", "yes", "on", "0", "false", "no", "off", ""];
                let is_known = known.iter().any(|k| s.eq_ignore_ascii_case(k));
                prop_assert_eq!(parse_bool(&s).is_some(), is_known);
            }

            #[test]
            fn test_parse_duration_never_panics(s in ".*") {
                let _ = parse_duration(&s);
            }

            #[test]
            fn test_parse_duration_bare_seconds(secs in 1u64..100_000) {
                prop_assert_eq!(
                    parse_duration(&secs.to_string()),
                    Some(std::time::Duration::from_secs(secs))
                );
            }
        }
    }
}
