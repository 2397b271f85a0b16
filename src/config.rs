//! Runtime configuration from the process environment (optionally seeded from a `.env` file).

use std::path::Path;
use std::time::Duration;

use crate::client::{BASE_URL, ClientOptions};
use crate::models::marshydro::ClientProfile;
use crate::session::Credentials;

pub const DEFAULT_POLL_SECS: u64 = 60;
pub const DEFAULT_TOKEN_FRESHNESS_SECS: u64 = 300;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub api_url: String,
    /// Cadence of full refresh passes.
    pub poll_interval: Duration,
    /// Age after which the held token is replaced before use.
    pub token_freshness: Duration,
    /// Upper bound for a single HTTP call, connect to last byte.
    pub request_timeout: Duration,
    pub timezone: String,
    pub language: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let required = |key: &str| match lookup(key) {
            Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            _ => Err(format!("Missing {}: set it in the environment or a .env file", key)),
        };
        let secs = |key: &str, default: u64| -> Result<Duration, String> {
            match lookup(key) {
                Some(v) if !v.trim().is_empty() => match v.trim().parse::<u64>() {
                    Ok(0) => Err(format!("{} must be greater than zero", key)),
                    Ok(n) => Ok(Duration::from_secs(n)),
                    Err(_) => Err(format!("{} must be a whole number of seconds, got {:?}", key, v)),
                },
                _ => Ok(Duration::from_secs(default)),
            }
        };

        let username = required("MARSHYDRO_USERNAME")?;
        let password = required("MARSHYDRO_PASSWORD")?;
        let api_url = lookup("MARSHYDRO_API_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| BASE_URL.to_string());
        let defaults = ClientProfile::default();

        Ok(Config {
            credentials: Credentials::new(username, password),
            api_url,
            poll_interval: secs("POLL_INTERVAL_SECS", DEFAULT_POLL_SECS)?,
            token_freshness: secs("TOKEN_FRESHNESS_SECS", DEFAULT_TOKEN_FRESHNESS_SECS)?,
            request_timeout: secs("REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            timezone: lookup("MARSHYDRO_TIMEZONE").unwrap_or(defaults.timezone),
            language: lookup("MARSHYDRO_LANGUAGE").unwrap_or(defaults.language),
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            base_url: self.api_url.clone(),
            freshness: self.token_freshness,
            timeout: self.request_timeout,
            profile: ClientProfile {
                timezone: self.timezone.clone(),
                language: self.language.clone(),
                ..ClientProfile::default()
            },
        }
    }
}

/// Loads `KEY=value` lines into the process environment. Variables that are
/// already set keep their value. Returns how many were applied.
pub fn load_env_file(path: &Path) -> Result<usize, String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let mut applied = 0;
    for (index, line) in contents.lines().enumerate() {
        let Some((key, value)) = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?
        else {
            continue;
        };
        if std::env::var_os(&key).is_none() {
            // Mutating the environment is unsafe once threads exist; this runs before any are spawned.
            unsafe {
                std::env::set_var(&key, value);
            }
            applied += 1;
        }
    }
    Ok(applied)
}

/// Parses one `.env` line. Blank lines and comments yield `None`.
pub fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(format!("invalid variable name {:?}", key));
    }

    let raw = raw.trim();
    let value = if let Some(rest) = raw.strip_prefix('"') {
        unquote_double(rest)?
    } else if let Some(rest) = raw.strip_prefix('\'') {
        unquote_single(rest)?
    } else {
        raw.split(" #").next().unwrap_or_default().trim_end().to_string()
    };
    Ok(Some((key.to_string(), value)))
}

fn after_closing_quote(remainder: &str) -> Result<(), String> {
    let remainder = remainder.trim();
    if remainder.is_empty() || remainder.starts_with('#') {
        Ok(())
    } else {
        Err("unexpected characters after closing quote".to_string())
    }
}

/// Double-quoted values understand `\n`, `\r`, `\t`, `\\` and `\"`.
fn unquote_double(input: &str) -> Result<String, String> {
    let mut value = String::new();
    let mut chars = input.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let escaped = chars.next().ok_or_else(|| "unterminated escape sequence".to_string())?;
                value.push(match escaped {
                    'n' => '\n',
                    'r' => '\r',
                    't' => '\t',
                    other => other,
                });
            }
            '"' => {
                after_closing_quote(chars.as_str())?;
                return Ok(value);
            }
            other => value.push(other),
        }
    }
    Err("unterminated \" quote".to_string())
}

fn unquote_single(input: &str) -> Result<String, String> {
    let end = input.find('\'').ok_or_else(|| "unterminated ' quote".to_string())?;
    after_closing_quote(&input[end + 1..])?;
    Ok(input[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::from_lookup(lookup(&[("MARSHYDRO_USERNAME", "a@b.c"), ("MARSHYDRO_PASSWORD", "pw")])).unwrap();
        assert_eq!(cfg.api_url, BASE_URL);
        assert_eq!(cfg.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.token_freshness, Duration::from_secs(300));
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.credentials.username, "a@b.c");

        let opts = cfg.client_options();
        assert_eq!(opts.profile.timezone, "UTC");
        assert_eq!(opts.freshness, Duration::from_secs(300));
    }

    #[test]
    fn overrides_and_validation() {
        let cfg = Config::from_lookup(lookup(&[
            ("MARSHYDRO_USERNAME", "a@b.c"),
            ("MARSHYDRO_PASSWORD", "pw"),
            ("POLL_INTERVAL_SECS", "30"),
            ("TOKEN_FRESHNESS_SECS", "3600"),
            ("MARSHYDRO_TIMEZONE", "Europe/Berlin"),
        ]))
        .unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.token_freshness, Duration::from_secs(3600));
        assert_eq!(cfg.client_options().profile.timezone, "Europe/Berlin");

        let err = Config::from_lookup(lookup(&[
            ("MARSHYDRO_USERNAME", "a@b.c"),
            ("MARSHYDRO_PASSWORD", "pw"),
            ("POLL_INTERVAL_SECS", "soon"),
        ]))
        .unwrap_err();
        assert!(err.contains("POLL_INTERVAL_SECS"));
    }

    #[test]
    fn credentials_are_required() {
        let err = Config::from_lookup(lookup(&[("MARSHYDRO_USERNAME", "a@b.c")])).unwrap_err();
        assert!(err.contains("MARSHYDRO_PASSWORD"));
    }

    #[test]
    fn env_lines() {
        assert_eq!(parse_env_line("  # comment"), Ok(None));
        assert_eq!(parse_env_line(""), Ok(None));
        assert_eq!(
            parse_env_line("export POLL_INTERVAL_SECS=45 # faster"),
            Ok(Some(("POLL_INTERVAL_SECS".into(), "45".into())))
        );
        assert_eq!(
            parse_env_line("MARSHYDRO_PASSWORD=\"p#ss word\""),
            Ok(Some(("MARSHYDRO_PASSWORD".into(), "p#ss word".into())))
        );
        assert_eq!(parse_env_line("KEY='x' # ok"), Ok(Some(("KEY".into(), "x".into()))));
        assert!(parse_env_line("NOEQUALS").is_err());
        assert!(parse_env_line("BAD KEY=1").is_err());
        assert!(parse_env_line("K=\"open").is_err());
        assert!(parse_env_line("K='open").is_err());
        assert!(parse_env_line("K=\"a\" b").is_err());
    }

    #[test]
    fn double_quoted_escapes() {
        assert_eq!(
            parse_env_line(r#"MARSHYDRO_PASSWORD="a\"b""#),
            Ok(Some(("MARSHYDRO_PASSWORD".into(), "a\"b".into())))
        );
        assert_eq!(
            parse_env_line(r#"K="back\\slash\tand\nline" # note"#),
            Ok(Some(("K".into(), "back\\slash\tand\nline".into())))
        );
        // single quotes stay literal
        assert_eq!(parse_env_line(r"K='a\n'"), Ok(Some(("K".into(), r"a\n".into()))));
        assert!(parse_env_line(r#"K="trailing\"#).is_err());
    }
}
