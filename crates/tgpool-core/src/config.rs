use std::{collections::HashMap, env, fs, path::PathBuf, time::Duration};

use crate::{errors::Error, watcher::DEFAULT_CODE_PATTERNS, Result};

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_WATCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Separator for `TGPOOL_CODE_PATTERNS` (regexes routinely contain `,` and `|`).
const PATTERN_SEPARATOR: &str = ";;";

/// Typed runtime configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// JSON registry file backing the session store.
    pub registry_path: PathBuf,

    /// Worker budget for batch operations (join fan-out, probing).
    pub workers: usize,
    /// Bound on every single platform call.
    pub call_timeout: Duration,
    /// Overall deadline for a code watch.
    pub watch_timeout: Duration,
    /// Ordered code patterns, most specific first.
    pub code_patterns: Vec<String>,

    /// Long-poll timeout used by the Telegram adapter's update loop.
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("sessions.json"),
            workers: DEFAULT_WORKERS,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            watch_timeout: DEFAULT_WATCH_TIMEOUT,
            code_patterns: DEFAULT_CODE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            poll_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Read `TGPOOL_*` settings from the process environment, then from a
    /// `.env` file in the working directory. The process environment wins.
    pub fn load() -> Result<Self> {
        let dotenv: HashMap<String, String> = fs::read_to_string(".env")
            .map(|contents| parse_dotenv(&contents).into_iter().collect())
            .unwrap_or_default();
        Self::from_lookup(|key| env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|raw| {
                    raw.trim().parse::<u64>().map_err(|_| {
                        Error::Config(format!("{key} must be a whole number, got {raw:?}"))
                    })
                })
                .transpose()
        };

        let registry_path = lookup("TGPOOL_REGISTRY")
            .map(PathBuf::from)
            .unwrap_or(defaults.registry_path);

        let workers = match number("TGPOOL_WORKERS")? {
            None => defaults.workers,
            Some(0) => {
                return Err(Error::Config(
                    "TGPOOL_WORKERS must be at least 1".to_string(),
                ))
            }
            Some(n) => usize::try_from(n)
                .map_err(|_| Error::Config(format!("TGPOOL_WORKERS is too large: {n}")))?,
        };

        let call_timeout = number("TGPOOL_CALL_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.call_timeout);
        let watch_timeout = number("TGPOOL_WATCH_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.watch_timeout);
        let poll_timeout = number("TGPOOL_POLL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_timeout);

        let code_patterns = lookup("TGPOOL_CODE_PATTERNS")
            .and_then(|raw| split_patterns(&raw))
            .unwrap_or(defaults.code_patterns);

        Ok(Self {
            registry_path,
            workers,
            call_timeout,
            watch_timeout,
            code_patterns,
            poll_timeout,
        })
    }
}

/// `KEY=value` lines; blank lines, comments and keyless lines are skipped.
fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim(), unquote(v.trim())))
        .filter(|(k, _)| !k.is_empty())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn unquote(v: &str) -> &str {
    ['"', '\'']
        .iter()
        .find_map(|q| v.strip_prefix(*q)?.strip_suffix(*q))
        .unwrap_or(v)
}

fn split_patterns(raw: &str) -> Option<Vec<String>> {
    let out: Vec<String> = raw
        .split(PATTERN_SEPARATOR)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.workers, 5);
        assert_eq!(cfg.call_timeout, Duration::from_secs(30));
        assert_eq!(cfg.code_patterns.len(), DEFAULT_CODE_PATTERNS.len());
    }

    #[test]
    fn dotenv_parsing_strips_quotes_and_comments() {
        let parsed = parse_dotenv(
            "# comment\nTGPOOL_WORKERS=8\n\nTGPOOL_REGISTRY=\"/var/lib/tgpool/reg.json\"\nBROKEN\n=nokey\nX='y'\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("TGPOOL_WORKERS".to_string(), "8".to_string()),
                (
                    "TGPOOL_REGISTRY".to_string(),
                    "/var/lib/tgpool/reg.json".to_string()
                ),
                ("X".to_string(), "y".to_string()),
            ]
        );
    }

    #[test]
    fn pattern_override_splits_on_double_semicolon() {
        let got = split_patterns(r"code:\s*(\d+) ;; pin (\d{4}|\d{6}) ;;");
        assert_eq!(
            got,
            Some(vec![
                r"code:\s*(\d+)".to_string(),
                r"pin (\d{4}|\d{6})".to_string()
            ])
        );
        assert_eq!(split_patterns(" ;; "), None);
    }

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = Config::from_lookup(lookup(&[
            ("TGPOOL_REGISTRY", "/var/lib/tgpool/reg.json"),
            ("TGPOOL_WORKERS", " 12 "),
            ("TGPOOL_CALL_TIMEOUT_MS", "1500"),
            ("TGPOOL_CODE_PATTERNS", r"pin (\d+)"),
        ]))
        .unwrap();

        assert_eq!(cfg.registry_path, PathBuf::from("/var/lib/tgpool/reg.json"));
        assert_eq!(cfg.workers, 12);
        assert_eq!(cfg.call_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.watch_timeout, DEFAULT_WATCH_TIMEOUT);
        assert_eq!(cfg.code_patterns, vec![r"pin (\d+)".to_string()]);
    }

    #[test]
    fn bad_numbers_are_config_errors() {
        for (key, val) in [
            ("TGPOOL_WORKERS", "0"),
            ("TGPOOL_WORKERS", "five"),
            ("TGPOOL_WATCH_TIMEOUT_SECS", "-3"),
        ] {
            assert!(
                matches!(Config::from_lookup(lookup(&[(key, val)])), Err(Error::Config(_))),
                "{key}={val}"
            );
        }
    }
}
