use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use log::warn;

use crate::util;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/gocollect.conf";
pub const DEFAULT_REGID_FILE: &str = "/var/lib/gocollect/core.id.regid";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(4 * 3600);

const MAX_INCLUDE_DEPTH: usize = 10;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// Loaded from a `key = value` file, default `/etc/gocollect.conf`:
//
//     register_url = https://collect.example.com/register/
//     push_url = https://collect.example.com/update/{regid}/{_collector}/
//     api_key = s3cr3t
//     collectors_path = collectors
//     collectors_path = /etc/gocollect/collectors
//     include = /etc/gocollect.local.conf
//
// Keys may repeat. `collectors_path` keeps every value in order;
// for all other keys the last value wins.
//
#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint that hands out a regid for an unregistered host
    pub register_url: String,

    /// Push URL template; `{field}` expands from core.id, `{_collector}`
    /// to the collector key
    pub push_url: String,

    /// Sent along in core.id as `gocollect-apikey`
    pub api_key: Option<String>,

    /// Shell collector directories; later entries override earlier ones
    pub collectors_paths: Vec<PathBuf>,

    /// Where the regid from registration is stored
    pub regid_file: PathBuf,

    /// Sleep between daemon cycles
    pub interval: Duration,

    /// Which source wins when a builtin and a script share a key
    pub precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precedence {
    /// Shell collectors override builtins.
    #[default]
    Shell,
    /// Builtins override shell collectors.
    Builtin,
}

impl Config {
    /// Reads `path` and every file it includes.
    ///
    /// Relative `collectors_path` values resolve against the directory of
    /// `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;

        let mut values = ConfigValues::default();
        values.parse(path, &data, 0)?;

        let base = path.parent().unwrap_or(Path::new("/"));
        Self::from_values(&values, base)
    }

    fn from_values(values: &ConfigValues, base: &Path) -> anyhow::Result<Self> {
        let Some(register_url) = values.last("register_url") else {
            bail!("config: missing register_url");
        };
        let Some(push_url) = values.last("push_url") else {
            bail!("config: missing push_url");
        };

        let interval = match values.last("interval") {
            Some(secs) => Duration::from_secs(
                secs.parse()
                    .with_context(|| format!("config: invalid interval {secs:?}"))?,
            ),
            None => DEFAULT_INTERVAL,
        };

        let precedence = match values.last("collector_precedence") {
            None | Some("shell") => Precedence::Shell,
            Some("builtin") => Precedence::Builtin,
            Some(other) => bail!("config: invalid collector_precedence {other:?}"),
        };

        Ok(Self {
            register_url: register_url.to_string(),
            push_url: push_url.to_string(),
            api_key: values
                .last("api_key")
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            collectors_paths: values
                .all("collectors_path")
                .iter()
                .map(|p| util::resolve_path(base, p))
                .collect(),
            regid_file: values
                .last("regid_file")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REGID_FILE)),
            interval,
            precedence,
        })
    }
}

/// Raw key → values, in file order.
#[derive(Debug, Default)]
struct ConfigValues {
    values: HashMap<String, Vec<String>>,
}

impl ConfigValues {
    fn parse(&mut self, filename: &Path, data: &str, depth: usize) -> anyhow::Result<()> {
        if depth >= MAX_INCLUDE_DEPTH {
            bail!("ridiculous include depth in {} config file", filename.display());
        }

        for (lineno, line) in data.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!("{}:{}: missing equals sign", filename.display(), lineno + 1);
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            if key == "include" {
                // missing includes are optional
                if let Ok(included) = fs::read_to_string(value) {
                    self.parse(Path::new(value), &included, depth + 1)?;
                }
            } else {
                self.values
                    .entry(key.to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }
        Ok(())
    }

    fn last(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(|values| values.last())
            .map(String::as_str)
    }

    fn all(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "gocollect.conf",
            "# comment\n\nregister_url = http://r/\npush_url=http://p/{regid}/{_collector}/\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.register_url, "http://r/");
        assert_eq!(config.push_url, "http://p/{regid}/{_collector}/");
        assert_eq!(config.api_key, None);
        assert!(config.collectors_paths.is_empty());
        assert_eq!(config.regid_file, PathBuf::from(DEFAULT_REGID_FILE));
        assert_eq!(config.interval, DEFAULT_INTERVAL);
        assert_eq!(config.precedence, Precedence::Shell);
    }

    #[test]
    fn last_value_wins_and_paths_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "gocollect.conf",
            "register_url = http://old/\n\
             register_url = http://new/\n\
             push_url = http://p/\n\
             api_key = k1\n\
             collectors_path = collectors\n\
             collectors_path = /opt/collectors\n\
             regid_file = /tmp/regid\n\
             interval = 60\n\
             collector_precedence = builtin\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.register_url, "http://new/");
        assert_eq!(config.api_key.as_deref(), Some("k1"));
        assert_eq!(
            config.collectors_paths,
            [dir.path().join("collectors"), PathBuf::from("/opt/collectors")]
        );
        assert_eq!(config.regid_file, PathBuf::from("/tmp/regid"));
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.precedence, Precedence::Builtin);
    }

    #[test]
    fn values_may_contain_equals_sign() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "c.conf",
            "register_url = http://r/?a=b\npush_url = http://p/\n",
        );
        assert_eq!(Config::load(&path).unwrap().register_url, "http://r/?a=b");
    }

    #[test]
    fn includes_are_followed_and_missing_ones_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let extra = write(dir.path(), "extra.conf", "api_key = from-include\n");
        let path = write(
            dir.path(),
            "main.conf",
            &format!(
                "register_url = http://r/\npush_url = http://p/\ninclude = {}\ninclude = /nonexistent/x.conf\nbroken line\n",
                extra.display()
            ),
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("from-include"));
    }

    #[test]
    fn recursive_include_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.conf");
        fs::write(
            &path,
            format!("register_url = r\npush_url = p\ninclude = {}\n", path.display()),
        )
        .unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("include depth"));
    }

    #[test]
    fn missing_urls_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "c.conf", "push_url = http://p/\n");
        assert!(Config::load(&path).unwrap_err().to_string().contains("register_url"));

        let path = write(dir.path(), "d.conf", "register_url = http://r/\n");
        assert!(Config::load(&path).unwrap_err().to_string().contains("push_url"));
    }

    #[test]
    fn invalid_values_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "c.conf",
            "register_url = r\npush_url = p\ninterval = soon\n",
        );
        assert!(Config::load(&path).is_err());

        let path = write(
            dir.path(),
            "d.conf",
            "register_url = r\npush_url = p\ncollector_precedence = random\n",
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn empty_api_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "c.conf", "register_url = r\npush_url = p\napi_key =\n");
        assert_eq!(Config::load(&path).unwrap().api_key, None);
    }

    #[test]
    fn missing_file_is_error() {
        assert!(Config::load(Path::new("/nonexistent/gocollect.conf")).is_err());
    }
}
