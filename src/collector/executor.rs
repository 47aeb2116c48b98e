use std::process::Stdio;
use std::time::Duration;

use log::{info, warn};
use tokio::process::Command;

use crate::collector::registry::CollectorRun;
use crate::document::Document;

/// `PATH` handed to collectors when the agent itself has none.
pub const FALLBACK_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Wall-clock bound for a single collector.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

const TIMEOUT_PROGRAM: &str = "timeout";

/// Runs shell collectors as subprocesses.
///
/// Each collector gets:
/// - an environment holding nothing but `PATH`, so locale settings and
///   the like cannot change its output,
/// - no stdin, and a discarded stderr,
/// - a hard wall-clock bound enforced by `timeout(1)` when that program
///   is available.
///
/// A collector that fails in any way yields the sentinel document.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    timeout: Duration,
    path_env: Option<String>,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            path_env: None,
        }
    }

    /// Runs collectors with this `PATH` instead of [`clean_path`].
    pub fn with_path(mut self, path_env: impl Into<String>) -> Self {
        self.path_env = Some(path_env.into());
        self
    }

    /// Runs `exec_path` and validates its stdout as JSON.
    pub async fn run_shell_collector(&self, key: &str, exec_path: &str) -> Document {
        let path_env = self.path_env.clone().unwrap_or_else(clean_path);

        let output = if has_timeout_program(&path_env).await {
            clean_command(TIMEOUT_PROGRAM, &path_env)
                .arg(format!("{}s", self.timeout.as_secs().max(1)))
                .arg(exec_path)
                .output()
                .await
        } else {
            warn!("collector[{key}]: no timeout binary found to use");
            clean_command(exec_path, &path_env).output().await
        };

        // A zero exit is not enough: filters in a pipeline hide failures,
        // so the output has to parse as well.
        match output {
            Ok(output) if output.status.success() => match Document::new(&output.stdout) {
                Ok(document) => return document,
                Err(e) => {
                    warn!("collector[{key}]: decode error: {e}");
                    warn!(
                        "collector[{key}]: data: {}",
                        String::from_utf8_lossy(&output.stdout)
                    );
                }
            },
            Ok(output) => {
                warn!("collector[{key}]: {exec_path} error: {}", output.status);
            }
            Err(e) => {
                warn!("collector[{key}]: {exec_path} error: {e}");
            }
        }

        Document::sentinel()
    }
}

#[async_trait::async_trait]
impl CollectorRun for ShellExecutor {
    async fn run(&self, key: &str, args: &str) -> Document {
        if args.is_empty() {
            info!("collector[{key}]: no execpath");
            return Document::empty();
        }
        self.run_shell_collector(key, args).await
    }
}

/// The `PATH` value collectors run with.
pub fn clean_path() -> String {
    std::env::var("PATH")
        .ok()
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| FALLBACK_PATH.to_string())
}

fn clean_command(program: &str, path_env: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear()
        .env("PATH", path_env)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

async fn has_timeout_program(path_env: &str) -> bool {
    clean_command(TIMEOUT_PROGRAM, path_env)
        .args(["1s", "/bin/true"])
        .stdout(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::time::Instant;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn run(path: &Path) -> Document {
        ShellExecutor::default()
            .run_shell_collector("test.key", path.to_str().unwrap())
            .await
    }

    #[tokio::test]
    #[serial]
    async fn valid_output_is_compacted() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sys.ok", "printf '{\\n  \"a\": \"b\",\\n  \"n\": 1\\n}\\n'");
        let document = run(&path).await;
        assert_eq!(document.as_str(), "{\"a\":\"b\",\"n\":1}\n");
    }

    #[tokio::test]
    #[serial]
    async fn invalid_output_gives_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sys.bad", "echo 'not json'");
        assert_eq!(run(&path).await.as_str(), "{\"error\":\"EINVAL\"}\n");
    }

    #[tokio::test]
    #[serial]
    async fn empty_output_gives_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sys.silent", "exit 0");
        assert_eq!(run(&path).await.as_str(), "{\"error\":\"EINVAL\"}\n");
    }

    #[tokio::test]
    #[serial]
    async fn nonzero_exit_gives_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sys.fail", "echo '{\"a\":\"b\"}'; exit 3");
        assert_eq!(run(&path).await.get_string("error"), "EINVAL");
    }

    #[tokio::test]
    #[serial]
    async fn missing_executable_gives_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let document = run(&dir.path().join("nope")).await;
        assert_eq!(document.get_string("error"), "EINVAL");
    }

    #[tokio::test]
    #[serial]
    async fn environment_only_has_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(
            dir.path(),
            "sys.env",
            "printf '{\"path\":\"%s\",\"home\":\"%s\",\"manifest\":\"%s\"}' \
             \"$PATH\" \"${HOME:-}\" \"${CARGO_MANIFEST_DIR:-}\"",
        );
        let document = run(&path).await;
        assert_eq!(document.get_string("path"), clean_path());
        assert_eq!(document.get_string("home"), "");
        assert_eq!(document.get_string("manifest"), "");
    }

    #[tokio::test]
    #[serial]
    async fn stderr_is_not_captured() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sys.noisy", "echo oops >&2; echo '{\"ok\":\"yes\"}'");
        assert_eq!(run(&path).await.get_string("ok"), "yes");
    }

    #[tokio::test]
    #[serial]
    async fn trait_run_with_empty_args_is_empty() {
        let document = ShellExecutor::default().run("sys.off", "").await;
        assert!(document.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn slow_collector_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = script(dir.path(), "sys.slow", "exec sleep 5");

        let started = Instant::now();
        let document = ShellExecutor::new(Duration::from_secs(1))
            .run_shell_collector("sys.slow", path.to_str().unwrap())
            .await;

        assert_eq!(document.as_str(), "{\"error\":\"EINVAL\"}\n");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    #[serial]
    async fn runs_directly_without_timeout_binary() {
        let dir = tempfile::tempdir().unwrap();
        // an empty directory as PATH: no timeout(1) to be found
        let bin = tempfile::tempdir().unwrap();
        let bin_path = bin.path().to_str().unwrap().to_string();
        let path = script(dir.path(), "sys.direct", "echo \"{\\\"path\\\":\\\"$PATH\\\"}\"");

        let document = ShellExecutor::default()
            .with_path(bin_path.clone())
            .run_shell_collector("sys.direct", path.to_str().unwrap())
            .await;

        assert_eq!(document.get_string("path"), bin_path);
    }

    #[test]
    fn clean_path_is_never_empty() {
        assert!(!clean_path().is_empty());
    }
}
