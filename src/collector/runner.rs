use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::fs::{self, DirBuilder, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;

use crate::collector::builtin;
use crate::collector::discovery::discover;
use crate::collector::executor::ShellExecutor;
use crate::collector::registry::{CollectorRun, Registry};
use crate::config::{Config, Precedence};
use crate::document::Document;
use crate::error::RunError;
use crate::schema::RegisterResponse;
use crate::transport::Transport;

/// The collector whose output identifies the host.
pub const IDENTITY_KEY: &str = "core.id";

const REGID_FIELD: &str = "regid";
const VERSION_FIELD: &str = "gocollect";
const API_KEY_FIELD: &str = "gocollect-apikey";
const COLLECTOR_PLACEHOLDER: &str = "_collector";

/// How the push stage of a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every runnable collector was handled.
    Complete { pushed: usize },
    /// The very first push failed; the server is probably down.
    AbortedFirst,
    /// A push failed after `pushed` successful ones.
    AbortedAfter { pushed: usize },
}

impl CycleOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, CycleOutcome::Complete { .. })
    }
}

/// ============================================================
/// Application
/// ============================================================
///
/// Owns everything a collection cycle needs: configuration, the builtin
/// collectors, the runner for shell collectors and the transport.
///
/// Nothing here is global; `main` builds one and drives it.
pub struct Application {
    config: Config,
    version: String,
    builtins: Registry,
    shell_runner: Arc<dyn CollectorRun>,
    transport: Arc<dyn Transport>,
}

impl Application {
    pub fn new(config: Config, version: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            version: version.into(),
            builtins: builtin::registrations(),
            shell_runner: Arc::new(ShellExecutor::default()),
            transport,
        }
    }

    /// Replaces the builtin collectors.
    pub fn with_builtins(mut self, builtins: Registry) -> Self {
        self.builtins = builtins;
        self
    }

    /// Replaces the runner bound to discovered shell collectors.
    pub fn with_shell_runner(mut self, runner: Arc<dyn CollectorRun>) -> Self {
        self.shell_runner = runner;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Builtins merged with the shell collectors found right now.
    pub async fn collectors(&self) -> Registry {
        let shell = discover(&self.config.collectors_paths, self.shell_runner.clone()).await;
        match self.config.precedence {
            Precedence::Shell => Registry::merge(&self.builtins, &shell),
            Precedence::Builtin => Registry::merge(&shell, &self.builtins),
        }
    }

    /// Runs one full cycle: identify, register if needed, push everything.
    ///
    /// Idle transport connections are closed afterwards, whatever the
    /// result.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, RunError> {
        let cycle = Cycle {
            app: self,
            collectors: self.collectors().await,
        };
        let result = cycle.run().await;
        self.transport.close_idle();
        result
    }

    /// Output of a single collector, as a cycle would push it.
    pub async fn collect_one(&self, key: &str) -> Result<Document, RunError> {
        let cycle = Cycle {
            app: self,
            collectors: self.collectors().await,
        };
        if key == IDENTITY_KEY {
            cycle.identity().await
        } else {
            Ok(cycle.collectors.run(key).await)
        }
    }

    /// Runs cycles back to back with the configured pause in between.
    ///
    /// Returns only on a fatal error.
    pub async fn run_forever(&self) -> RunError {
        loop {
            match self.run_cycle().await {
                Ok(outcome) => info!("run: finished: {outcome:?}"),
                Err(e) if e.is_fatal() => return e,
                Err(e) => error!("run: failed: {e}"),
            }
            sleep(self.config.interval).await;
        }
    }
}

enum PushResult {
    Pushed,
    Skipped,
    Failed,
}

/// State of one collection cycle. Lives only as long as the cycle.
struct Cycle<'a> {
    app: &'a Application,
    collectors: Registry,
}

impl Cycle<'_> {
    async fn run(&self) -> Result<CycleOutcome, RunError> {
        let mut identity = self.identity().await?;

        if identity.get_string(REGID_FIELD).is_empty() {
            identity = self.register(identity).await?;
        }

        Ok(self.push_all(&mut identity).await)
    }

    /// Runs core.id and stamps it with our version and API key.
    async fn identity(&self) -> Result<Document, RunError> {
        let mut identity = self.collectors.run(IDENTITY_KEY).await;
        if identity.is_empty() {
            return Err(RunError::NoIdentity);
        }

        identity.set_string(VERSION_FIELD, &self.app.version)?;
        if let Some(api_key) = &self.app.config.api_key {
            identity.set_string(API_KEY_FIELD, api_key)?;
        }
        Ok(identity)
    }

    /// Posts the identity, stores the regid we get back and returns a
    /// fresh identity that must now carry it.
    async fn register(&self, mut identity: Document) -> Result<Document, RunError> {
        let url = &self.app.config.register_url;

        let body = match self.app.transport.post(url, &mut identity).await {
            Ok(body) => body,
            Err(e) => {
                warn!("register[url={url}]: failed: {e}");
                return Err(RunError::Registration(e.to_string()));
            }
        };

        let regid = match RegisterResponse::regid_from(&body) {
            Ok(regid) => regid,
            Err(e) => {
                warn!("register[url={url}]: failed: {e}");
                return Err(RunError::Registration(e.to_string()));
            }
        };
        if regid.is_empty() {
            warn!("register[url={url}]: failed: got nothing");
            return Err(RunError::Registration("got nothing".to_string()));
        }

        write_regid(&self.app.config.regid_file, &regid).await?;
        info!("register[url={url}]: got {regid}");

        let identity = self.identity().await?;
        if identity.get_string(REGID_FIELD).is_empty() {
            error!("register: no regid after register from {IDENTITY_KEY}");
            return Err(RunError::Configuration(format!(
                "{IDENTITY_KEY} does not report the regid stored in {}",
                self.app.config.regid_file.display()
            )));
        }
        Ok(identity)
    }

    /// Pushes every runnable collector, stopping at the first failed push.
    async fn push_all(&self, identity: &mut Document) -> CycleOutcome {
        let mut pushed = 0;

        for key in self.collectors.runnable() {
            // {_collector} changes per push
            let overrides = HashMap::from([(COLLECTOR_PLACEHOLDER, key.as_str())]);
            let url = identity.build_string(&self.app.config.push_url, &overrides);

            let result = if key == IDENTITY_KEY {
                self.push(&url, identity).await
            } else {
                let mut document = self.collectors.run(&key).await;
                self.push(&url, &mut document).await
            };

            match result {
                PushResult::Pushed => pushed += 1,
                PushResult::Skipped => {}
                PushResult::Failed => {
                    warn!("push: aborting early; assuming server is broken");
                    return if pushed == 0 {
                        CycleOutcome::AbortedFirst
                    } else {
                        CycleOutcome::AbortedAfter { pushed }
                    };
                }
            }
        }

        CycleOutcome::Complete { pushed }
    }

    async fn push(&self, url: &str, document: &mut Document) -> PushResult {
        if document.is_empty() {
            info!("push[url={url}]: not pushing empty data");
            return PushResult::Skipped;
        }

        match self.app.transport.post(url, document).await {
            Ok(body) => {
                info!("push[url={url}]: got {}", String::from_utf8_lossy(&body).trim_end());
                PushResult::Pushed
            }
            Err(e) => {
                warn!("push[url={url}]: failed: {e}");
                PushResult::Failed
            }
        }
    }
}

/// Stores `regid` as the only content of `path`, readable by the owner
/// only. The parent directory is created when missing.
async fn write_regid(path: &Path, regid: &str) -> Result<(), RunError> {
    let state_error = |source| RunError::StateFile {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(parent)
            .await
            .map_err(state_error)?;
    }

    // a previous 0400 file cannot be opened for writing by non-root
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(state_error(e)),
        _ => {}
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(path)
        .await
        .map_err(state_error)?;
    file.write_all(regid.as_bytes()).await.map_err(state_error)?;
    file.sync_all().await.map_err(state_error)
}
