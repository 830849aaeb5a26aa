//! Action dispatch
//!
//! Actions are opaque subprocesses: `<action_command> <path> <verb> [args]`.
//! The monitor loop never waits on them. Each dispatched action carries the
//! SMON updates to apply on success and on error, and [`ActionDispatcher::reap`]
//! applies them from the loop once the process exits or its deadline passes.

use crate::common::{Clock, Error, Result};
use crate::monitor::model::{LocalExpect, MonitorStatus, ServiceInstance};
use crate::monitor::store::{SmonUpdate, StateStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// Longest the monitor loop waits inline on `status --refresh`.
const STATUS_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum delay between two refresh attempts of the same service.
const STATUS_REFRESH_BACKOFF: Duration = Duration::from_secs(30);

/// A spawned action process.
pub trait RunningAction: Send {
    /// Exit code once the process ended. Signals map to -1.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    fn kill(&mut self);
}

/// Starts action processes.
pub trait ActionRunner: Send + Sync {
    /// Run `argv` against the service at `path`.
    fn spawn(&self, path: &str, argv: &[String]) -> Result<Box<dyn RunningAction>>;

    /// Fence `node`.
    fn spawn_stonith(&self, node: &str) -> Result<Box<dyn RunningAction>>;
}

/// Runs actions through the configured command line.
pub struct CommandRunner {
    action_command: String,
    stonith_command: Option<String>,
}

impl CommandRunner {
    pub fn new(action_command: impl Into<String>, stonith_command: Option<String>) -> Self {
        Self {
            action_command: action_command.into(),
            stonith_command,
        }
    }

    fn spawn_command(&self, program: &str, args: &[&str]) -> std::io::Result<Box<dyn RunningAction>> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(ChildAction { child }))
    }
}

impl ActionRunner for CommandRunner {
    fn spawn(&self, path: &str, argv: &[String]) -> Result<Box<dyn RunningAction>> {
        let mut args: Vec<&str> = vec![path];
        args.extend(argv.iter().map(String::as_str));
        self.spawn_command(&self.action_command, &args)
            .map_err(|e| Error::ActionSpawn {
                path: path.to_string(),
                verb: argv.first().cloned().unwrap_or_default(),
                reason: e.to_string(),
            })
    }

    fn spawn_stonith(&self, node: &str) -> Result<Box<dyn RunningAction>> {
        let command = self.stonith_command.as_deref().ok_or_else(|| Error::ActionSpawn {
            path: node.to_string(),
            verb: "stonith".into(),
            reason: "no stonith command configured".into(),
        })?;
        self.spawn_command(command, &[node]).map_err(|e| Error::ActionSpawn {
            path: node.to_string(),
            verb: "stonith".into(),
            reason: e.to_string(),
        })
    }
}

struct ChildAction {
    child: tokio::process::Child,
}

impl RunningAction for ChildAction {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self.child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("kill action process: {}", e);
        }
    }
}

/// State changes applied when an action ends.
#[derive(Debug, Clone, Default)]
pub struct FollowUp {
    pub smon: SmonUpdate,
    /// Drop the local instance (service deleted here)
    pub drop_instance: bool,
}

impl FollowUp {
    pub fn status(status: MonitorStatus) -> Self {
        Self {
            smon: SmonUpdate::status(status),
            drop_instance: false,
        }
    }

    pub fn with_local_expect(mut self, local_expect: Option<LocalExpect>) -> Self {
        self.smon = self.smon.with_local_expect(local_expect);
        self
    }

    pub fn clearing_stonith(mut self) -> Self {
        self.smon = self.smon.with_stonith(None);
        self
    }

    pub fn dropping_instance(mut self) -> Self {
        self.drop_instance = true;
        self
    }
}

/// One action to run against a service.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub path: String,
    pub verb: String,
    pub args: Vec<String>,
    pub on_success: FollowUp,
    pub on_error: FollowUp,
    /// Overrides the dispatcher default
    pub timeout: Option<Duration>,
    pub stonith_target: Option<String>,
}

impl ActionRequest {
    /// `verb` with the conventional follow-ups: `idle` on success,
    /// `<failed>` on error.
    pub fn new(path: impl Into<String>, verb: impl Into<String>, failed: MonitorStatus) -> Self {
        Self {
            path: path.into(),
            verb: verb.into(),
            args: Vec::new(),
            on_success: FollowUp::status(MonitorStatus::Idle),
            on_error: FollowUp::status(failed),
            timeout: None,
            stonith_target: None,
        }
    }

    /// Fence `node` before acting on `path`. The outcome only clears the
    /// stonith mark: the caller proceeds regardless.
    pub fn stonith(path: impl Into<String>, node: impl Into<String>, timeout: Duration) -> Self {
        let follow = FollowUp::default().clearing_stonith();
        Self {
            path: path.into(),
            verb: "stonith".into(),
            args: Vec::new(),
            on_success: follow.clone(),
            on_error: follow,
            timeout: Some(timeout),
            stonith_target: Some(node.into()),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn on_success(mut self, follow: FollowUp) -> Self {
        self.on_success = follow;
        self
    }

    pub fn on_error(mut self, follow: FollowUp) -> Self {
        self.on_error = follow;
        self
    }

    fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.verb.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// How a dispatched action ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCompletion {
    pub path: String,
    pub verb: String,
    /// `None` when the action was killed at its deadline
    pub code: Option<i32>,
}

impl ActionCompletion {
    pub fn succeeded(&self) -> bool {
        self.code == Some(0)
    }
}

struct InFlight {
    request: ActionRequest,
    child: Box<dyn RunningAction>,
    deadline: f64,
}

pub struct ActionDispatcher {
    runner: Arc<dyn ActionRunner>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
    inflight: Mutex<Vec<InFlight>>,
    var_dir: PathBuf,
    /// Last ingested status cache mtime, per path
    status_mtimes: Mutex<BTreeMap<String, SystemTime>>,
    /// Last `status --refresh` attempt, per path, until a cache loads
    refresh_attempts: Mutex<BTreeMap<String, f64>>,
}

impl ActionDispatcher {
    pub fn new(
        runner: Arc<dyn ActionRunner>,
        clock: Arc<dyn Clock>,
        default_timeout: Duration,
        var_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            clock,
            default_timeout,
            inflight: Mutex::new(Vec::new()),
            var_dir: var_dir.into(),
            status_mtimes: Mutex::new(BTreeMap::new()),
            refresh_attempts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Is an action running against `path`?
    pub fn is_busy(&self, path: &str) -> bool {
        self.inflight.lock().iter().any(|a| a.request.path == path)
    }

    /// Spawn `request`. A spawn failure applies the error follow-up at once.
    pub fn dispatch(&self, store: &StateStore, request: ActionRequest) -> Result<()> {
        let spawned = match &request.stonith_target {
            Some(node) => self.runner.spawn_stonith(node),
            None => self.runner.spawn(&request.path, &request.argv()),
        };
        match spawned {
            Ok(child) => {
                info!(path = %request.path, "dispatch {}", request.argv().join(" "));
                let timeout = request.timeout.unwrap_or(self.default_timeout);
                let deadline = self.clock.now() + timeout.as_secs_f64();
                self.inflight.lock().push(InFlight {
                    request,
                    child,
                    deadline,
                });
                Ok(())
            }
            Err(e) => {
                error!(path = %request.path, "{}", e);
                apply_follow_up(store, &request.path, &request.on_error);
                Err(e)
            }
        }
    }

    /// Collect ended actions and apply their follow-ups.
    pub fn reap(&self, store: &StateStore) -> Vec<ActionCompletion> {
        let now = self.clock.now();
        let mut ended: Vec<(ActionRequest, Option<i32>)> = Vec::new();
        {
            let mut inflight = self.inflight.lock();
            let mut i = 0;
            while i < inflight.len() {
                let action = &mut inflight[i];
                let state = match action.child.try_wait() {
                    Ok(Some(code)) => Some(Some(code)),
                    Ok(None) if now >= action.deadline => {
                        warn!(path = %action.request.path, "{} timed out, kill", action.request.verb);
                        action.child.kill();
                        Some(None)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        warn!(path = %action.request.path, "wait {}: {}", action.request.verb, e);
                        Some(Some(-1))
                    }
                };
                match state {
                    Some(code) => {
                        let done = inflight.swap_remove(i);
                        ended.push((done.request, code));
                    }
                    None => i += 1,
                }
            }
        }

        ended
            .into_iter()
            .map(|(request, code)| {
                let follow = if code == Some(0) {
                    info!(path = %request.path, "{} succeeded", request.verb);
                    &request.on_success
                } else {
                    warn!(
                        path = %request.path,
                        "{} failed: {}",
                        request.verb,
                        code.map_or("timeout".to_string(), |c| format!("exit code {}", c))
                    );
                    &request.on_error
                };
                apply_follow_up(store, &request.path, follow);
                // the action likely rewrote the status cache
                self.status_mtimes.lock().remove(&request.path);
                ActionCompletion {
                    path: request.path,
                    verb: request.verb,
                    code,
                }
            })
            .collect()
    }

    /// Kill every running action.
    pub fn kill_all(&self) {
        for action in self.inflight.lock().iter_mut() {
            action.child.kill();
        }
    }

    // === Status cache ===

    pub fn status_path(&self, path: &str) -> PathBuf {
        status_cache_path(&self.var_dir, path)
    }

    /// Ingest the status cache of `path` if it changed since the last read.
    /// Returns true when the local instance was refreshed.
    pub fn load_status(&self, store: &StateStore, path: &str) -> Result<bool> {
        let file = self.status_path(path);
        let cache_err = |reason: String| Error::StatusCache {
            path: path.to_string(),
            reason,
        };
        let mtime = std::fs::metadata(&file)
            .and_then(|m| m.modified())
            .map_err(|e| cache_err(e.to_string()))?;
        if self
            .status_mtimes
            .lock()
            .get(path)
            .is_some_and(|last| *last >= mtime)
        {
            return Ok(false);
        }
        let bytes = std::fs::read(&file).map_err(|e| cache_err(e.to_string()))?;
        let instance: ServiceInstance =
            serde_json::from_slice(&bytes).map_err(|e| cache_err(e.to_string()))?;
        store.put_local_instance(path, instance);
        self.status_mtimes.lock().insert(path.to_string(), mtime);
        debug!(path = %path, "status cache loaded");
        Ok(true)
    }

    /// Load the status of `path`, falling back to a synchronous
    /// `status --refresh` when the cache is absent or corrupt.
    ///
    /// A service whose refresh does not produce a usable cache is retried
    /// at most once per backoff window.
    pub async fn load_or_refresh_status(&self, store: &StateStore, path: &str) -> Result<bool> {
        let err = match self.load_status(store, path) {
            Ok(loaded) => {
                self.refresh_attempts.lock().remove(path);
                return Ok(loaded);
            }
            Err(e) => e,
        };
        let now = self.clock.now();
        {
            let mut attempts = self.refresh_attempts.lock();
            if let Some(last) = attempts.get(path) {
                if now - last < STATUS_REFRESH_BACKOFF.as_secs_f64() {
                    return Err(err);
                }
            }
            attempts.insert(path.to_string(), now);
        }
        debug!(path = %path, "{}, refresh", err);
        self.refresh_status(path).await?;
        let loaded = self.load_status(store, path)?;
        self.refresh_attempts.lock().remove(path);
        Ok(loaded)
    }

    async fn refresh_status(&self, path: &str) -> Result<()> {
        let argv = vec!["status".to_string(), "--refresh".to_string()];
        let mut child = self.runner.spawn(path, &argv)?;
        let limit = self.default_timeout.min(STATUS_REFRESH_TIMEOUT);
        let waited = tokio::time::timeout(limit, async {
            loop {
                if let Some(code) = child.try_wait()? {
                    return Ok::<i32, Error>(code);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        match waited {
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(code)) => Err(Error::ActionFailed {
                path: path.to_string(),
                verb: "status".into(),
                code,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                child.kill();
                Err(Error::Timeout(format!("{} status --refresh", path)))
            }
        }
    }
}

/// `<var_dir>/services/<path>/status.json`
pub fn status_cache_path(var_dir: &Path, path: &str) -> PathBuf {
    var_dir.join("services").join(path).join("status.json")
}

fn apply_follow_up(store: &StateStore, path: &str, follow: &FollowUp) {
    if follow.drop_instance {
        store.remove_local_instance(path);
        return;
    }
    store.set_smon(path, follow.smon.clone());
}
