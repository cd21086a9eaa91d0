//! Supervision of N sibling plugin instances for one role.
//!
//! The manager spawns, handshakes, configures and starts each instance,
//! heartbeats them every five seconds, restarts instances after two
//! consecutive heartbeat failures, and surfaces a fatal supervision error
//! after two failed restarts inside one minute. Calls round-robin over live
//! instances and are retried once on a different instance for transport
//! errors only.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    core::error::GatewayError,
    plugin::{
        rpc::{CallbackHandler, PluginProcess},
        PluginError, PluginRole,
    },
};

/// Heartbeat cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Consecutive heartbeat failures before an instance is declared unhealthy.
pub const UNHEALTHY_AFTER: u32 = 2;
/// Restart failures inside this window make the manager give up.
pub const RESTART_WINDOW: Duration = Duration::from_secs(60);
/// How many restart failures inside [`RESTART_WINDOW`] are fatal.
pub const FATAL_RESTART_FAILURES: usize = 2;

/// Lifecycle of one plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Spawning,
    Configuring,
    Running,
    Unhealthy,
    Terminating,
    Dead,
}

struct Instance {
    state: InstanceState,
    process: Option<Arc<PluginProcess>>,
    consecutive_failures: u32,
    restart_failures: Vec<Instant>,
}

impl Instance {
    fn new() -> Self {
        Self {
            state: InstanceState::Spawning,
            process: None,
            consecutive_failures: 0,
            restart_failures: Vec::new(),
        }
    }
}

/// Supervises N instances of one plugin role.
pub struct PluginManager {
    role: PluginRole,
    command: String,
    options: HashMap<String, Value>,
    count: usize,
    call_timeout: Duration,
    callbacks: Arc<dyn CallbackHandler>,
    instances: Mutex<Vec<Instance>>,
    rr: AtomicUsize,
    stopping: AtomicBool,
    fatal_tx: mpsc::Sender<GatewayError>,
    heartbeat: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PluginManager {
    pub fn new(
        role: PluginRole,
        command: String,
        options: HashMap<String, Value>,
        count: usize,
        call_timeout: Duration,
        callbacks: Arc<dyn CallbackHandler>,
        fatal_tx: mpsc::Sender<GatewayError>,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            command,
            options,
            count: count.max(1),
            call_timeout,
            callbacks,
            instances: Mutex::new(Vec::new()),
            rr: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            fatal_tx,
            heartbeat: Mutex::new(None),
        })
    }

    pub fn role(&self) -> PluginRole {
        self.role
    }

    /// Spawn, handshake, configure and start every instance, then begin the
    /// heartbeat loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            instances.clear();
            for _ in 0..self.count {
                instances.push(Instance::new());
            }
        }

        for index in 0..self.count {
            let process = self.launch(index).await.map_err(|err| {
                GatewayError::Supervision(format!(
                    "{} plugin {} failed to start: {err}",
                    self.role, self.command
                ))
            })?;
            self.install(index, process);
        }

        let manager = self.clone();
        let handle = tokio::spawn(async move {
            manager.heartbeat_loop().await;
        });
        *self.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        tracing::info!(role = %self.role, command = %self.command, count = self.count, "plugin manager started");
        Ok(())
    }

    /// Stop every instance, killing stragglers after `timeout`.
    pub async fn stop(&self, timeout: Duration) {
        self.stopping.store(true, Ordering::Release);
        if let Some(handle) = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        let processes: Vec<_> = {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            instances
                .iter_mut()
                .filter_map(|instance| {
                    instance.state = InstanceState::Terminating;
                    instance.process.take()
                })
                .collect()
        };

        for process in processes {
            let deadline = timeout.min(self.call_timeout);
            if let Err(err) = process.call("stop", Value::Null, deadline).await {
                tracing::debug!(role = %self.role, error = %err, "plugin stop call failed");
            }
            process.kill();
        }

        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        for instance in instances.iter_mut() {
            instance.state = InstanceState::Dead;
        }
        tracing::info!(role = %self.role, "plugin manager stopped");
    }

    /// Call one live instance, selected round-robin. A transport failure is
    /// retried once on a different instance; application errors propagate.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, PluginError> {
        let (first, second) = self.pick_two();
        let Some(first) = first else {
            return Err(PluginError::Unavailable);
        };

        match first.call(method, params.clone(), self.call_timeout).await {
            Err(err) if err.is_transport() => {
                tracing::warn!(role = %self.role, method, error = %err, "plugin call failed, retrying on a sibling");
                match second {
                    Some(second) => second.call(method, params, self.call_timeout).await,
                    None => Err(err),
                }
            }
            result => result,
        }
    }

    /// Number of instances currently in the `Running` state.
    pub fn running_count(&self) -> usize {
        self.instances
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .count()
    }

    /// Two distinct live processes: the round-robin pick and a fallback.
    fn pick_two(&self) -> (Option<Arc<PluginProcess>>, Option<Arc<PluginProcess>>) {
        let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        let live: Vec<_> = instances
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .filter_map(|i| i.process.clone())
            .collect();
        drop(instances);

        match live.len() {
            0 => (None, None),
            1 => (Some(live[0].clone()), None),
            n => {
                let start = self.rr.fetch_add(1, Ordering::Relaxed) % n;
                (Some(live[start].clone()), Some(live[(start + 1) % n].clone()))
            }
        }
    }

    /// Spawn one child and walk it through handshake, configure and start.
    async fn launch(&self, index: usize) -> Result<Arc<PluginProcess>, PluginError> {
        self.set_state(index, InstanceState::Spawning);
        let process = PluginProcess::spawn(&self.command, self.callbacks.clone()).await?;
        process.handshake(self.role, self.call_timeout).await?;

        self.set_state(index, InstanceState::Configuring);
        process
            .call(
                "configure",
                json!({ "options": self.options }),
                self.call_timeout,
            )
            .await?;
        process.call("start", Value::Null, self.call_timeout).await?;
        Ok(process)
    }

    fn set_state(&self, index: usize, state: InstanceState) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(instance) = instances.get_mut(index) {
            instance.state = state;
        }
    }

    fn install(&self, index: usize, process: Arc<PluginProcess>) {
        let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(instance) = instances.get_mut(index) {
            instance.state = InstanceState::Running;
            instance.process = Some(process);
            instance.consecutive_failures = 0;
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.stopping.load(Ordering::Acquire) {
                return;
            }

            // Instances whose previous respawn failed are retried first.
            let stuck: Vec<usize> = {
                let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
                instances
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| i.state == InstanceState::Unhealthy)
                    .map(|(idx, _)| idx)
                    .collect()
            };
            for index in stuck {
                self.restart_instance(index).await;
            }

            let targets: Vec<(usize, Arc<PluginProcess>)> = {
                let instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
                instances
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| i.state == InstanceState::Running)
                    .filter_map(|(idx, i)| i.process.clone().map(|p| (idx, p)))
                    .collect()
            };

            for (index, process) in targets {
                match process
                    .call("heartbeat", Value::Null, self.call_timeout)
                    .await
                {
                    Ok(_) => {
                        let mut instances =
                            self.instances.lock().unwrap_or_else(|e| e.into_inner());
                        if let Some(instance) = instances.get_mut(index) {
                            instance.consecutive_failures = 0;
                        }
                    }
                    Err(err) => {
                        let unhealthy = {
                            let mut instances =
                                self.instances.lock().unwrap_or_else(|e| e.into_inner());
                            match instances.get_mut(index) {
                                Some(instance) => {
                                    instance.consecutive_failures += 1;
                                    if instance.consecutive_failures >= UNHEALTHY_AFTER {
                                        instance.state = InstanceState::Unhealthy;
                                        true
                                    } else {
                                        false
                                    }
                                }
                                None => false,
                            }
                        };
                        tracing::warn!(
                            role = %self.role,
                            instance = index,
                            error = %err,
                            unhealthy,
                            "plugin heartbeat failed"
                        );
                        if unhealthy {
                            self.restart_instance(index).await;
                        }
                    }
                }
            }
        }
    }

    /// Terminate an unhealthy instance and respawn it with the same
    /// configuration. A failed respawn leaves the instance `Unhealthy`; the
    /// heartbeat loop retries it on the next tick.
    async fn restart_instance(&self, index: usize) {
        let old = {
            let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
            match instances.get_mut(index) {
                Some(instance) => {
                    instance.state = InstanceState::Terminating;
                    instance.process.take()
                }
                None => return,
            }
        };
        if let Some(process) = old {
            process.kill();
        }

        match self.launch(index).await {
            Ok(process) => {
                self.install(index, process);
                tracing::info!(role = %self.role, instance = index, "plugin instance respawned");
            }
            Err(err) => {
                tracing::error!(role = %self.role, instance = index, error = %err, "plugin respawn failed");
                let fatal = {
                    let mut instances = self.instances.lock().unwrap_or_else(|e| e.into_inner());
                    match instances.get_mut(index) {
                        Some(instance) => {
                            let now = Instant::now();
                            instance.restart_failures.push(now);
                            instance
                                .restart_failures
                                .retain(|t| now.duration_since(*t) <= RESTART_WINDOW);
                            if instance.restart_failures.len() >= FATAL_RESTART_FAILURES {
                                instance.state = InstanceState::Dead;
                                true
                            } else {
                                instance.state = InstanceState::Unhealthy;
                                false
                            }
                        }
                        None => false,
                    }
                };
                if fatal {
                    let _ = self
                        .fatal_tx
                        .send(GatewayError::Supervision(format!(
                            "{} plugin {} failed two restarts within {RESTART_WINDOW:?}",
                            self.role, self.command
                        )))
                        .await;
                }
            }
        }
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::plugin::rpc::NoCallbacks;

    fn script_plugin(body: &str) -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        let path = file.into_temp_path();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// Answers every request in protocol order, announcing the metric role.
    const WELL_BEHAVED: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"handshake"'*) printf '{"id":%s,"kind":"response","result":{"role":"metric"}}\n' "$id" ;;
    *) printf '{"id":%s,"kind":"response","result":null}\n' "$id" ;;
  esac
done
"#;

    /// Announces the wrong role.
    const MISCAST: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"id":%s,"kind":"response","result":{"role":"router"}}\n' "$id"
done
"#;

    fn manager(
        script: &tempfile::TempPath,
        count: usize,
    ) -> (Arc<PluginManager>, mpsc::Receiver<GatewayError>) {
        let (fatal_tx, fatal_rx) = mpsc::channel(4);
        let manager = PluginManager::new(
            PluginRole::Metric,
            script.to_str().unwrap().to_string(),
            HashMap::new(),
            count,
            Duration::from_secs(5),
            Arc::new(NoCallbacks),
            fatal_tx,
        );
        (manager, fatal_rx)
    }

    #[tokio::test]
    async fn starts_and_calls_instances() {
        let script = script_plugin(WELL_BEHAVED);
        let (manager, _fatal) = manager(&script, 2);

        manager.start().await.unwrap();
        assert_eq!(manager.running_count(), 2);

        let result = manager.call("request_metrics", serde_json::json!({"metrics": []})).await;
        assert!(result.is_ok());

        manager.stop(Duration::from_secs(1)).await;
        assert_eq!(manager.running_count(), 0);
    }

    #[tokio::test]
    async fn rejects_miscast_plugins_at_startup() {
        let script = script_plugin(MISCAST);
        let (manager, _fatal) = manager(&script, 1);

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, GatewayError::Supervision(_)));
    }

    #[tokio::test]
    async fn call_without_instances_is_unavailable() {
        let script = script_plugin(WELL_BEHAVED);
        let (manager, _fatal) = manager(&script, 1);

        let err = manager.call("heartbeat", Value::Null).await.unwrap_err();
        assert!(matches!(err, PluginError::Unavailable));
    }
}
