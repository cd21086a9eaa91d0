//! Newline-delimited JSON RPC over a child process's standard pipes.
//!
//! One frame per line. The gateway sends `request` frames and receives
//! `response` frames; plugins send `callback` frames the other way, which
//! are dispatched to the registered [`CallbackHandler`] (the upstream
//! publisher's capability surface) and answered on the same pipe. Child
//! stderr is forwarded into `tracing`.
use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::{oneshot, Mutex as AsyncMutex},
};

use crate::{
    core::error::GatewayError,
    plugin::{PluginError, PluginRole},
};

/// Version announced during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FrameKind {
    Request,
    Response,
    Callback,
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    id: u64,
    kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<FrameError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrameError {
    kind: String,
    message: String,
}

/// The surface plugins may call back into. Discovery plugins get the
/// upstream publisher here; other roles get [`NoCallbacks`].
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, GatewayError>;
}

/// Rejects every callback. Used for roles without a callback surface.
pub struct NoCallbacks;

#[async_trait]
impl CallbackHandler for NoCallbacks {
    async fn handle(&self, method: &str, _params: Value) -> Result<Value, GatewayError> {
        Err(GatewayError::Internal(format!(
            "this plugin role has no callback surface (called {method})"
        )))
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, PluginError>>>>>;

/// One live plugin subprocess.
pub struct PluginProcess {
    child: Mutex<Option<Child>>,
    stdin: Arc<AsyncMutex<ChildStdin>>,
    pending: Pending,
    next_id: AtomicU64,
}

impl PluginProcess {
    /// Launch the child and wire up the pipe protocol. The command must be a
    /// resolved binary path.
    pub async fn spawn(
        command: &str,
        callbacks: Arc<dyn CallbackHandler>,
    ) -> Result<Arc<Self>, PluginError> {
        let mut child = Command::new(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Transport(format!("failed to spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PluginError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Transport("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PluginError::Transport("child stderr unavailable".into()))?;

        let process = Arc::new(Self {
            child: Mutex::new(Some(child)),
            stdin: Arc::new(AsyncMutex::new(stdin)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        });

        // Forward child stderr into tracing.
        let command_name = command.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(plugin = %command_name, "{line}");
            }
        });

        // Reader loop: route responses to callers, dispatch callbacks.
        let pending = process.pending.clone();
        let stdin_for_callbacks = process.stdin.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => break,
                };
                let frame: Frame = match serde_json::from_str(&line) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding malformed plugin frame");
                        continue;
                    }
                };

                match frame.kind {
                    FrameKind::Response => {
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&frame.id);
                        if let Some(tx) = waiter {
                            let outcome = match frame.error {
                                Some(err) => Err(PluginError::Application {
                                    kind: err.kind,
                                    message: err.message,
                                }),
                                None => Ok(frame.result.unwrap_or(Value::Null)),
                            };
                            let _ = tx.send(outcome);
                        }
                    }
                    FrameKind::Request | FrameKind::Callback => {
                        let callbacks = callbacks.clone();
                        let stdin = stdin_for_callbacks.clone();
                        tokio::spawn(async move {
                            let method = frame.method.unwrap_or_default();
                            let params = frame.params.unwrap_or(Value::Null);
                            let response = match callbacks.handle(&method, params).await {
                                Ok(result) => Frame {
                                    id: frame.id,
                                    kind: FrameKind::Response,
                                    method: None,
                                    params: None,
                                    result: Some(result),
                                    error: None,
                                },
                                Err(err) => Frame {
                                    id: frame.id,
                                    kind: FrameKind::Response,
                                    method: None,
                                    params: None,
                                    result: None,
                                    error: Some(FrameError {
                                        kind: err.kind().to_string(),
                                        message: err.to_string(),
                                    }),
                                },
                            };
                            if let Err(err) = write_frame(&stdin, &response).await {
                                tracing::warn!(error = %err, "failed to answer plugin callback");
                            }
                        });
                    }
                }
            }

            // Pipe closed: fail everything still waiting.
            let waiters: Vec<_> = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain()
                .collect();
            for (_, tx) in waiters {
                let _ = tx.send(Err(PluginError::Transport(
                    "plugin closed the pipe".into(),
                )));
            }
        });

        Ok(process)
    }

    /// Issue one request and wait for its response, bounded by `timeout`.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, PluginError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let frame = Frame {
            id,
            kind: FrameKind::Request,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        };
        if let Err(err) = write_frame(&self.stdin, &frame).await {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PluginError::Transport("plugin closed the pipe".into())),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(PluginError::Timeout(timeout))
            }
        }
    }

    /// Verify the child speaks the protocol and announces the expected role.
    pub async fn handshake(&self, role: PluginRole, timeout: Duration) -> Result<(), PluginError> {
        let result = self
            .call(
                "handshake",
                json!({ "role": role, "protocol_version": PROTOCOL_VERSION }),
                timeout,
            )
            .await?;
        let announced = result.get("role").and_then(Value::as_str);
        if announced != Some(role.as_str()) {
            return Err(PluginError::Handshake(format!(
                "expected role {role}, plugin announced {announced:?}"
            )));
        }
        Ok(())
    }

    /// Whether the subprocess is still running.
    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the subprocess. Pending calls fail with a transport error
    /// when the pipe closes.
    pub fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = child.as_mut() {
            if let Err(err) = child.start_kill() {
                tracing::debug!(error = %err, "plugin already exited");
            }
        }
        *child = None;
    }
}

async fn write_frame(stdin: &AsyncMutex<ChildStdin>, frame: &Frame) -> Result<(), PluginError> {
    let mut line = serde_json::to_vec(frame)
        .map_err(|e| PluginError::Transport(format!("failed to encode frame: {e}")))?;
    line.push(b'\n');

    let mut stdin = stdin.lock().await;
    stdin
        .write_all(&line)
        .await
        .map_err(|e| PluginError::Transport(format!("failed to write frame: {e}")))?;
    stdin
        .flush()
        .await
        .map_err(|e| PluginError::Transport(format!("failed to flush frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let frame = Frame {
            id: 7,
            kind: FrameKind::Request,
            method: Some("heartbeat".into()),
            params: Some(json!({})),
            result: None,
            error: None,
        };
        let line = serde_json::to_string(&frame).unwrap();
        assert!(line.starts_with("{\"id\":7"));
        let parsed: Frame = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.kind, FrameKind::Request);
        assert_eq!(parsed.method.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn error_frames_parse() {
        let line = r#"{"id":3,"kind":"response","error":{"kind":"app","message":"nope"}}"#;
        let frame: Frame = serde_json::from_str(line).unwrap();
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.error.unwrap().kind, "app");
    }

    #[cfg(unix)]
    mod subprocess {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        use super::*;

        /// A fake plugin: answers handshake with the metric role, fails
        /// `boom` with an application error, and acks everything else.
        const FAKE_PLUGIN: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"handshake"'*) printf '{"id":%s,"kind":"response","result":{"role":"metric"}}\n' "$id" ;;
    *'"boom"'*) printf '{"id":%s,"kind":"response","error":{"kind":"app","message":"nope"}}\n' "$id" ;;
    *) printf '{"id":%s,"kind":"response","result":null}\n' "$id" ;;
  esac
done
"#;

        fn fake_plugin() -> tempfile::TempPath {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(FAKE_PLUGIN.as_bytes()).unwrap();
            let path = file.into_temp_path();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn spawn_handshake_and_call() {
            let script = fake_plugin();
            let process = PluginProcess::spawn(script.to_str().unwrap(), Arc::new(NoCallbacks))
                .await
                .unwrap();

            process
                .handshake(PluginRole::Metric, Duration::from_secs(5))
                .await
                .unwrap();

            let result = process
                .call("configure", json!({"options": {}}), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result, Value::Null);

            let err = process
                .call("boom", Value::Null, Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, PluginError::Application { .. }));
            assert!(!err.is_transport());

            process.kill();
        }

        #[tokio::test]
        async fn role_mismatch_fails_handshake() {
            let script = fake_plugin();
            let process = PluginProcess::spawn(script.to_str().unwrap(), Arc::new(NoCallbacks))
                .await
                .unwrap();

            let err = process
                .handshake(PluginRole::Discovery, Duration::from_secs(5))
                .await
                .unwrap_err();
            assert!(matches!(err, PluginError::Handshake(_)));
            process.kill();
        }

        #[tokio::test]
        async fn dead_process_surfaces_transport_errors() {
            let script = fake_plugin();
            let process = PluginProcess::spawn(script.to_str().unwrap(), Arc::new(NoCallbacks))
                .await
                .unwrap();
            process.kill();
            tokio::time::sleep(Duration::from_millis(100)).await;

            let err = process
                .call("heartbeat", Value::Null, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(err.is_transport());
            assert!(!process.is_alive());
        }
    }
}
