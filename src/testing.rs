//! In-process `RemoteApi` double for unit tests.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::api::RemoteApi;
use crate::error::{CoreError, CoreResult};
use crate::mirror::{record_id, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthMode {
    Up,
    Down,
    /// Never answers; only a timeout gets the caller out.
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

struct FakeState {
    health: HealthMode,
    health_delay: Option<Duration>,
    snapshots: VecDeque<CoreResult<Snapshot>>,
    /// Paths (exact) that answer 500.
    failing_paths: Vec<String>,
    /// Every `send` fails with a transport error.
    network_down: bool,
    send_delay: Option<Duration>,
    calls: Vec<RecordedCall>,
    health_calls: usize,
}

pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self {
            state: Mutex::new(FakeState {
                health: HealthMode::Up,
                health_delay: None,
                snapshots: VecDeque::new(),
                failing_paths: Vec::new(),
                network_down: false,
                send_delay: None,
                calls: Vec::new(),
                health_calls: 0,
            }),
        }
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_health(&self, mode: HealthMode) {
        self.state.lock().unwrap().health = mode;
    }

    pub fn set_health_delay(&self, delay: Duration) {
        self.state.lock().unwrap().health_delay = Some(delay);
    }

    pub fn push_snapshot(&self, snapshot: Snapshot) {
        self.state.lock().unwrap().snapshots.push_back(Ok(snapshot));
    }

    pub fn push_snapshot_error(&self) {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .push_back(Err(CoreError::Http("Cannot reach POS server".into())));
    }

    pub fn fail_path(&self, path: &str) {
        self.state.lock().unwrap().failing_paths.push(path.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_paths.clear();
        state.network_down = false;
    }

    pub fn set_network_down(&self, down: bool) {
        self.state.lock().unwrap().network_down = down;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state.lock().unwrap().send_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn health_calls(&self) -> usize {
        self.state.lock().unwrap().health_calls
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn health(&self) -> CoreResult<()> {
        let (mode, delay) = {
            let mut state = self.state.lock().unwrap();
            state.health_calls += 1;
            (state.health, state.health_delay)
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        match mode {
            HealthMode::Up => Ok(()),
            HealthMode::Down => Err(CoreError::Status {
                status: 503,
                message: "POS server error".into(),
            }),
            HealthMode::Hang => std::future::pending().await,
        }
    }

    async fn fetch_snapshot(&self) -> CoreResult<Snapshot> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .pop_front()
            .unwrap_or_else(|| Err(CoreError::Http("no snapshot scripted".into())))
    }

    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> CoreResult<Value> {
        let (delay, network_down, failing) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(RecordedCall {
                method: method.clone(),
                path: path.to_string(),
                body: body.clone(),
            });
            (
                state.send_delay,
                state.network_down,
                state.failing_paths.iter().any(|p| p == path),
            )
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if network_down {
            return Err(CoreError::Http("Cannot reach POS server".into()));
        }
        if failing {
            return Err(CoreError::Status {
                status: 500,
                message: "POS server error".into(),
            });
        }

        // Echo creates back with a server-assigned id, like a real backend.
        let reply = match (method, body) {
            (Method::DELETE, _) => Value::Null,
            (Method::POST, Some(mut b)) => {
                let server_id = format!("srv-{}", record_id(&b).unwrap_or_default());
                if let Value::Object(ref mut map) = b {
                    map.insert("id".into(), json!(server_id));
                    map.insert("_id".into(), json!(server_id));
                }
                b
            }
            (_, Some(b)) => b,
            (_, None) => json!({ "ok": true }),
        };
        Ok(reply)
    }
}
