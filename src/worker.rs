//! Worker communication protocol.
//!
//! Each controller delegates its blocking hardware I/O to one or more
//! workers. A worker is an out-of-process executor in spirit: it is reached
//! only through two directed channels carrying serialization-checked
//! payloads, keeps no state between calls except what its own `init` method
//! stored, and runs its loop on a dedicated blocking task so a slow device
//! call never stalls the async runtime.
//!
//! # Wire protocol
//!
//! Request: [`WorkerRequest`] `{ method, args, kwargs }`. The payload is
//! verified serializable before it is sent; a non-serializable argument
//! fails locally and never reaches the worker.
//!
//! The response comes in two phases, both [`WorkerResponse`]:
//!
//! 1. **Acknowledgement** `(success, message, None)`: the worker received
//!    the request and could dispatch to `method`. `success == false` means
//!    the method does not exist.
//! 2. **Result** `(success, message, value)`: sent once the method returned
//!    or failed. On failure `message` carries the formatted reason.
//!
//! Every channel receive is bounded by the configured response timeout. The
//! first expiry is retried exactly once; a second expiry escalates to
//! [`EngineError::FatalCommunication`], which is terminal for the owning
//! controller. This bounds how long a hung worker can block the pipeline.

use crate::config::WorkerSettings;
use crate::error::{AppResult, EngineError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A single unit of work sent to a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Name of the worker method to invoke.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// One phase of a worker's two-phase response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    /// Whether the phase succeeded.
    pub success: bool,
    /// Human-readable detail, primarily for failures.
    pub message: String,
    /// The method's return value; always `None` in the acknowledgement.
    pub value: Option<Value>,
}

impl WorkerResponse {
    fn ack() -> Self {
        Self {
            success: true,
            message: String::new(),
            value: None,
        }
    }

    fn ack_missing(method: &str) -> Self {
        Self {
            success: false,
            message: format!("no such worker method '{method}'"),
            value: None,
        }
    }

    fn ok(value: Value) -> Self {
        Self {
            success: true,
            message: String::new(),
            value: Some(value),
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
            value: None,
        }
    }
}

/// The blocking side of a worker: per-device hardware I/O.
///
/// Implementations are free to block in `call`; the loop runs on a dedicated
/// blocking task. Instance state survives between calls, but is only ever
/// populated through the worker's own `init` method.
pub trait WorkerMethods: Send {
    /// Whether `method` can be dispatched.
    fn has_method(&self, method: &str) -> bool;

    /// Executes `method`. A returned error becomes a failed result response;
    /// it does not tear the worker down.
    fn call(
        &mut self,
        method: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> anyhow::Result<Value>;
}

/// Handle to one spawned worker: the controller-side channel ends.
///
/// One per named worker per controller; never shared between controllers.
pub struct WorkerHandle {
    name: String,
    request_tx: mpsc::Sender<WorkerRequest>,
    response_rx: mpsc::Receiver<WorkerResponse>,
    response_timeout: Duration,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawns `worker`'s loop on a blocking task and returns the handle.
    pub fn spawn(
        name: impl Into<String>,
        worker: Box<dyn WorkerMethods>,
        settings: &WorkerSettings,
    ) -> Self {
        let name = name.into();
        let (request_tx, request_rx) = mpsc::channel(settings.channel_capacity);
        let (response_tx, response_rx) = mpsc::channel(settings.channel_capacity);

        let loop_name = name.clone();
        let join = tokio::task::spawn_blocking(move || {
            run_worker(&loop_name, worker, request_rx, response_tx);
        });

        Self {
            name,
            request_tx,
            response_rx,
            response_timeout: settings.response_timeout,
            join,
        }
    }

    /// The worker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Performs one full request/ack/result round trip.
    pub async fn request(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> AppResult<Value> {
        let wait = self.response_timeout;
        self.request_bounded(method, args, kwargs, wait).await
    }

    /// Like [`request`], but with a caller-chosen bound on the result phase,
    /// for methods that legitimately block for the length of a hardware run.
    /// The acknowledgement stays on the protocol timeout.
    pub async fn request_bounded(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        result_wait: Duration,
    ) -> AppResult<Value> {
        let request = WorkerRequest {
            method: method.to_string(),
            args,
            kwargs,
        };
        // Anything that cannot cross the worker boundary fails here, before
        // it is sent.
        serde_json::to_vec(&request)?;

        debug!(worker = %self.name, method, "sending worker request");
        self.request_tx
            .send(request)
            .await
            .map_err(|_| EngineError::FatalCommunication {
                worker: self.name.clone(),
                reason: "request channel closed".into(),
            })?;

        let ack = self.recv_bounded("acknowledgement", self.response_timeout).await?;
        if !ack.success {
            return Err(EngineError::WorkerMethodMissing {
                worker: self.name.clone(),
                method: method.to_string(),
            });
        }

        let result = self.recv_bounded("result", result_wait).await?;
        if result.success {
            Ok(result.value.unwrap_or(Value::Null))
        } else {
            Err(EngineError::WorkerFailed {
                worker: self.name.clone(),
                method: method.to_string(),
                message: result.message,
            })
        }
    }

    /// Receives one response phase within the bounded wait, retrying exactly
    /// once on expiry before escalating to a fatal communication error.
    async fn recv_bounded(
        &mut self,
        phase: &'static str,
        wait: Duration,
    ) -> AppResult<WorkerResponse> {
        for attempt in 0..2u8 {
            match timeout(wait, self.response_rx.recv()).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {
                    return Err(EngineError::FatalCommunication {
                        worker: self.name.clone(),
                        reason: "response channel closed".into(),
                    })
                }
                Err(_) => {
                    warn!(
                        worker = %self.name,
                        phase,
                        attempt,
                        timeout_ms = wait.as_millis() as u64,
                        "worker response timed out"
                    );
                }
            }
        }
        Err(EngineError::FatalCommunication {
            worker: self.name.clone(),
            reason: format!("no {phase} within {wait:?} after retry"),
        })
    }

    /// Best-effort graceful shutdown: sends the worker's `shutdown` method
    /// and waits out the grace period before abandoning it.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        let request = WorkerRequest {
            method: "shutdown".to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
        };
        if self.request_tx.send(request).await.is_err() {
            warn!(worker = %self.name, "worker already gone at shutdown");
            self.join.abort();
            return false;
        }

        // Ack then result; both within the grace period, best effort.
        let graceful = timeout(grace, async {
            let _ = self.response_rx.recv().await;
            let _ = self.response_rx.recv().await;
        })
        .await
        .is_ok();

        if graceful {
            debug!(worker = %self.name, "worker shut down gracefully");
        } else {
            warn!(worker = %self.name, grace_ms = grace.as_millis() as u64, "worker did not shut down within grace period, abandoning");
            self.join.abort();
        }
        graceful
    }

    #[cfg(test)]
    pub(crate) fn detached(name: &str, response_timeout: Duration) -> Self {
        let (request_tx, _request_rx) = mpsc::channel(1);
        let (_response_tx, response_rx) = mpsc::channel(1);
        // Leak the far ends so the channels stay open but silent.
        std::mem::forget(_request_rx);
        std::mem::forget(_response_tx);
        Self {
            name: name.to_string(),
            request_tx,
            response_rx,
            response_timeout,
            join: tokio::spawn(async {}),
        }
    }
}

/// The worker's own loop: receive, dispatch, acknowledge, execute, respond.
///
/// Runs until the request channel closes or a `shutdown` request completes.
fn run_worker(
    name: &str,
    mut worker: Box<dyn WorkerMethods>,
    mut request_rx: mpsc::Receiver<WorkerRequest>,
    response_tx: mpsc::Sender<WorkerResponse>,
) {
    debug!(worker = name, "worker loop started");
    while let Some(request) = request_rx.blocking_recv() {
        let is_shutdown = request.method == "shutdown";

        if !worker.has_method(&request.method) {
            if response_tx
                .blocking_send(WorkerResponse::ack_missing(&request.method))
                .is_err()
            {
                break;
            }
            continue;
        }
        if response_tx.blocking_send(WorkerResponse::ack()).is_err() {
            break;
        }

        let response = match worker.call(&request.method, &request.args, &request.kwargs) {
            Ok(value) => match serde_json::to_vec(&value) {
                Ok(_) => WorkerResponse::ok(value),
                // The method returned something that cannot cross the
                // boundary; convert to a failure instead of dying.
                Err(e) => WorkerResponse::failed(format!(
                    "result of '{}' is not serializable: {e}",
                    request.method
                )),
            },
            Err(e) => WorkerResponse::failed(format!("{e:#}")),
        };

        if response_tx.blocking_send(response).is_err() {
            break;
        }
        if is_shutdown {
            break;
        }
    }
    debug!(worker = name, "worker loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoWorker;

    impl WorkerMethods for EchoWorker {
        fn has_method(&self, method: &str) -> bool {
            matches!(method, "init" | "echo" | "fail" | "hang" | "shutdown")
        }

        fn call(
            &mut self,
            method: &str,
            args: &[Value],
            _kwargs: &Map<String, Value>,
        ) -> anyhow::Result<Value> {
            match method {
                "init" => Ok(Value::Null),
                "echo" => Ok(args.first().cloned().unwrap_or(Value::Null)),
                "fail" => anyhow::bail!("device said no"),
                "hang" => {
                    // Long past the test's protocol timeout, but short enough
                    // that runtime teardown does not wait on this thread.
                    std::thread::sleep(Duration::from_secs(2));
                    Ok(Value::Null)
                }
                "shutdown" => Ok(Value::Null),
                other => anyhow::bail!("unreachable method {other}"),
            }
        }
    }

    fn test_settings(timeout_ms: u64) -> WorkerSettings {
        WorkerSettings {
            response_timeout: Duration::from_millis(timeout_ms),
            run_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_millis(200),
            channel_capacity: 4,
        }
    }

    #[tokio::test]
    async fn round_trip_returns_result_value() {
        let mut handle = WorkerHandle::spawn(
            "echo_main",
            Box::new(EchoWorker),
            &test_settings(1000),
        );
        let value = handle
            .request("echo", vec![json!({"channel": 3})], Map::new())
            .await
            .unwrap();
        assert_eq!(value, json!({"channel": 3}));
        assert!(handle.shutdown(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn unknown_method_is_a_failed_ack() {
        let mut handle = WorkerHandle::spawn(
            "echo_main",
            Box::new(EchoWorker),
            &test_settings(1000),
        );
        let err = handle.request("reticulate", vec![], Map::new()).await;
        assert!(matches!(
            err,
            Err(EngineError::WorkerMethodMissing { ref method, .. }) if method == "reticulate"
        ));
        // The worker survives a bad method name.
        let value = handle
            .request("echo", vec![json!(1)], Map::new())
            .await
            .unwrap();
        assert_eq!(value, json!(1));
    }

    #[tokio::test]
    async fn method_error_becomes_failed_result() {
        let mut handle = WorkerHandle::spawn(
            "echo_main",
            Box::new(EchoWorker),
            &test_settings(1000),
        );
        let err = handle.request("fail", vec![], Map::new()).await;
        assert!(matches!(
            err,
            Err(EngineError::WorkerFailed { ref message, .. }) if message.contains("device said no")
        ));
    }

    #[tokio::test]
    async fn silent_worker_retries_once_then_goes_fatal() {
        let mut handle = WorkerHandle::detached("mute_main", Duration::from_millis(50));
        let start = std::time::Instant::now();
        let err = handle.request("echo", vec![], Map::new()).await;
        let elapsed = start.elapsed();

        assert!(matches!(err, Err(EngineError::FatalCommunication { .. })));
        // One retry: roughly two timeout windows, not an unbounded wait.
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn long_method_succeeds_with_extended_result_bound() {
        // The method outlives the protocol timeout by far, but the caller
        // declared a longer result bound, so this is not a hung worker.
        let mut handle = WorkerHandle::spawn(
            "echo_main",
            Box::new(EchoWorker),
            &test_settings(50),
        );
        let value = handle
            .request_bounded("hang", vec![], Map::new(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, Value::Null);
        assert!(handle.shutdown(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn hung_method_times_out_on_the_result_phase() {
        let mut handle = WorkerHandle::spawn(
            "echo_main",
            Box::new(EchoWorker),
            &test_settings(50),
        );
        let err = handle.request("hang", vec![], Map::new()).await;
        assert!(matches!(err, Err(EngineError::FatalCommunication { .. })));
    }
}
