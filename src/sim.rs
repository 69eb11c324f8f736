//! Simulated device worker.
//!
//! Stands in for a hardware driver: implements the full worker method
//! surface with configurable failure and hang injection, so the engine can
//! be run end to end (and tested) without instruments attached.

use crate::worker::WorkerMethods;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// A worker that pretends to program and run a device.
pub struct SimWorker {
    name: String,
    fail_on: Vec<String>,
    hang_on: Vec<String>,
    delay_on: Vec<(String, Duration)>,
    run_duration: Duration,
    armed: bool,
    shot_path: Option<String>,
}

impl SimWorker {
    /// Creates a well-behaved simulated worker.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_on: Vec::new(),
            hang_on: Vec::new(),
            delay_on: Vec::new(),
            run_duration: Duration::from_millis(10),
            armed: false,
            shot_path: None,
        }
    }

    /// Makes the named method report a failure instead of succeeding.
    pub fn failing_on(mut self, method: impl Into<String>) -> Self {
        self.fail_on.push(method.into());
        self
    }

    /// Makes the named method block well past any protocol timeout.
    pub fn hanging_on(mut self, method: impl Into<String>) -> Self {
        self.hang_on.push(method.into());
        self
    }

    /// Makes the named method take `delay` before proceeding normally.
    pub fn delaying_on(mut self, method: impl Into<String>, delay: Duration) -> Self {
        self.delay_on.push((method.into(), delay));
        self
    }

    /// Sets how long a simulated hardware run takes.
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }
}

impl WorkerMethods for SimWorker {
    fn has_method(&self, method: &str) -> bool {
        matches!(
            method,
            "init"
                | "program_buffered"
                | "abort_transition_to_buffered"
                | "abort_buffered"
                | "transition_to_manual"
                | "start_run"
                | "program_manual"
                | "shutdown"
        )
    }

    fn call(
        &mut self,
        method: &str,
        args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> anyhow::Result<Value> {
        if self.hang_on.iter().any(|m| m == method) {
            // Far past any test timeout, short enough not to stall runtime
            // teardown once the test abandons this worker.
            std::thread::sleep(Duration::from_secs(2));
        }
        if let Some((_, delay)) = self.delay_on.iter().find(|(m, _)| m == method) {
            std::thread::sleep(*delay);
        }
        if self.fail_on.iter().any(|m| m == method) {
            anyhow::bail!("simulated {method} failure on {}", self.name);
        }

        match method {
            "init" | "shutdown" => Ok(Value::Null),
            "program_buffered" => {
                self.shot_path = args.first().and_then(|v| v.as_str()).map(str::to_string);
                self.armed = true;
                Ok(json!({ "programmed": true }))
            }
            "start_run" => {
                std::thread::sleep(self.run_duration);
                Ok(Value::Null)
            }
            "abort_transition_to_buffered" | "abort_buffered" => {
                self.armed = false;
                self.shot_path = None;
                Ok(Value::Null)
            }
            "transition_to_manual" => {
                self.armed = false;
                self.shot_path = None;
                Ok(json!({ "armed": false }))
            }
            "program_manual" => Ok(args.get(1).cloned().unwrap_or(Value::Null)),
            other => anyhow::bail!("unreachable method {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arms_on_program_and_disarms_on_manual() {
        let mut worker = SimWorker::new("pulse_gen");
        worker
            .call("program_buffered", &[json!("/tmp/shot.json")], &Map::new())
            .unwrap();
        assert!(worker.armed);
        assert_eq!(worker.shot_path.as_deref(), Some("/tmp/shot.json"));

        let finals = worker
            .call("transition_to_manual", &[], &Map::new())
            .unwrap();
        assert_eq!(finals, json!({ "armed": false }));
        assert!(!worker.armed);
    }

    #[test]
    fn injected_failure_only_hits_named_method() {
        let mut worker = SimWorker::new("acq").failing_on("start_run");
        assert!(worker
            .call("program_buffered", &[json!("/tmp/shot.json")], &Map::new())
            .is_ok());
        let err = worker.call("start_run", &[], &Map::new()).unwrap_err();
        assert!(err.to_string().contains("simulated start_run failure"));
    }
}
