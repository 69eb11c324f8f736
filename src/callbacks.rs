//! Collaborator callback points consumed by the shot pipeline.
//!
//! Collaborators (analysis submission, front-panel plumbing, plugins) hook
//! into named points with plain closures. The registry is built up front and
//! handed to the pipeline at construction; there is no global mutable
//! registry. A failing callback is logged and otherwise ignored, it must
//! never abort the pipeline.

use crate::shot::Shot;
use std::collections::HashMap;
use tracing::warn;

/// Veto point: skip the analysis handoff for this shot.
pub const ANALYSIS_CANCEL_SEND: &str = "analysis_cancel_send";
/// Veto point: skip deriving a repeat for this shot.
pub const SHOT_IGNORE_REPEAT: &str = "shot_ignore_repeat";
/// Observer point: a shot finished its cycle.
pub const SHOT_COMPLETE: &str = "shot_complete";

type Hook = Box<dyn Fn(&Shot) -> anyhow::Result<bool> + Send + Sync>;

/// Registry of collaborator callbacks, keyed by hook point name.
#[derive(Default)]
pub struct CallbackRegistry {
    hooks: HashMap<&'static str, Vec<Hook>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback at a hook point. Veto points interpret a `true`
    /// return as a veto; observer points ignore the return value.
    pub fn register<F>(&mut self, point: &'static str, callback: F)
    where
        F: Fn(&Shot) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.hooks.entry(point).or_default().push(Box::new(callback));
    }

    /// Runs every callback at a veto point; `true` if any vetoed. Callback
    /// failures are logged and count as "no veto".
    pub fn any_true(&self, point: &'static str, shot: &Shot) -> bool {
        let mut vetoed = false;
        for callback in self.hooks.get(point).into_iter().flatten() {
            match callback(shot) {
                Ok(answer) => vetoed = vetoed || answer,
                Err(e) => {
                    warn!(hook = point, shot = %shot.path().display(), error = %e, "callback failed");
                }
            }
        }
        vetoed
    }

    /// Runs every callback at an observer point, logging failures.
    pub fn notify(&self, point: &'static str, shot: &Shot) {
        for callback in self.hooks.get(point).into_iter().flatten() {
            if let Err(e) = callback(shot) {
                warn!(hook = point, shot = %shot.path().display(), error = %e, "callback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn empty_registry_never_vetoes() {
        let registry = CallbackRegistry::new();
        let shot = Shot::new("/data/shot_000.json");
        assert!(!registry.any_true(ANALYSIS_CANCEL_SEND, &shot));
    }

    #[test]
    fn one_veto_wins_over_many_approvals() {
        let mut registry = CallbackRegistry::new();
        registry.register(SHOT_IGNORE_REPEAT, |_| Ok(false));
        registry.register(SHOT_IGNORE_REPEAT, |_| Ok(true));
        registry.register(SHOT_IGNORE_REPEAT, |_| Ok(false));

        let shot = Shot::new("/data/shot_000.json");
        assert!(registry.any_true(SHOT_IGNORE_REPEAT, &shot));
    }

    #[test]
    fn failing_callback_is_ignored_and_others_still_run() {
        let mut registry = CallbackRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(SHOT_COMPLETE, |_| anyhow::bail!("collaborator blew up"));
        let counter = Arc::clone(&calls);
        registry.register(SHOT_COMPLETE, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        });

        let shot = Shot::new("/data/shot_000.json");
        registry.notify(SHOT_COMPLETE, &shot);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A failing veto callback counts as "no veto".
        let mut vetoes = CallbackRegistry::new();
        vetoes.register(ANALYSIS_CANCEL_SEND, |_| anyhow::bail!("broken"));
        assert!(!vetoes.any_true(ANALYSIS_CANCEL_SEND, &shot));
    }
}
