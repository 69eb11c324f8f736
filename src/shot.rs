//! Shot files and the persisted-resource "clean" operation.
//!
//! A shot is identified by the path of its JSON document. The document's
//! top level is an object holding named sections (device programs, globals,
//! the source script and so on) plus an `attributes` object of metadata and,
//! after a run, a volatile `results` section. Cleaning copies the preserved
//! sections and attributes into a destination document, stamps the repeat
//! count and drops everything volatile; it backs both repeat submission and
//! error recovery.

use crate::error::{AppResult, EngineError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Sections copied verbatim by the clean operation. Anything else (notably
/// `results`) is volatile run data and is stripped.
pub const PRESERVED_SECTIONS: &[&str] = &[
    "devices",
    "calibration",
    "script",
    "globals",
    "connections",
    "library",
    "waits",
];

static REPEAT_STEM: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^(?P<base>.*)_rep(?P<n>\d{5})$").expect("repeat suffix pattern is valid")
});

/// One unit of work in the pipeline's pending queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shot {
    path: PathBuf,
    repeat_count: u32,
}

impl Shot {
    /// Wraps a shot file path. The repeat count is recovered from the file
    /// name's `_repNNNNN` suffix when present.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let repeat_count = repeat_index(&path);
        Self { path, repeat_count }
    }

    /// Path of the shot's persisted document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// How many times this shot has been derived as a repeat.
    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    /// Reads the shot's top-level document.
    pub fn read_document(&self) -> AppResult<Map<String, Value>> {
        read_document(&self.path)
    }

    /// Names of the devices this shot programs, from the `devices` section.
    pub fn device_list(&self) -> AppResult<Vec<String>> {
        let doc = self.read_document()?;
        match doc.get("devices") {
            Some(Value::Object(devices)) => Ok(devices.keys().cloned().collect()),
            Some(_) => Err(EngineError::ShotFile(format!(
                "{}: devices section is not an object",
                self.path.display()
            ))),
            None => Err(EngineError::ShotFile(format!(
                "{}: missing devices section",
                self.path.display()
            ))),
        }
    }

    /// Sets one metadata attribute and rewrites the document.
    pub fn stamp_attribute(&self, key: &str, value: Value) -> AppResult<()> {
        let mut doc = self.read_document()?;
        let attributes = match doc.remove("attributes") {
            Some(Value::Object(m)) => m,
            _ => Map::new(),
        };
        let mut attributes = attributes;
        attributes.insert(key.to_string(), value);
        doc.insert("attributes".to_string(), Value::Object(attributes));
        write_document(&self.path, &doc)
    }
}

/// Derives the next repeat name for a shot path:
/// `shot_003.json -> shot_003_rep00001.json`,
/// `shot_003_rep00001.json -> shot_003_rep00002.json`.
pub fn repeat_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let next_stem = match REPEAT_STEM.captures(stem) {
        Some(caps) => {
            let n: u32 = caps["n"].parse().unwrap_or(0);
            format!("{}_rep{:05}", &caps["base"], n + 1)
        }
        None => format!("{stem}_rep00001"),
    };
    let file_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{next_stem}.{ext}"),
        None => next_stem,
    };
    path.with_file_name(file_name)
}

/// Repeat index encoded in a path's `_repNNNNN` suffix, or zero.
pub fn repeat_index(path: &Path) -> u32 {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    REPEAT_STEM
        .captures(stem)
        .and_then(|caps| caps["n"].parse().ok())
        .unwrap_or(0)
}

/// Copies the preserved sections and metadata attributes of `src` into
/// `dest`, stamping `repeat_count`. Volatile run data is dropped. Cleaning
/// an already-clean document reproduces it section for section.
pub fn clean_into(src: &Path, dest: &Path, repeat_count: u32) -> AppResult<()> {
    let doc = read_document(src)?;
    let mut out = Map::new();
    for &section in PRESERVED_SECTIONS {
        if let Some(value) = doc.get(section) {
            out.insert(section.to_string(), value.clone());
        }
    }
    let mut attributes = match doc.get("attributes") {
        Some(Value::Object(m)) => m.clone(),
        _ => Map::new(),
    };
    attributes.insert("repeat_count".to_string(), Value::from(repeat_count));
    out.insert("attributes".to_string(), Value::Object(attributes));
    write_document(dest, &out)
}

/// Strips volatile run data from a shot in place so it is safe to requeue.
///
/// When the original document cannot be rewritten, the content is cleaned
/// into a fresh repeat-derived name instead and the returned shot points
/// there. The raw file is never discarded.
pub fn clean_for_requeue(shot: &Shot) -> AppResult<Shot> {
    match clean_into(shot.path(), shot.path(), shot.repeat_count()) {
        Ok(()) => Ok(shot.clone()),
        Err(e) => {
            warn!(
                shot = %shot.path().display(),
                error = %e,
                "could not rewrite shot in place, deriving a fresh name"
            );
            let mut candidate = repeat_path(shot.path());
            while candidate.exists() {
                candidate = repeat_path(&candidate);
            }
            clean_into(shot.path(), &candidate, repeat_index(&candidate))?;
            Ok(Shot::new(candidate))
        }
    }
}

fn read_document(path: &Path) -> AppResult<Map<String, Value>> {
    let bytes = fs::read(path)?;
    match serde_json::from_slice(&bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(EngineError::ShotFile(format!(
            "{}: top level must be an object",
            path.display()
        ))),
    }
}

fn write_document(path: &Path, doc: &Map<String, Value>) -> AppResult<()> {
    fs::write(path, serde_json::to_vec_pretty(doc)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_document() -> Value {
        json!({
            "devices": {
                "pulse_gen": {"program": [1, 2, 3]},
                "acq": {"channels": 4}
            },
            "globals": {"detuning_mhz": -2.5},
            "script": "pulse(t=0)\n",
            "attributes": {"sequence_id": "seq_20260826", "repeat_count": 0},
            "results": {"counts": [812, 799]}
        })
    }

    fn write_shot(dir: &Path, name: &str, doc: &Value) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, serde_json::to_vec_pretty(doc).unwrap()).unwrap();
        path
    }

    #[test]
    fn repeat_path_appends_then_increments() {
        let first = repeat_path(Path::new("/data/shot_003.json"));
        assert_eq!(first, Path::new("/data/shot_003_rep00001.json"));
        let second = repeat_path(&first);
        assert_eq!(second, Path::new("/data/shot_003_rep00002.json"));
        assert_eq!(repeat_index(&second), 2);
        assert_eq!(repeat_index(Path::new("/data/shot_003.json")), 0);
    }

    #[test]
    fn device_list_reads_devices_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shot(dir.path(), "shot_000.json", &sample_document());
        let mut devices = Shot::new(&path).device_list().unwrap();
        devices.sort();
        assert_eq!(devices, vec!["acq", "pulse_gen"]);
    }

    #[test]
    fn missing_devices_section_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shot(dir.path(), "bad.json", &json!({"globals": {}}));
        assert!(matches!(
            Shot::new(&path).device_list(),
            Err(EngineError::ShotFile(_))
        ));
    }

    #[test]
    fn clean_strips_volatile_data_and_stamps_repeat_count() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_shot(dir.path(), "shot_000.json", &sample_document());
        let dest = dir.path().join("shot_000_rep00001.json");

        clean_into(&src, &dest, 1).unwrap();

        let cleaned = read_document(&dest).unwrap();
        assert!(!cleaned.contains_key("results"));
        assert_eq!(cleaned["devices"], sample_document()["devices"]);
        assert_eq!(cleaned["attributes"]["repeat_count"], json!(1));
        assert_eq!(cleaned["attributes"]["sequence_id"], json!("seq_20260826"));
    }

    #[test]
    fn clean_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_shot(dir.path(), "shot_000.json", &sample_document());
        let once = dir.path().join("once.json");
        let twice = dir.path().join("twice.json");

        clean_into(&src, &once, 0).unwrap();
        clean_into(&once, &twice, 0).unwrap();

        assert_eq!(fs::read(&once).unwrap(), fs::read(&twice).unwrap());
    }

    #[test]
    fn clean_in_place_requeues_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shot(dir.path(), "shot_000.json", &sample_document());
        let shot = Shot::new(&path);

        let requeued = clean_for_requeue(&shot).unwrap();

        assert_eq!(requeued.path(), shot.path());
        let doc = read_document(&path).unwrap();
        assert!(!doc.contains_key("results"));
    }

    #[test]
    fn stamp_attribute_preserves_existing_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shot(dir.path(), "shot_000.json", &sample_document());
        let shot = Shot::new(&path);

        shot.stamp_attribute("run_started", json!("2026-08-26T10:00:00Z"))
            .unwrap();

        let doc = shot.read_document().unwrap();
        assert_eq!(doc["attributes"]["sequence_id"], json!("seq_20260826"));
        assert_eq!(doc["attributes"]["run_started"], json!("2026-08-26T10:00:00Z"));
    }
}
