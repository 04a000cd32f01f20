//! Structured parsing of runner output into milestone events.
//!
//! Line-oriented and regex-table driven. Recognized milestones: step
//! transitions (1 / 2 / 2.5 / 3 / overlay), DEM download or use notices,
//! triangulation failure diagnostics with extracted numeric hints, and
//! final compile markers. Anything else classifies as `generic`.

use demgrid_tools::StreamKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Schema version of persisted event documents.
pub const EVENTS_SCHEMA_VERSION: &str = "1";

/// Milestone classification of one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Step 1: vector data assembly.
    Step1,
    /// Step 2 (and 2.5): mesh construction.
    Step2,
    /// Step 3: DSF compilation.
    Step3,
    /// Overlay extraction.
    Overlay,
    /// Triangulation failure diagnostic.
    TriangleFail,
    /// DEM or imagery download notice.
    Download,
    /// Unrecognized line.
    Generic,
}

/// One structured event extracted from runner output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerEvent {
    /// Wall-clock timestamp (RFC 3339).
    pub ts: String,
    /// Source stream, `stdout` or `stderr`.
    pub stream: String,
    /// 1-based line number within the stream.
    pub line_no: u64,
    /// Milestone classification.
    pub kind: EventKind,
    /// Extracted fields plus the raw line under `detail`.
    pub payload: BTreeMap<String, serde_json::Value>,
}

struct Patterns {
    step: Regex,
    triangle_fail: Regex,
    number: Regex,
    mesh_start: Regex,
    dsf_compiled: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        step: Regex::new(r"(?i)\bStep\s+(\d+(?:\.\d+)?)\b").unwrap(),
        triangle_fail: Regex::new(
            r"(?i)(triangle4xp|minimum allowable angle|tiny triangles|area criterion)",
        )
        .unwrap(),
        number: Regex::new(r"-?\d+(?:\.\d+)?").unwrap(),
        mesh_start: Regex::new(r"(?i)start of the mesh algorithm").unwrap(),
        dsf_compiled: Regex::new(r"(?i)converted text dsf to binary dsf").unwrap(),
    })
}

fn payload_with_detail(line: &str) -> BTreeMap<String, serde_json::Value> {
    let mut payload = BTreeMap::new();
    payload.insert("detail".to_string(), serde_json::Value::from(line.trim()));
    payload
}

/// Classify one output line into an event.
pub fn classify_line(stream: StreamKind, line_no: u64, line: &str) -> RunnerEvent {
    let trimmed = line.trim();
    let p = patterns();
    let (kind, mut payload) = if let Some(captures) = p.step.captures(trimmed) {
        let step = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        let kind = match step.split('.').next().unwrap_or("") {
            "1" => EventKind::Step1,
            "2" => EventKind::Step2,
            "3" => EventKind::Step3,
            _ => EventKind::Generic,
        };
        let mut payload = payload_with_detail(trimmed);
        payload.insert("step".to_string(), serde_json::Value::from(step));
        (kind, payload)
    } else if p.triangle_fail.is_match(trimmed) {
        let mut payload = payload_with_detail(trimmed);
        let numbers: Vec<f64> = p
            .number
            .find_iter(trimmed)
            .filter_map(|m| m.as_str().parse().ok())
            .collect();
        if !numbers.is_empty() {
            payload.insert(
                "numbers".to_string(),
                serde_json::Value::from(numbers),
            );
        }
        (EventKind::TriangleFail, payload)
    } else if p.dsf_compiled.is_match(trimmed) {
        let mut payload = payload_with_detail(trimmed);
        payload.insert("marker".to_string(), serde_json::Value::from("dsf_compiled"));
        (EventKind::Step3, payload)
    } else if p.mesh_start.is_match(trimmed) {
        let mut payload = payload_with_detail(trimmed);
        payload.insert("marker".to_string(), serde_json::Value::from("mesh_start"));
        (EventKind::Step2, payload)
    } else if trimmed.to_ascii_lowercase().contains("download") {
        (EventKind::Download, payload_with_detail(trimmed))
    } else if trimmed.to_ascii_lowercase().contains("overlay") {
        (EventKind::Overlay, payload_with_detail(trimmed))
    } else {
        (EventKind::Generic, payload_with_detail(trimmed))
    };
    payload.retain(|_, value| !value.is_null());
    RunnerEvent {
        ts: chrono::Utc::now().to_rfc3339(),
        stream: stream.name().to_string(),
        line_no,
        kind,
        payload,
    }
}

/// Events of one runner attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptEvents {
    /// Milestone events in arrival order.
    pub events: Vec<RunnerEvent>,
}

/// Persisted per-tile event document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileEventLog {
    /// Document schema version.
    pub schema_version: String,
    /// Runner name.
    pub runner: String,
    /// Tile id.
    pub tile: String,
    /// One entry per attempt.
    pub attempts: Vec<AttemptEvents>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(line: &str) -> RunnerEvent {
        classify_line(StreamKind::Stdout, 1, line)
    }

    #[test]
    fn test_step_lines() {
        let event = classify("Step 1 : Building vector data");
        assert_eq!(event.kind, EventKind::Step1);
        assert_eq!(event.payload.get("step").unwrap(), "1");

        let event = classify("Step 2.5 : refining mesh");
        assert_eq!(event.kind, EventKind::Step2);
        assert_eq!(event.payload.get("step").unwrap(), "2.5");

        let event = classify("step 3 : building DSF");
        assert_eq!(event.kind, EventKind::Step3);
    }

    #[test]
    fn test_triangle_failure_extracts_numbers() {
        let event = classify("Triangle4XP aborted: minimum allowable angle 18.5 not met after 3 tries");
        assert_eq!(event.kind, EventKind::TriangleFail);
        let numbers = event.payload.get("numbers").unwrap().as_array().unwrap();
        assert_eq!(numbers[1].as_f64().unwrap(), 18.5);
    }

    #[test]
    fn test_download_and_overlay() {
        assert_eq!(classify("Downloading elevation data...").kind, EventKind::Download);
        assert_eq!(classify("Extracting overlay from tile").kind, EventKind::Overlay);
    }

    #[test]
    fn test_compile_marker_maps_to_step3() {
        let event = classify("Converted text DSF to binary DSF");
        assert_eq!(event.kind, EventKind::Step3);
        assert_eq!(event.payload.get("marker").unwrap(), "dsf_compiled");
    }

    #[test]
    fn test_unknown_is_generic() {
        let event = classify("some chatter about textures");
        assert_eq!(event.kind, EventKind::Generic);
        assert_eq!(
            event.payload.get("detail").unwrap(),
            "some chatter about textures"
        );
    }

    #[test]
    fn test_event_log_serializes() {
        let log = TileEventLog {
            schema_version: EVENTS_SCHEMA_VERSION.to_string(),
            runner: "ortho4xp".to_string(),
            tile: "+47+008".to_string(),
            attempts: vec![AttemptEvents {
                events: vec![classify("Step 1 : go")],
            }],
        };
        let json = serde_json::to_string(&log).unwrap();
        assert!(json.contains("\"schema_version\":\"1\""));
        assert!(json.contains("\"kind\":\"step1\""));
    }
}
