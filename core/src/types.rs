//! Work assignment and result types shared by the harness and its workers
//!
//! Everything here crosses the process boundary as JSON, so all types are
//! `Serialize + Deserialize`.

use std::collections::{BTreeMap, HashSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WorkError;

/// Open key-value mapping carried with an assignment (model, generation parameters, ...).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// One unit of work bound to one exclusive resource slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// Resource slot in `0..N`, unique across one run
    pub resource_id: u32,

    /// Ordered work items (prompts)
    pub payload: Vec<String>,

    /// Model identifier, engine and sampling settings, ...
    #[serde(default)]
    pub metadata: Metadata,
}

impl WorkAssignment {
    /// Create an assignment with empty metadata.
    ///
    /// # Arguments
    ///
    /// * `resource_id` - Slot the assignment is bound to, unique within a run
    /// * `payload` - Work items, answered in order
    pub fn new(resource_id: u32, payload: Vec<String>) -> Self {
        Self {
            resource_id,
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Attach a metadata entry, serializing the value to JSON.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        self.metadata.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Decode a metadata entry. `Ok(None)` when the key is absent.
    pub fn metadata_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.metadata
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    /// String metadata entry, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(serde_json::Value::as_str)
    }

    /// Error-tagged results for every item of this assignment.
    pub fn fail_all(&self, error: &WorkError) -> Vec<WorkResult> {
        self.payload
            .iter()
            .enumerate()
            .map(|(index, prompt)| WorkResult::failure(self.resource_id, index, prompt, error.clone()))
            .collect()
    }
}

/// The hardware a worker is allowed to touch, passed explicitly to the inference call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceScope {
    pub resource_id: u32,
    pub devices: Vec<u32>,
}

impl ResourceScope {
    /// Scope owning exactly the device with the same index as the slot.
    pub fn single(resource_id: u32) -> Self {
        Self {
            resource_id,
            devices: vec![resource_id],
        }
    }

    /// Scope owning an explicit device group, for tensor-parallel workers.
    pub fn with_devices(resource_id: u32, devices: Vec<u32>) -> Self {
        Self { resource_id, devices }
    }

    /// Value for `CUDA_VISIBLE_DEVICES`, e.g. `"0,1,2"`.
    pub fn visible_devices(&self) -> String {
        self.devices
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

/// Success or error for one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { text: String },
    Failed(WorkError),
}

/// Outcome of one `(resource_id, item_index)` pair. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkResult {
    pub resource_id: u32,
    pub item_index: usize,
    pub prompt: String,
    pub outcome: Outcome,
}

impl WorkResult {
    pub fn success(
        resource_id: u32,
        item_index: usize,
        prompt: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            resource_id,
            item_index,
            prompt: prompt.into(),
            outcome: Outcome::Success { text: text.into() },
        }
    }

    pub fn failure(
        resource_id: u32,
        item_index: usize,
        prompt: impl Into<String>,
        error: WorkError,
    ) -> Self {
        Self {
            resource_id,
            item_index,
            prompt: prompt.into(),
            outcome: Outcome::Failed(error),
        }
    }

    pub fn output(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { text } => Some(text),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&WorkError> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failed(err) => Some(err),
        }
    }

    pub const fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub const fn key(&self) -> (u32, usize) {
        (self.resource_id, self.item_index)
    }
}

/// Wall-clock timings a worker reports with its results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTiming {
    /// Warmup generation, when one was requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup_ms: Option<u64>,

    /// The timed generation call over the whole payload
    pub generation_ms: u64,
}

/// One frame on the worker → harness channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBatch {
    pub resource_id: u32,
    pub results: Vec<WorkResult>,
    #[serde(default)]
    pub timing: BatchTiming,
}

/// All results of one run, ordered by `resource_id` then `item_index`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    results: Vec<WorkResult>,
    timings: BTreeMap<u32, BatchTiming>,
}

impl ResultSet {
    /// Build a result set; results are sorted regardless of arrival order.
    pub fn new(mut results: Vec<WorkResult>, timings: BTreeMap<u32, BatchTiming>) -> Self {
        results.sort_by_key(WorkResult::key);
        Self { results, timings }
    }

    /// Number of results, one per dispatched item once a run has completed.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Results in `(resource_id, item_index)` order.
    pub fn iter(&self) -> std::slice::Iter<'_, WorkResult> {
        self.results.iter()
    }

    pub fn results(&self) -> &[WorkResult] {
        &self.results
    }

    /// Timing reported by each worker that delivered a batch, keyed by resource id.
    pub const fn timings(&self) -> &BTreeMap<u32, BatchTiming> {
        &self.timings
    }

    /// Results of one worker, in item order.
    pub fn for_resource(&self, resource_id: u32) -> impl Iterator<Item = &WorkResult> {
        self.results
            .iter()
            .filter(move |r| r.resource_id == resource_id)
    }

    pub fn successes(&self) -> impl Iterator<Item = &WorkResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &WorkResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// True when nothing succeeded (including the empty set).
    pub fn all_failed(&self) -> bool {
        self.results.iter().all(|r| !r.is_success())
    }

    /// Exactly one outcome per dispatched `(resource_id, item_index)` and nothing else.
    pub fn is_complete_for(&self, assignments: &[WorkAssignment]) -> bool {
        let expected: HashSet<(u32, usize)> = assignments
            .iter()
            .flat_map(|a| (0..a.payload.len()).map(move |i| (a.resource_id, i)))
            .collect();

        let mut seen = HashSet::with_capacity(self.results.len());
        for result in &self.results {
            if !expected.contains(&result.key()) || !seen.insert(result.key()) {
                return false;
            }
        }
        seen.len() == expected.len()
    }
}

impl<'a> IntoIterator for &'a ResultSet {
    type Item = &'a WorkResult;
    type IntoIter = std::slice::Iter<'a, WorkResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkErrorKind;

    #[test]
    fn test_result_set_sorts_by_resource_then_item() {
        let results = vec![
            WorkResult::success(2, 1, "c2", "x"),
            WorkResult::success(0, 1, "a2", "x"),
            WorkResult::success(2, 0, "c1", "x"),
            WorkResult::success(1, 0, "b1", "x"),
            WorkResult::success(0, 0, "a1", "x"),
        ];
        let set = ResultSet::new(results, BTreeMap::new());
        let keys: Vec<_> = set.iter().map(WorkResult::key).collect();
        assert_eq!(keys, vec![(0, 0), (0, 1), (1, 0), (2, 0), (2, 1)]);
    }

    #[test]
    fn test_is_complete_for_detects_gaps_and_duplicates() {
        let assignments = vec![
            WorkAssignment::new(0, vec!["a".into(), "b".into()]),
            WorkAssignment::new(1, vec!["c".into()]),
        ];

        let complete = ResultSet::new(
            vec![
                WorkResult::success(0, 0, "a", "x"),
                WorkResult::success(0, 1, "b", "x"),
                WorkResult::success(1, 0, "c", "x"),
            ],
            BTreeMap::new(),
        );
        assert!(complete.is_complete_for(&assignments));

        let missing = ResultSet::new(
            vec![
                WorkResult::success(0, 0, "a", "x"),
                WorkResult::success(1, 0, "c", "x"),
            ],
            BTreeMap::new(),
        );
        assert!(!missing.is_complete_for(&assignments));

        let duplicated = ResultSet::new(
            vec![
                WorkResult::success(0, 0, "a", "x"),
                WorkResult::success(0, 0, "a", "y"),
                WorkResult::success(0, 1, "b", "x"),
                WorkResult::success(1, 0, "c", "x"),
            ],
            BTreeMap::new(),
        );
        assert!(!duplicated.is_complete_for(&assignments));
    }

    #[test]
    fn test_fail_all_tags_every_item() {
        let assignment = WorkAssignment::new(3, vec!["p1".into(), "p2".into()]);
        let err = WorkError::new(WorkErrorKind::Inference, "boom");
        let results = assignment.fail_all(&err);

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error() == Some(&err)));
        assert_eq!(results[1].prompt, "p2");
        assert_eq!(results[1].key(), (3, 1));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let assignment = WorkAssignment::new(0, vec![])
            .with_metadata("model", "Qwen/Qwen2.5-7B-Instruct")
            .unwrap()
            .with_metadata("max_tokens", 200)
            .unwrap();

        assert_eq!(assignment.metadata_str("model"), Some("Qwen/Qwen2.5-7B-Instruct"));
        assert_eq!(assignment.metadata_as::<u32>("max_tokens").unwrap(), Some(200));
        assert_eq!(assignment.metadata_as::<u32>("missing").unwrap(), None);
        assert!(assignment.metadata_as::<u32>("model").is_err());
    }

    #[test]
    fn test_outcome_wire_format() {
        let ok = WorkResult::success(0, 0, "p", "echo:p");
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["outcome"]["status"], "success");
        assert_eq!(json["outcome"]["text"], "echo:p");

        let failed = WorkResult::failure(1, 0, "p", WorkError::new(WorkErrorKind::Timeout, "late"));
        let json = serde_json::to_string(&failed).unwrap();
        let back: WorkResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error().map(|e| e.kind), Some(WorkErrorKind::Timeout));
        assert_eq!(back.output(), None);
    }

    #[test]
    fn test_visible_devices() {
        assert_eq!(ResourceScope::single(2).visible_devices(), "2");
        assert_eq!(
            ResourceScope::with_devices(0, vec![0, 1, 2]).visible_devices(),
            "0,1,2"
        );
    }
}
