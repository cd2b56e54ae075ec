//! Pending pipelines of one queue, in release order.

use keel_core::PipelineId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    pipeline_id: PipelineId,
    priority: i64,
}

/// Priority-ordered holding area.
///
/// A new pipeline is placed after every pending pipeline of equal or higher
/// priority, so equal priorities release first-in first-out. A reorder moves
/// the listed pipelines to the front in the given order; later admissions
/// are still placed by priority.
#[derive(Debug, Clone, Default)]
pub struct PriorityQueue {
    entries: Vec<Entry>,
}

impl PriorityQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a pipeline. Returns false if it is already pending.
    pub fn push(&mut self, pipeline_id: PipelineId, priority: i64) -> bool {
        if self.contains(pipeline_id) {
            return false;
        }
        let at = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            at,
            Entry {
                pipeline_id,
                priority,
            },
        );
        true
    }

    /// Takes the next pipeline to release.
    pub fn pop(&mut self) -> Option<PipelineId> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.remove(0).pipeline_id)
    }

    /// Removes a pending pipeline. Returns false if it was not pending.
    pub fn remove(&mut self, pipeline_id: PipelineId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.pipeline_id != pipeline_id);
        self.entries.len() != before
    }

    /// Moves the listed pending pipelines to the front, in the listed order.
    /// IDs that are not pending are ignored; the rest keep their order.
    pub fn reorder(&mut self, order: &[PipelineId]) {
        let mut front = Vec::with_capacity(order.len());
        for id in order {
            if let Some(at) = self.entries.iter().position(|e| e.pipeline_id == *id) {
                front.push(self.entries.remove(at));
            }
        }
        front.append(&mut self.entries);
        self.entries = front;
    }

    /// Returns true if the pipeline is pending.
    #[must_use]
    pub fn contains(&self, pipeline_id: PipelineId) -> bool {
        self.entries.iter().any(|e| e.pipeline_id == pipeline_id)
    }

    /// Pending pipelines in release order.
    #[must_use]
    pub fn pipeline_ids(&self) -> Vec<PipelineId> {
        self.entries.iter().map(|e| e.pipeline_id).collect()
    }

    /// Number of pending pipelines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
