use serde::Serialize;
use std::time::Duration;

/// Timing of one item within one stage.
///
/// Offsets are measured from the pipeline epoch (the moment it was built), so
/// items of different stages can be compared directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemMetrics {
    pub index: usize,
    pub started: Duration,
    pub finished: Duration,
}

impl ItemMetrics {
    pub fn duration(&self) -> Duration {
        self.finished.saturating_sub(self.started)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageMetrics {
    pub index: usize,
    pub id: String,
    pub mode: String,
    pub terminal: bool,
    /// First item start to last item finish.
    pub duration_ms: u128,
    /// Sorted by item index.
    pub items: Vec<ItemMetrics>,
}

impl StageMetrics {
    pub(crate) fn from_items(
        index: usize,
        id: &str,
        mode: String,
        terminal: bool,
        mut items: Vec<ItemMetrics>,
    ) -> Self {
        items.sort_by_key(|item| item.index);
        let first = items.iter().map(|item| item.started).min();
        let last = items.iter().map(|item| item.finished).max();
        let duration_ms = match (first, last) {
            (Some(first), Some(last)) => last.saturating_sub(first).as_millis(),
            _ => 0,
        };

        Self {
            index,
            id: id.to_string(),
            mode,
            terminal,
            duration_ms,
            items,
        }
    }

    pub fn item(&self, index: usize) -> Option<&ItemMetrics> {
        self.items.iter().find(|item| item.index == index)
    }

    pub fn span(&self) -> Option<(Duration, Duration)> {
        let first = self.items.iter().map(|item| item.started).min()?;
        let last = self.items.iter().map(|item| item.finished).max()?;
        Some((first, last))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub total_duration_ms: u128,
    pub stages: Vec<StageMetrics>,
}

impl PipelineMetrics {
    pub fn stage(&self, id: &str) -> Option<&StageMetrics> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    pub fn item_duration(&self, stage: &str, index: usize) -> Option<Duration> {
        self.stage(stage)
            .and_then(|stage| stage.item(index))
            .map(ItemMetrics::duration)
    }
}
