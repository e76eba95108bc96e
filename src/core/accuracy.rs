use crate::domain::model::{AccuracySnapshot, ClassLabel};
use crate::domain::ports::LabelPolicy;
use std::path::Path;

/// Running prediction accuracy. `correct <= total` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccuracyTracker {
    total: u64,
    correct: u64,
}

impl AccuracyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one prediction; returns whether it matched.
    pub fn record(&mut self, truth: ClassLabel, predicted: ClassLabel) -> bool {
        let hit = truth == predicted;
        self.total += 1;
        if hit {
            self.correct += 1;
        }
        hit
    }

    /// Percentage correct, `None` before the first record.
    pub fn current_ratio(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some(self.correct as f64 / self.total as f64 * 100.0)
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.correct = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn correct(&self) -> u64 {
        self.correct
    }

    pub fn snapshot(&self) -> AccuracySnapshot {
        AccuracySnapshot {
            ratio: self.current_ratio(),
            total: self.total,
            correct: self.correct,
        }
    }
}

/// 以檔名判斷真實標籤：檔名含 "tiger" (不分大小寫) 即為 TIGER
#[derive(Debug, Clone, Copy, Default)]
pub struct FileNameLabelPolicy;

impl LabelPolicy for FileNameLabelPolicy {
    fn ground_truth(&self, image: &Path) -> Option<ClassLabel> {
        let name = image.file_name()?.to_string_lossy().to_lowercase();
        if name.contains("tiger") {
            Some(ClassLabel::Tiger)
        } else {
            Some(ClassLabel::NotTiger)
        }
    }
}
