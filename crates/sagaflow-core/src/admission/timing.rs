//! Historical per-workflow run durations.
//!
//! Keeps a bounded window of recent completed-run durations per workflow
//! version; the mean is the estimate deadline-aware admission uses.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use sagaflow_types::workflow::WorkflowRef;

#[derive(Debug, Clone)]
pub struct TimingEstimator {
    window: usize,
    samples: HashMap<WorkflowRef, VecDeque<Duration>>,
}

impl TimingEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: HashMap::new(),
        }
    }

    pub fn record(&mut self, workflow: &WorkflowRef, duration: Duration) {
        let samples = self.samples.entry(workflow.clone()).or_default();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(duration);
    }

    /// Mean of the recorded window, or `None` before the first sample.
    pub fn estimate(&self, workflow: &WorkflowRef) -> Option<Duration> {
        let samples = self.samples.get(workflow)?;
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf(intent: &str) -> WorkflowRef {
        WorkflowRef {
            intent: intent.to_string(),
            version: 1,
        }
    }

    #[test]
    fn test_mean_over_window() {
        let mut timing = TimingEstimator::new(2);
        assert_eq!(timing.estimate(&wf("a")), None);

        timing.record(&wf("a"), Duration::from_secs(10));
        timing.record(&wf("a"), Duration::from_secs(20));
        assert_eq!(timing.estimate(&wf("a")), Some(Duration::from_secs(15)));

        // Oldest sample falls out of the window
        timing.record(&wf("a"), Duration::from_secs(40));
        assert_eq!(timing.estimate(&wf("a")), Some(Duration::from_secs(30)));
        assert_eq!(timing.estimate(&wf("b")), None);
    }
}
