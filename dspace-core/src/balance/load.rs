use std::collections::VecDeque;

/// Moving average of the most recent per-step workloads.
#[derive(Debug, Clone)]
pub struct LoadMeter {
    window: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl LoadMeter {
    pub fn new(window: usize) -> Self {
        LoadMeter {
            window: window.max(1),
            samples: VecDeque::with_capacity(window.max(1)),
            sum: 0.,
        }
    }

    pub fn record(&mut self, load: f64) {
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(load);
        self.sum += load;
    }

    /// Average over the window, zero before anything was recorded.
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.
        } else {
            self.sum / self.samples.len() as f64
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.;
    }
}
