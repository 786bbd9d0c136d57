//! Rolling per-worker performance, used only as a scheduling hint

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    #[serde(skip)]
    alpha: f64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub units: u64,
    pub failures: u64,
}

impl PerformanceStats {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            success_rate: 1.0,
            avg_duration_ms: 0.0,
            units: 0,
            failures: 0,
        }
    }

    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = ema(self.alpha, self.success_rate, sample);
        // First sample seeds the average
        self.avg_duration_ms = if self.units == 0 {
            duration_ms as f64
        } else {
            ema(self.alpha, self.avg_duration_ms, duration_ms as f64)
        };
        self.units += 1;
        if !success {
            self.failures += 1;
        }
    }
}

pub fn ema(alpha: f64, previous: f64, sample: f64) -> f64 {
    alpha * sample + (1.0 - alpha) * previous
}
