use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Streaming mean/variance accumulator using Welford's online algorithm.
///
/// Holds a fixed amount of state regardless of how many observations are
/// pushed, and avoids the catastrophic cancellation a naive
/// sum-of-squares approach suffers on long runs. This is a correctness
/// requirement for per-frame series with millions of entries, not just a
/// memory optimization.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamingStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl StreamingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Sample variance (Bessel's correction). A single observation has
    /// variance zero, an empty accumulator has none.
    pub fn sample_variance(&self) -> Option<f64> {
        match self.count {
            0 => None,
            1 => Some(0.0),
            n => Some(self.m2 / (n - 1) as f64),
        }
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.sample_variance().map(f64::sqrt)
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

// Serialized as the finalized summary (or null when empty) so exports never
// leak the internal M2 accumulator.
impl Serialize for StreamingStats {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if self.count == 0 {
            return serializer.serialize_none();
        }
        let mut state = serializer.serialize_struct("StreamingStats", 5)?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("mean", &self.mean)?;
        state.serialize_field("std_dev", &self.std_dev())?;
        state.serialize_field("min", &self.min)?;
        state.serialize_field("max", &self.max)?;
        state.end()
    }
}
