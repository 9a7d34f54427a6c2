//! Cheap reductions over activations, computed without retaining the tensor.

use serde::{Deserialize, Serialize};

/// Summary statistics of one activation tensor (or a pooled set of them).
///
/// Non-finite values are excluded; `elements` counts the finite values used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivationStats {
    pub mean: f64,
    pub mean_abs: f64,
    /// Sample standard deviation (n - 1).
    pub std: f64,
    pub max_abs: f64,
    /// Fraction of values with magnitude below the sparsity threshold.
    pub sparsity: f64,
    pub elements: u64,
}

impl ActivationStats {
    pub fn from_slice(values: &[f32], sparsity_threshold: f32) -> Self {
        let mut n = 0u64;
        let mut sum = 0.0f64;
        let mut sum_abs = 0.0f64;
        let mut max_abs = 0.0f64;
        let mut near_zero = 0u64;
        for &v in values.iter().filter(|v| v.is_finite()) {
            let x = v as f64;
            n += 1;
            sum += x;
            sum_abs += x.abs();
            max_abs = max_abs.max(x.abs());
            if v.abs() < sparsity_threshold {
                near_zero += 1;
            }
        }
        if n == 0 {
            return Self::default();
        }
        let mean = sum / n as f64;
        let m2: f64 = values
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum();
        let std = if n > 1 {
            (m2 / (n - 1) as f64).sqrt()
        } else {
            0.0
        };
        Self {
            mean,
            mean_abs: sum_abs / n as f64,
            std,
            max_abs,
            sparsity: near_zero as f64 / n as f64,
            elements: n,
        }
    }

    /// Pool two summaries as if computed over the concatenated values.
    pub fn merge(&self, other: &ActivationStats) -> ActivationStats {
        if self.elements == 0 {
            return *other;
        }
        if other.elements == 0 {
            return *self;
        }
        let n1 = self.elements as f64;
        let n2 = other.elements as f64;
        let n = n1 + n2;
        let mean = (n1 * self.mean + n2 * other.mean) / n;
        let m2 = self.std * self.std * (n1 - 1.0)
            + other.std * other.std * (n2 - 1.0)
            + (self.mean - other.mean).powi(2) * n1 * n2 / n;
        ActivationStats {
            mean,
            mean_abs: (n1 * self.mean_abs + n2 * other.mean_abs) / n,
            std: if n > 1.0 { (m2 / (n - 1.0)).sqrt() } else { 0.0 },
            max_abs: self.max_abs.max(other.max_abs),
            sparsity: (n1 * self.sparsity + n2 * other.sparsity) / n,
            elements: self.elements + other.elements,
        }
    }

    /// Pool an optional accumulator with a new summary.
    pub fn pool(acc: Option<ActivationStats>, next: Option<ActivationStats>) -> Option<ActivationStats> {
        match (acc, next) {
            (Some(a), Some(b)) => Some(a.merge(&b)),
            (a, b) => a.or(b),
        }
    }
}
