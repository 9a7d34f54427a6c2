//! Tensor primitives the module graph computes with, and the device they run on.
//!
//! Every module receives its `TensorOps` at call time, so operation-level
//! profiling can swap in a recording implementation without touching modules.

use super::tensor::Tensor;
use crate::errors::InstrumentError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Execution device. `synchronize` blocks until queued work has finished.
pub trait Device: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn synchronize(&self);
}

/// Host CPU: work is complete when a call returns.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuDevice;

impl Device for CpuDevice {
    fn name(&self) -> &str {
        "cpu"
    }

    fn synchronize(&self) {}
}

/// Coarse class of a tensor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Matmul,
    Scale,
    Mask,
    Softmax,
    Dropout,
    Activation,
    Elementwise,
    Norm,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Matmul => "matmul",
            OpKind::Scale => "scale",
            OpKind::Mask => "mask",
            OpKind::Softmax => "softmax",
            OpKind::Dropout => "dropout",
            OpKind::Activation => "activation",
            OpKind::Elementwise => "elementwise",
            OpKind::Norm => "norm",
        }
    }
}

impl std::str::FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "matmul" => Ok(OpKind::Matmul),
            "scale" => Ok(OpKind::Scale),
            "mask" => Ok(OpKind::Mask),
            "softmax" => Ok(OpKind::Softmax),
            "dropout" => Ok(OpKind::Dropout),
            "activation" => Ok(OpKind::Activation),
            "elementwise" => Ok(OpKind::Elementwise),
            "norm" => Ok(OpKind::Norm),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

pub trait TensorOps: Send + Sync + Debug {
    /// `a [m, k] × b [k, n]`.
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError>;
    /// `a [m, k] × bᵀ` with `b [n, k]` (linear layers, attention scores).
    fn matmul_transposed(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError>;
    fn scale(&self, x: &Tensor, factor: f32) -> Tensor;
    /// Set `scores[i][j]` to `-inf` where `j > i + offset`.
    fn causal_mask(&self, scores: &Tensor, offset: usize) -> Tensor;
    /// Row-wise softmax.
    fn softmax(&self, x: &Tensor) -> Tensor;
    /// Inference-mode dropout: identity, `p` is recorded but not applied.
    fn dropout(&self, x: &Tensor, p: f32) -> Tensor;
    fn silu(&self, x: &Tensor) -> Tensor;
    fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError>;
    fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError>;
    /// Row-wise RMS normalization scaled by `weight`.
    fn rms_norm(&self, x: &Tensor, weight: &[f32], eps: f32) -> Result<Tensor, InstrumentError>;
}

fn same_shape(op: &'static str, a: &Tensor, b: &Tensor) -> Result<(), InstrumentError> {
    if a.shape() != b.shape() {
        return Err(InstrumentError::ShapeMismatch {
            op,
            detail: format!("{:?} vs {:?}", a.shape(), b.shape()),
        });
    }
    Ok(())
}

#[inline]
fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

fn map(x: &Tensor, f: impl Fn(f32) -> f32 + Sync) -> Tensor {
    let data: Vec<f32> = x.data().par_iter().map(|&v| f(v)).collect();
    Tensor::new(x.rows(), x.cols(), data).unwrap_or_else(|_| x.clone())
}

/// Reference CPU implementation, parallel over output rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuOps;

impl TensorOps for CpuOps {
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        if a.cols() != b.rows() {
            return Err(InstrumentError::ShapeMismatch {
                op: "matmul",
                detail: format!("{:?} x {:?}", a.shape(), b.shape()),
            });
        }
        let (m, k, n) = (a.rows(), a.cols(), b.cols());
        let mut out = Tensor::zeros(m, n);
        out.data_mut()
            .par_chunks_mut(n.max(1))
            .enumerate()
            .for_each(|(i, row)| {
                let lhs = a.row(i);
                for (j, o) in row.iter_mut().enumerate() {
                    let mut sum = 0.0f32;
                    for p in 0..k {
                        sum += lhs[p] * b.data()[p * n + j];
                    }
                    *o = sum;
                }
            });
        Ok(out)
    }

    fn matmul_transposed(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        if a.cols() != b.cols() {
            return Err(InstrumentError::ShapeMismatch {
                op: "matmul_transposed",
                detail: format!("{:?} x {:?}ᵀ", a.shape(), b.shape()),
            });
        }
        let (m, n) = (a.rows(), b.rows());
        let mut out = Tensor::zeros(m, n);
        out.data_mut()
            .par_chunks_mut(n.max(1))
            .enumerate()
            .for_each(|(i, row)| {
                let lhs = a.row(i);
                for (j, o) in row.iter_mut().enumerate() {
                    *o = lhs.iter().zip(b.row(j)).map(|(x, y)| x * y).sum();
                }
            });
        Ok(out)
    }

    fn scale(&self, x: &Tensor, factor: f32) -> Tensor {
        map(x, |v| v * factor)
    }

    fn causal_mask(&self, scores: &Tensor, offset: usize) -> Tensor {
        let mut out = scores.clone();
        let cols = out.cols();
        for (i, row) in out.data_mut().chunks_mut(cols.max(1)).enumerate() {
            for (j, v) in row.iter_mut().enumerate() {
                if j > i + offset {
                    *v = f32::NEG_INFINITY;
                }
            }
        }
        out
    }

    fn softmax(&self, x: &Tensor) -> Tensor {
        let mut out = x.clone();
        let cols = out.cols();
        out.data_mut().par_chunks_mut(cols.max(1)).for_each(|row| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            if !max.is_finite() {
                row.iter_mut().for_each(|v| *v = 0.0);
                return;
            }
            let mut sum = 0.0f32;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        });
        out
    }

    fn dropout(&self, x: &Tensor, _p: f32) -> Tensor {
        x.clone()
    }

    fn silu(&self, x: &Tensor) -> Tensor {
        map(x, silu)
    }

    fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        same_shape("mul", a, b)?;
        let data = a.data().iter().zip(b.data()).map(|(x, y)| x * y).collect();
        Tensor::new(a.rows(), a.cols(), data)
    }

    fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        same_shape("add", a, b)?;
        let data = a.data().iter().zip(b.data()).map(|(x, y)| x + y).collect();
        Tensor::new(a.rows(), a.cols(), data)
    }

    fn rms_norm(&self, x: &Tensor, weight: &[f32], eps: f32) -> Result<Tensor, InstrumentError> {
        if weight.len() != x.cols() {
            return Err(InstrumentError::ShapeMismatch {
                op: "rms_norm",
                detail: format!("weight {} vs hidden {}", weight.len(), x.cols()),
            });
        }
        let mut out = x.clone();
        let cols = out.cols();
        out.data_mut().par_chunks_mut(cols.max(1)).for_each(|row| {
            let n = row.len() as f32;
            let square_sum: f32 = row.iter().map(|v| v * v).sum();
            let rms = (square_sum / n + eps).sqrt();
            for (v, w) in row.iter_mut().zip(weight) {
                *v = (*v / rms) * w;
            }
        });
        Ok(out)
    }
}

/// Operation-specific measurements. One fixed variant per operation class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationExtras {
    #[default]
    None,
    Mask {
        masked_fraction: f64,
    },
    Softmax {
        /// Mean per-row entropy of the attention distribution, in nats.
        entropy: f64,
        max_weight: f64,
        sparsity: f64,
    },
    Dropout {
        kill_ratio: f64,
    },
    Activation {
        kill_ratio: f64,
    },
    Norm {
        /// Output variance over input variance.
        variance_ratio: Option<f64>,
    },
}

impl OperationExtras {
    /// Weighted combination of two observations of the same operation.
    pub fn combine(self, weight: f64, other: OperationExtras, other_weight: f64) -> OperationExtras {
        let total = weight + other_weight;
        if total <= 0.0 {
            return other;
        }
        let avg = |a: f64, b: f64| (a * weight + b * other_weight) / total;
        use OperationExtras::*;
        match (self, other) {
            (Mask { masked_fraction: a }, Mask { masked_fraction: b }) => Mask {
                masked_fraction: avg(a, b),
            },
            (
                Softmax {
                    entropy: e1,
                    max_weight: m1,
                    sparsity: s1,
                },
                Softmax {
                    entropy: e2,
                    max_weight: m2,
                    sparsity: s2,
                },
            ) => Softmax {
                entropy: avg(e1, e2),
                max_weight: m1.max(m2),
                sparsity: avg(s1, s2),
            },
            (Dropout { kill_ratio: a }, Dropout { kill_ratio: b }) => Dropout {
                kill_ratio: avg(a, b),
            },
            (Activation { kill_ratio: a }, Activation { kill_ratio: b }) => Activation {
                kill_ratio: avg(a, b),
            },
            (Norm { variance_ratio: a }, Norm { variance_ratio: b }) => Norm {
                variance_ratio: match (a, b) {
                    (Some(a), Some(b)) => Some(avg(a, b)),
                    (a, b) => a.or(b),
                },
            },
            (_, other) => other,
        }
    }
}

fn variance(values: &[f32]) -> f64 {
    let finite: Vec<f64> = values.iter().filter(|v| v.is_finite()).map(|&v| v as f64).collect();
    if finite.is_empty() {
        return 0.0;
    }
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    finite.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / finite.len() as f64
}

pub(crate) fn mask_extras(output: &Tensor) -> OperationExtras {
    let masked = output.data().iter().filter(|v| **v == f32::NEG_INFINITY).count();
    OperationExtras::Mask {
        masked_fraction: masked as f64 / output.numel().max(1) as f64,
    }
}

pub(crate) fn softmax_extras(probs: &Tensor, threshold: f32) -> OperationExtras {
    let rows = probs.rows().max(1) as f64;
    let mut entropy = 0.0f64;
    let mut max_weight = 0.0f64;
    let mut small = 0usize;
    for r in 0..probs.rows() {
        for &p in probs.row(r) {
            let p = p as f64;
            if p > 0.0 {
                entropy -= p * p.ln();
            }
            max_weight = max_weight.max(p);
        }
    }
    for &p in probs.data() {
        if p < threshold {
            small += 1;
        }
    }
    OperationExtras::Softmax {
        entropy: entropy / rows,
        max_weight,
        sparsity: small as f64 / probs.numel().max(1) as f64,
    }
}

pub(crate) fn dropout_extras(input: &Tensor, output: &Tensor) -> OperationExtras {
    let killed = input
        .data()
        .iter()
        .zip(output.data())
        .filter(|(i, o)| **i != 0.0 && **o == 0.0)
        .count();
    OperationExtras::Dropout {
        kill_ratio: killed as f64 / input.numel().max(1) as f64,
    }
}

pub(crate) fn activation_extras(output: &Tensor, threshold: f32) -> OperationExtras {
    let killed = output.data().iter().filter(|v| v.abs() < threshold).count();
    OperationExtras::Activation {
        kill_ratio: killed as f64 / output.numel().max(1) as f64,
    }
}

pub(crate) fn norm_extras(input: &Tensor, output: &Tensor) -> OperationExtras {
    let vin = variance(input.data());
    OperationExtras::Norm {
        variance_ratio: (vin > 0.0).then(|| variance(output.data()) / vin),
    }
}

/// Estimated floating point operations for one call. `inner_dim` is the
/// contracted dimension of a matmul and ignored otherwise.
pub fn estimate_flops(kind: OpKind, output: &Tensor, inner_dim: usize) -> u64 {
    let n = output.numel() as u64;
    match kind {
        OpKind::Matmul => 2 * n * inner_dim as u64,
        OpKind::Softmax => 5 * n,
        OpKind::Norm => 4 * n,
        OpKind::Activation => 4 * n,
        OpKind::Scale | OpKind::Mask | OpKind::Dropout | OpKind::Elementwise => n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(rows: usize, cols: usize, data: &[f32]) -> Tensor {
        Tensor::new(rows, cols, data.to_vec()).unwrap()
    }

    #[test]
    fn matmul_variants_agree() {
        let ops = CpuOps;
        let a = t(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = t(3, 2, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
        let bt = t(2, 3, &[7.0, 9.0, 11.0, 8.0, 10.0, 12.0]);
        let c = ops.matmul(&a, &b).unwrap();
        assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
        assert_eq!(ops.matmul_transposed(&a, &bt).unwrap(), c);
        assert!(ops.matmul(&a, &a).is_err());
    }

    #[test]
    fn mask_then_softmax_is_causal() {
        let ops = CpuOps;
        let scores = t(2, 2, &[1.0, 5.0, 1.0, 1.0]);
        let masked = ops.causal_mask(&scores, 0);
        assert_eq!(masked.row(0)[1], f32::NEG_INFINITY);
        let p = ops.softmax(&masked);
        assert_eq!(p.row(0), &[1.0, 0.0]);
        assert!((p.row(1)[0] - 0.5).abs() < 1e-6);
        match mask_extras(&masked) {
            OperationExtras::Mask { masked_fraction } => assert_eq!(masked_fraction, 0.25),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn softmax_extras_entropy() {
        let p = t(1, 2, &[0.5, 0.5]);
        match softmax_extras(&p, 1e-4) {
            OperationExtras::Softmax {
                entropy,
                max_weight,
                sparsity,
            } => {
                assert!((entropy - std::f64::consts::LN_2).abs() < 1e-6);
                assert_eq!(max_weight, 0.5);
                assert_eq!(sparsity, 0.0);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn rms_norm_unit_weight() {
        let ops = CpuOps;
        let x = t(1, 2, &[3.0, 4.0]);
        let y = ops.rms_norm(&x, &[1.0, 1.0], 0.0).unwrap();
        let rms = (12.5f32).sqrt();
        assert!((y.data()[0] - 3.0 / rms).abs() < 1e-6);
        assert!(ops.rms_norm(&x, &[1.0], 0.0).is_err());
    }

    #[test]
    fn dropout_is_identity_in_inference() {
        let x = t(1, 3, &[1.0, -2.0, 0.0]);
        let y = CpuOps.dropout(&x, 0.1);
        assert_eq!(x, y);
        assert_eq!(dropout_extras(&x, &y), OperationExtras::Dropout { kill_ratio: 0.0 });
    }

    #[test]
    fn extras_combine_weighted() {
        let a = OperationExtras::Mask { masked_fraction: 0.0 };
        let b = OperationExtras::Mask { masked_fraction: 1.0 };
        assert_eq!(a.combine(3.0, b, 1.0), OperationExtras::Mask { masked_fraction: 0.25 });
    }

    #[test]
    fn matmul_flops() {
        let out = Tensor::zeros(4, 16);
        assert_eq!(estimate_flops(OpKind::Matmul, &out, 8), 2 * 4 * 16 * 8);
        assert_eq!(estimate_flops(OpKind::Softmax, &out, 0), 5 * 64);
    }
}
