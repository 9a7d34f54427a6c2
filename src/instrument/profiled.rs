//! Recording wrapper around another `TensorOps`.
//!
//! Results are passed through untouched; each call made inside an attention-core
//! scope is timed (with device synchronisation on both sides) and summarised into
//! the capture buffer. Calls outside such a scope go straight to the inner ops.

use super::capture::{CaptureBuffer, OperationRecord};
use super::ops::{
    activation_extras, dropout_extras, estimate_flops, mask_extras, norm_extras, softmax_extras,
    Device, OpKind, OperationExtras, TensorOps,
};
use super::stats::ActivationStats;
use super::tensor::Tensor;
use crate::errors::InstrumentError;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct ProfiledOps {
    inner: Arc<dyn TensorOps>,
    capture: Arc<CaptureBuffer>,
    device: Arc<dyn Device>,
    capture_stats: bool,
    sparsity_threshold: f32,
}

impl ProfiledOps {
    pub fn new(
        inner: Arc<dyn TensorOps>,
        capture: Arc<CaptureBuffer>,
        device: Arc<dyn Device>,
        capture_stats: bool,
        sparsity_threshold: f32,
    ) -> Self {
        Self {
            inner,
            capture,
            device,
            capture_stats,
            sparsity_threshold,
        }
    }

    pub fn inner(&self) -> &Arc<dyn TensorOps> {
        &self.inner
    }

    fn timed<R>(&self, f: impl FnOnce() -> R) -> (R, f64) {
        self.device.synchronize();
        let start = Instant::now();
        let out = f();
        self.device.synchronize();
        (out, start.elapsed().as_secs_f64() * 1000.0)
    }

    fn record(
        &self,
        name: &str,
        kind: OpKind,
        duration_ms: f64,
        output: &Tensor,
        inner_dim: usize,
        extras: impl FnOnce() -> OperationExtras,
    ) {
        let (stats, extras) = if self.capture_stats {
            (
                Some(ActivationStats::from_slice(output.data(), self.sparsity_threshold)),
                extras(),
            )
        } else {
            (None, OperationExtras::None)
        };
        self.capture.record_operation(OperationRecord {
            name: name.to_string(),
            kind,
            duration_ms,
            calls: 1,
            flops: estimate_flops(kind, output, inner_dim),
            stats,
            extras,
        });
    }
}

impl TensorOps for ProfiledOps {
    fn matmul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        if !self.capture.wants_operations() {
            return self.inner.matmul(a, b);
        }
        let (out, ms) = self.timed(|| self.inner.matmul(a, b));
        let out = out?;
        self.record("matmul", OpKind::Matmul, ms, &out, a.cols(), || OperationExtras::None);
        Ok(out)
    }

    fn matmul_transposed(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        if !self.capture.wants_operations() {
            return self.inner.matmul_transposed(a, b);
        }
        let (out, ms) = self.timed(|| self.inner.matmul_transposed(a, b));
        let out = out?;
        self.record("matmul_transposed", OpKind::Matmul, ms, &out, a.cols(), || {
            OperationExtras::None
        });
        Ok(out)
    }

    fn scale(&self, x: &Tensor, factor: f32) -> Tensor {
        if !self.capture.wants_operations() {
            return self.inner.scale(x, factor);
        }
        let (out, ms) = self.timed(|| self.inner.scale(x, factor));
        self.record("scale", OpKind::Scale, ms, &out, 0, || OperationExtras::None);
        out
    }

    fn causal_mask(&self, scores: &Tensor, offset: usize) -> Tensor {
        if !self.capture.wants_operations() {
            return self.inner.causal_mask(scores, offset);
        }
        let (out, ms) = self.timed(|| self.inner.causal_mask(scores, offset));
        self.record("causal_mask", OpKind::Mask, ms, &out, 0, || mask_extras(&out));
        out
    }

    fn softmax(&self, x: &Tensor) -> Tensor {
        if !self.capture.wants_operations() {
            return self.inner.softmax(x);
        }
        let (out, ms) = self.timed(|| self.inner.softmax(x));
        let threshold = self.sparsity_threshold;
        self.record("softmax", OpKind::Softmax, ms, &out, 0, || {
            softmax_extras(&out, threshold)
        });
        out
    }

    fn dropout(&self, x: &Tensor, p: f32) -> Tensor {
        if !self.capture.wants_operations() {
            return self.inner.dropout(x, p);
        }
        let (out, ms) = self.timed(|| self.inner.dropout(x, p));
        self.record("dropout", OpKind::Dropout, ms, &out, 0, || dropout_extras(x, &out));
        out
    }

    fn silu(&self, x: &Tensor) -> Tensor {
        if !self.capture.wants_operations() {
            return self.inner.silu(x);
        }
        let (out, ms) = self.timed(|| self.inner.silu(x));
        let threshold = self.sparsity_threshold;
        self.record("silu", OpKind::Activation, ms, &out, 0, || {
            activation_extras(&out, threshold)
        });
        out
    }

    fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        if !self.capture.wants_operations() {
            return self.inner.mul(a, b);
        }
        let (out, ms) = self.timed(|| self.inner.mul(a, b));
        let out = out?;
        self.record("mul", OpKind::Elementwise, ms, &out, 0, || OperationExtras::None);
        Ok(out)
    }

    fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, InstrumentError> {
        if !self.capture.wants_operations() {
            return self.inner.add(a, b);
        }
        let (out, ms) = self.timed(|| self.inner.add(a, b));
        let out = out?;
        self.record("add", OpKind::Elementwise, ms, &out, 0, || OperationExtras::None);
        Ok(out)
    }

    fn rms_norm(&self, x: &Tensor, weight: &[f32], eps: f32) -> Result<Tensor, InstrumentError> {
        if !self.capture.wants_operations() {
            return self.inner.rms_norm(x, weight, eps);
        }
        let (out, ms) = self.timed(|| self.inner.rms_norm(x, weight, eps));
        let out = out?;
        self.record("rms_norm", OpKind::Norm, ms, &out, 0, || norm_extras(x, &out));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::layout::ComponentPath;
    use crate::instrument::ops::{CpuDevice, CpuOps};

    fn profiled(capture: &Arc<CaptureBuffer>) -> ProfiledOps {
        ProfiledOps::new(
            Arc::new(CpuOps),
            Arc::clone(capture),
            Arc::new(CpuDevice),
            true,
            1e-4,
        )
    }

    #[test]
    fn outputs_identical_to_inner() {
        let capture = Arc::new(CaptureBuffer::new());
        let ops = profiled(&capture);
        capture.enter(&ComponentPath::parse("layers.0.self_attn.core").unwrap());
        let x = Tensor::new(2, 2, vec![0.3, -1.2, 2.0, 0.0]).unwrap();
        assert_eq!(ops.softmax(&x), CpuOps.softmax(&x));
        assert_eq!(ops.causal_mask(&x, 0), CpuOps.causal_mask(&x, 0));
        assert_eq!(
            ops.matmul_transposed(&x, &x).unwrap(),
            CpuOps.matmul_transposed(&x, &x).unwrap()
        );
        capture.exit(0.0, None);
        let comps = capture.take();
        let names: Vec<&str> = comps[0].operations.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["softmax", "causal_mask", "matmul_transposed"]);
        assert_eq!(comps[0].operations[2].flops, 2 * 4 * 2);
    }

    #[test]
    fn nothing_recorded_outside_core_scope() {
        let capture = Arc::new(CaptureBuffer::new());
        let ops = profiled(&capture);
        let x = Tensor::new(1, 2, vec![1.0, 2.0]).unwrap();
        let _ = ops.silu(&x);
        assert!(capture.is_empty());
    }

    #[test]
    fn stats_disabled_drops_extras() {
        let capture = Arc::new(CaptureBuffer::new());
        let ops = ProfiledOps::new(
            Arc::new(CpuOps),
            Arc::clone(&capture),
            Arc::new(CpuDevice),
            false,
            1e-4,
        );
        capture.enter(&ComponentPath::parse("layers.0.self_attn.core").unwrap());
        let x = Tensor::new(1, 2, vec![1.0, 2.0]).unwrap();
        let _ = ops.softmax(&x);
        capture.exit(0.0, None);
        let op = &capture.take()[0].operations[0];
        assert!(op.stats.is_none());
        assert_eq!(op.extras, OperationExtras::None);
    }
}
