//! Seeded demo transformer modules (RMS norm, grouped-query attention, SwiGLU MLP).

use super::config::ArchitectureConfig;
use crate::errors::InstrumentError;
use crate::instrument::{Module, ModuleGraph, Tensor, TensorOps};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn rand_tensor(rng: &mut impl Rng, rows: usize, cols: usize, scale: f32) -> Tensor {
    let data = (0..rows * cols).map(|_| rng.gen_range(-scale..scale)).collect();
    Tensor::new(rows, cols, data).unwrap_or_else(|_| Tensor::zeros(rows, cols))
}

fn rand_f32_vec(rng: &mut impl Rng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(0.9f32..=1.1f32)).collect()
}

fn single_input<'a>(inputs: &[&'a Tensor], module: &str) -> Result<&'a Tensor, InstrumentError> {
    match inputs {
        [x] => Ok(x),
        _ => Err(InstrumentError::InvalidInput(format!(
            "{module} expects 1 input, got {}",
            inputs.len()
        ))),
    }
}

/// `y = x · Wᵀ` with `W [out, in]`.
#[derive(Debug)]
pub struct Linear {
    weight: Tensor,
}

impl Linear {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    /// Uniform init in `±1/sqrt(in)`.
    pub fn random(rng: &mut impl Rng, out_features: usize, in_features: usize) -> Self {
        let bound = (in_features.max(1) as f32).sqrt().recip();
        Self::new(rand_tensor(rng, out_features, in_features, bound))
    }
}

impl Module for Linear {
    fn forward(&self, inputs: &[&Tensor], ops: &dyn TensorOps) -> Result<Tensor, InstrumentError> {
        ops.matmul_transposed(single_input(inputs, "linear")?, &self.weight)
    }

    fn parameter_count(&self) -> usize {
        self.weight.numel()
    }
}

#[derive(Debug)]
pub struct RmsNorm {
    weight: Vec<f32>,
    eps: f32,
}

impl RmsNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }
}

impl Module for RmsNorm {
    fn forward(&self, inputs: &[&Tensor], ops: &dyn TensorOps) -> Result<Tensor, InstrumentError> {
        ops.rms_norm(single_input(inputs, "rms_norm")?, &self.weight, self.eps)
    }

    fn parameter_count(&self) -> usize {
        self.weight.len()
    }
}

/// Causal scaled dot-product attention over projected `q`, `k`, `v`.
///
/// Inputs are `q [seq, heads·d]`, `k` and `v [seq, kv_heads·d]`; each KV head serves
/// `heads / kv_heads` query heads.
#[derive(Debug)]
pub struct AttentionCore {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    /// Recorded by the dropout op; inference never drops.
    dropout: f32,
}

impl AttentionCore {
    pub fn new(config: &ArchitectureConfig) -> Self {
        Self {
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_kv_heads(),
            head_dim: config.head_dim(),
            dropout: 0.0,
        }
    }
}

impl Module for AttentionCore {
    fn forward(&self, inputs: &[&Tensor], ops: &dyn TensorOps) -> Result<Tensor, InstrumentError> {
        let [q, k, v] = inputs else {
            return Err(InstrumentError::InvalidInput(format!(
                "attention core expects q, k, v; got {} inputs",
                inputs.len()
            )));
        };
        if k.rows() < q.rows() || k.rows() != v.rows() {
            return Err(InstrumentError::ShapeMismatch {
                op: "attention",
                detail: format!("q {:?}, k {:?}, v {:?}", q.shape(), k.shape(), v.shape()),
            });
        }
        let offset = k.rows() - q.rows();
        let group = self.num_heads / self.num_kv_heads.max(1);
        let scale = (self.head_dim as f32).sqrt().recip();
        let mut out = Tensor::zeros(q.rows(), self.num_heads * self.head_dim);
        for h in 0..self.num_heads {
            let kv = h / group.max(1);
            let qh = q.column_block(h * self.head_dim, self.head_dim)?;
            let kh = k.column_block(kv * self.head_dim, self.head_dim)?;
            let vh = v.column_block(kv * self.head_dim, self.head_dim)?;
            let scores = ops.matmul_transposed(&qh, &kh)?;
            let scores = ops.scale(&scores, scale);
            let scores = ops.causal_mask(&scores, offset);
            let weights = ops.softmax(&scores);
            let weights = ops.dropout(&weights, self.dropout);
            let context = ops.matmul(&weights, &vh)?;
            out.set_column_block(h * self.head_dim, &context)?;
        }
        Ok(out)
    }
}

/// Register a seeded llama-style layer stack, final norm and LM head in `graph`.
/// Returns the token embedding table `[vocab, hidden]`.
pub fn populate_graph(graph: &mut ModuleGraph, config: &ArchitectureConfig, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let hidden = config.hidden_size;
    let kv = config.kv_hidden_size();
    let inter = config.intermediate_size;

    for l in 0..config.num_hidden_layers {
        let path = |name: &str| format!("layers.{l}.{name}");
        graph.insert(
            path("input_layernorm"),
            Arc::new(RmsNorm::new(rand_f32_vec(&mut rng, hidden), config.rms_norm_eps)),
        );
        graph.insert(path("self_attn.q_proj"), Arc::new(Linear::random(&mut rng, hidden, hidden)));
        graph.insert(path("self_attn.k_proj"), Arc::new(Linear::random(&mut rng, kv, hidden)));
        graph.insert(path("self_attn.v_proj"), Arc::new(Linear::random(&mut rng, kv, hidden)));
        graph.insert(path("self_attn.core"), Arc::new(AttentionCore::new(config)));
        graph.insert(path("self_attn.o_proj"), Arc::new(Linear::random(&mut rng, hidden, hidden)));
        graph.insert(
            path("post_attention_layernorm"),
            Arc::new(RmsNorm::new(rand_f32_vec(&mut rng, hidden), config.rms_norm_eps)),
        );
        graph.insert(path("mlp.gate_proj"), Arc::new(Linear::random(&mut rng, inter, hidden)));
        graph.insert(path("mlp.up_proj"), Arc::new(Linear::random(&mut rng, inter, hidden)));
        graph.insert(path("mlp.down_proj"), Arc::new(Linear::random(&mut rng, hidden, inter)));
    }
    graph.insert(
        "norm",
        Arc::new(RmsNorm::new(rand_f32_vec(&mut rng, hidden), config.rms_norm_eps)),
    );
    graph.insert(
        "lm_head",
        Arc::new(Linear::random(&mut rng, config.vocab_size, hidden)),
    );
    rand_tensor(&mut rng, config.vocab_size, hidden, 0.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::CpuOps;

    #[test]
    fn seeded_graph_is_deterministic() {
        let config = ArchitectureConfig::tiny();
        let mut a = ModuleGraph::default();
        let mut b = ModuleGraph::default();
        let ea = populate_graph(&mut a, &config, 7);
        let eb = populate_graph(&mut b, &config, 7);
        assert_eq!(ea, eb);
        assert_eq!(a.len(), config.num_hidden_layers * 10 + 2);
        let x = Tensor::new(1, config.hidden_size, vec![0.5; config.hidden_size]).unwrap();
        assert_eq!(
            a.call("layers.1.mlp.gate_proj", &[&x]).unwrap(),
            b.call("layers.1.mlp.gate_proj", &[&x]).unwrap()
        );
    }

    #[test]
    fn attention_core_output_shape_and_causality() {
        let config = ArchitectureConfig::tiny();
        let core = AttentionCore::new(&config);
        let mut rng = StdRng::seed_from_u64(1);
        let q = rand_tensor(&mut rng, 3, config.hidden_size, 1.0);
        let k = rand_tensor(&mut rng, 3, config.kv_hidden_size(), 1.0);
        let v = rand_tensor(&mut rng, 3, config.kv_hidden_size(), 1.0);
        let out = core.forward(&[&q, &k, &v], &CpuOps).unwrap();
        assert_eq!(out.shape(), [3, config.hidden_size]);

        // The first position only sees itself: its output is v[0] per head group.
        let group = config.num_q_per_kv();
        let d = config.head_dim();
        for h in 0..config.num_attention_heads {
            let kv = h / group;
            for j in 0..d {
                let got = out.row(0)[h * d + j];
                let want = v.row(0)[kv * d + j];
                assert!((got - want).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let core = AttentionCore::new(&ArchitectureConfig::tiny());
        let x = Tensor::zeros(1, 64);
        assert!(matches!(
            core.forward(&[&x], &CpuOps),
            Err(InstrumentError::InvalidInput(_))
        ));
    }
}
