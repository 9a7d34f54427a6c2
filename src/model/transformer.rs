//! Demo decoder-only transformer run through the module graph, so every
//! projection, norm and attention core is observable by the instrumentation.

use super::config::ArchitectureConfig;
use super::demo::populate_graph;
use super::features::ModelFeatures;
use crate::errors::{InstrumentError, ProfilerError};
use crate::instrument::{ModuleGraph, ProfilingDepth, Tensor};
use crate::profiling::{Phase, ProfilingSession};
use crate::tokenizer::ByteTokenizer;
use tracing::debug;

pub struct DemoTransformer {
    config: ArchitectureConfig,
    graph: ModuleGraph,
    embeddings: Tensor,
    tokenizer: ByteTokenizer,
}

impl DemoTransformer {
    pub const NAME: &'static str = "demo-transformer";

    pub fn new(config: ArchitectureConfig, seed: u64) -> Result<Self, InstrumentError> {
        config.validate().map_err(InstrumentError::InvalidInput)?;
        if config.vocab_size < ByteTokenizer::VOCAB_SIZE {
            return Err(InstrumentError::InvalidInput(format!(
                "vocab_size {} is smaller than the byte vocabulary",
                config.vocab_size
            )));
        }
        let mut graph = ModuleGraph::default();
        let embeddings = populate_graph(&mut graph, &config, seed);
        Ok(Self {
            config,
            graph,
            embeddings,
            tokenizer: ByteTokenizer::new(),
        })
    }

    /// Tiny seeded model used by the CLI demo and the tests.
    pub fn tiny(seed: u64) -> Result<Self, InstrumentError> {
        Self::new(ArchitectureConfig::tiny(), seed)
    }

    pub fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ModuleGraph {
        &mut self.graph
    }

    pub fn tokenizer(&self) -> &ByteTokenizer {
        &self.tokenizer
    }

    pub fn parameter_count(&self) -> usize {
        self.graph.parameter_count() + self.embeddings.numel()
    }

    pub fn features(&self) -> ModelFeatures {
        ModelFeatures::from_config(&self.config, Self::NAME, Some(self.parameter_count() as u64))
    }

    fn embed(&self, ids: &[usize]) -> Result<Tensor, InstrumentError> {
        let rows = ids
            .iter()
            .map(|&id| {
                if id >= self.embeddings.rows() {
                    return Err(InstrumentError::InvalidInput(format!(
                        "token id {id} out of vocabulary ({})",
                        self.embeddings.rows()
                    )));
                }
                Ok(self.embeddings.row(id).to_vec())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Tensor::from_rows(&rows)
    }

    /// Full-sequence forward pass. Returns the logits of the last position.
    pub fn forward(&self, ids: &[usize]) -> Result<Vec<f32>, InstrumentError> {
        if ids.is_empty() {
            return Err(InstrumentError::InvalidInput(
                "input_ids must not be empty".to_string(),
            ));
        }
        let g = &self.graph;
        let mut hidden = self.embed(ids)?;

        for l in 0..self.config.num_hidden_layers {
            let path = |name: &str| format!("layers.{l}.{name}");

            // Pre-norm attention + residual
            let normed = g.call(&path("input_layernorm"), &[&hidden])?;
            let q = g.call(&path("self_attn.q_proj"), &[&normed])?;
            let k = g.call(&path("self_attn.k_proj"), &[&normed])?;
            let v = g.call(&path("self_attn.v_proj"), &[&normed])?;
            let context = g.call(&path("self_attn.core"), &[&q, &k, &v])?;
            let attn_out = g.call(&path("self_attn.o_proj"), &[&context])?;
            let residual = g.ops().add(&hidden, &attn_out)?;

            // Pre-norm SwiGLU + residual
            let normed = g.call(&path("post_attention_layernorm"), &[&residual])?;
            let gate = g.call(&path("mlp.gate_proj"), &[&normed])?;
            let up = g.call(&path("mlp.up_proj"), &[&normed])?;
            let act = g.ops().mul(&g.ops().silu(&gate), &up)?;
            let down = g.call(&path("mlp.down_proj"), &[&act])?;
            hidden = g.ops().add(&residual, &down)?;
        }

        let normed = g.call("norm", &[&hidden])?;
        let last = normed
            .last_row()
            .map(|r| r.to_vec())
            .ok_or_else(|| InstrumentError::InvalidInput("empty hidden state".to_string()))?;
        let last = Tensor::new(1, self.config.hidden_size, last)?;
        Ok(g.call("lm_head", &[&last])?.into_data())
    }

    /// Greedy generation that reports every phase, section and token to `session`.
    ///
    /// Prefill is a single forward pass over the whole prompt. All prompt tokens but
    /// the last are emitted before it, so the pass, its time and its layer metrics
    /// land on the last prompt token, where the prefill cost ends. Each decode step
    /// samples from the previous logits, runs the forward pass over the extended
    /// sequence and then emits the sampled token. Returns the generated text.
    pub fn generate(
        &self,
        session: &mut ProfilingSession,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<String, ProfilerError> {
        session.enter_phase(Phase::PreInference)?;
        session.begin_section("tokenize")?;
        let mut ids = self.tokenizer.encode(prompt);
        if ids.is_empty() {
            // Empty prompt: start from a single space.
            ids.push(usize::from(b' '));
        }
        session.end_section("tokenize")?;
        session.exit_phase(Phase::PreInference)?;

        session.enter_phase(Phase::Prefill)?;
        let (&last_id, leading) = ids
            .split_last()
            .ok_or_else(|| InstrumentError::InvalidInput("empty prompt".to_string()))?;
        for (pos, &id) in leading.iter().enumerate() {
            session.token_emitted(pos as u32, &self.tokenizer.token_text(id))?;
        }
        let mut logits = self.forward(&ids)?;
        session.token_emitted(leading.len() as u32, &self.tokenizer.token_text(last_id))?;
        session.exit_phase(Phase::Prefill)?;
        session.poll_power();

        session.enter_phase(Phase::Decode)?;
        let prompt_len = ids.len();
        for step in 0..max_new_tokens {
            if ids.len() >= self.config.max_position_embeddings {
                debug!(step, "context window full, stopping decode");
                break;
            }
            let next = argmax(&logits);
            ids.push(next);
            logits = self.forward(&ids)?;
            session.token_emitted((ids.len() - 1) as u32, &self.tokenizer.token_text(next))?;
            session.poll_power();
        }
        session.exit_phase(Phase::Decode)?;

        session.enter_phase(Phase::PostInference)?;
        session.begin_section("detokenize")?;
        let text = self.tokenizer.decode(&ids[prompt_len..]);
        session.end_section("detokenize")?;
        session.exit_phase(Phase::PostInference)?;
        Ok(text)
    }

    /// Attach the session's instrumentation, generate, and detach again.
    /// Returns the generated text and the depth actually profiled.
    pub fn profile(
        &mut self,
        session: &mut ProfilingSession,
        prompt: &str,
        max_new_tokens: usize,
    ) -> Result<(String, ProfilingDepth), ProfilerError> {
        let depth = session.attach(&mut self.graph);
        let result = self.generate(session, prompt, max_new_tokens);
        session.detach(&mut self.graph);
        result.map(|text| (text, depth))
    }
}

/// Index of the largest logit (first on ties).
pub fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
            if v > bv {
                (i, v)
            } else {
                (bi, bv)
            }
        })
        .0
}
