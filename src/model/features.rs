//! Architectural features that drive energy beyond raw parameter count.

use super::config::ArchitectureConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionMechanism {
    #[serde(rename = "MHA")]
    MultiHead,
    #[serde(rename = "GQA")]
    GroupedQuery,
    #[serde(rename = "MQA")]
    MultiQuery,
}

impl AttentionMechanism {
    pub fn detect(num_attention_heads: usize, num_key_value_heads: Option<usize>) -> Self {
        match num_key_value_heads {
            Some(1) => AttentionMechanism::MultiQuery,
            Some(kv) if kv < num_attention_heads => AttentionMechanism::GroupedQuery,
            _ => AttentionMechanism::MultiHead,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFeatures {
    pub model_name: String,
    pub architecture_type: String,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub total_params: u64,
    pub embedding_params: u64,
    pub attention_params_per_layer: u64,
    pub ffn_params_per_layer: u64,
    pub attention_mechanism: AttentionMechanism,
    pub is_moe: bool,
    pub attention_to_ffn_ratio: f64,
    pub params_per_layer: u64,
}

fn normalize_architecture(model_type: &str) -> String {
    match model_type {
        "phi3" => "phi".to_string(),
        "qwen2" => "qwen".to_string(),
        "gpt_neox" => "gpt-neox".to_string(),
        other => other.to_string(),
    }
}

impl ModelFeatures {
    /// Derive features from a configuration. `total_params` overrides the
    /// estimate when the exact count is known (e.g. from the loaded graph).
    pub fn from_config(
        config: &ArchitectureConfig,
        model_name: &str,
        total_params: Option<u64>,
    ) -> Self {
        let h = config.hidden_size as u64;
        let heads = config.num_attention_heads;
        let q_params = h * h;
        let kv_params = match config.num_key_value_heads {
            Some(kv) if kv != heads => 2 * h * config.kv_hidden_size() as u64,
            _ => 2 * h * h,
        };
        let o_params = h * h;
        let attention = q_params + kv_params + o_params;
        // gate + up + down
        let ffn = 3 * h * config.intermediate_size as u64;
        let embedding = config.vocab_size as u64 * h;
        let per_layer = attention + ffn;
        let estimated = embedding * 2
            + config.num_hidden_layers as u64 * (per_layer + 2 * h)
            + h;

        Self {
            model_name: model_name.to_string(),
            architecture_type: normalize_architecture(&config.model_type),
            num_layers: config.num_hidden_layers,
            hidden_size: config.hidden_size,
            intermediate_size: config.intermediate_size,
            num_attention_heads: heads,
            num_key_value_heads: config.num_key_value_heads,
            total_params: total_params.unwrap_or(estimated),
            embedding_params: embedding,
            attention_params_per_layer: attention,
            ffn_params_per_layer: ffn,
            attention_mechanism: AttentionMechanism::detect(heads, config.num_key_value_heads),
            is_moe: config.num_local_experts.is_some_and(|n| n > 1),
            attention_to_ffn_ratio: if ffn > 0 {
                attention as f64 / ffn as f64
            } else {
                0.0
            },
            params_per_layer: per_layer,
        }
    }

    pub fn params_millions(&self) -> f64 {
        self.total_params as f64 / 1e6
    }
}
