//! Transformer architecture configuration.

use serde::{Deserialize, Serialize};

/// Shape of a decoder-only transformer, as found in HuggingFace-style `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchitectureConfig {
    /// Family name (`llama`, `mistral`, `qwen2`, ...).
    pub model_type: String,
    pub vocab_size: usize,
    /// Hidden size (embedding and hidden dimension).
    pub hidden_size: usize,
    /// Number of attention heads (query heads).
    pub num_attention_heads: usize,
    /// Number of key/value heads for GQA/MQA. `None` means one per query head.
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    /// FFN intermediate size.
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    /// Epsilon for RMS LayerNorm.
    pub rms_norm_eps: f32,
    /// Experts per MoE layer, if any.
    pub num_local_experts: Option<usize>,
}

impl Default for ArchitectureConfig {
    fn default() -> Self {
        Self {
            model_type: "llama".to_string(),
            vocab_size: 32_000,
            hidden_size: 768,
            num_attention_heads: 12,
            num_key_value_heads: None,
            num_hidden_layers: 12,
            intermediate_size: 3072,
            max_position_embeddings: 2048,
            rms_norm_eps: 1e-6,
            num_local_experts: None,
        }
    }
}

impl ArchitectureConfig {
    /// Small configuration for the built-in demo workload.
    pub fn tiny() -> Self {
        Self {
            model_type: "llama".to_string(),
            vocab_size: 256,
            hidden_size: 64,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            num_hidden_layers: 2,
            intermediate_size: 172,
            max_position_embeddings: 256,
            rms_norm_eps: 1e-6,
            num_local_experts: None,
        }
    }

    /// Head dimension (same for Q, K, V).
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads.max(1)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Repeat factor: each KV head is shared by this many Q heads.
    pub fn num_q_per_kv(&self) -> usize {
        self.num_attention_heads / self.num_kv_heads().max(1)
    }

    /// Width of the K and V projections.
    pub fn kv_hidden_size(&self) -> usize {
        self.head_dim() * self.num_kv_heads()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(format!(
                "hidden_size {} not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            ));
        }
        let kv = self.num_kv_heads();
        if kv == 0 || self.num_attention_heads % kv != 0 {
            return Err(format!(
                "num_attention_heads {} not divisible by num_key_value_heads {kv}",
                self.num_attention_heads
            ));
        }
        if self.vocab_size == 0 || self.num_hidden_layers == 0 || self.intermediate_size == 0 {
            return Err("vocab_size, num_hidden_layers and intermediate_size must be positive".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_is_gqa_and_valid() {
        let c = ArchitectureConfig::tiny();
        c.validate().unwrap();
        assert_eq!(c.head_dim(), 16);
        assert_eq!(c.num_q_per_kv(), 2);
        assert_eq!(c.kv_hidden_size(), 32);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let c: ArchitectureConfig =
            serde_json::from_str(r#"{"hidden_size": 128, "num_attention_heads": 8}"#).unwrap();
        assert_eq!(c.head_dim(), 16);
        assert_eq!(c.num_kv_heads(), 8);
        assert_eq!(c.vocab_size, 32_000);
    }

    #[test]
    fn indivisible_heads_rejected() {
        let c = ArchitectureConfig {
            hidden_size: 100,
            num_attention_heads: 3,
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
