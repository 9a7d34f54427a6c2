//! Discover which named modules of a graph belong to which transformer layer.
//!
//! Paths follow `layers.{i}.<block>.<name>`, e.g. `layers.0.self_attn.q_proj`,
//! `layers.3.mlp.down_proj`, `layers.1.input_layernorm`.

use super::profiler::ProfilingDepth;
use crate::errors::InstrumentError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Attention,
    Mlp,
    Norm,
    /// Score/softmax/value mixing inside attention; observed at operation depth only.
    AttentionCore,
    Other,
}

impl ComponentKind {
    pub fn classify(name: &str) -> ComponentKind {
        match name {
            "q_proj" | "k_proj" | "v_proj" | "o_proj" => ComponentKind::Attention,
            "gate_proj" | "up_proj" | "down_proj" => ComponentKind::Mlp,
            "input_layernorm" | "post_attention_layernorm" => ComponentKind::Norm,
            "core" => ComponentKind::AttentionCore,
            _ => ComponentKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Attention => "attention",
            ComponentKind::Mlp => "mlp",
            ComponentKind::Norm => "norm",
            ComponentKind::AttentionCore => "attention_core",
            ComponentKind::Other => "other",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attention" => Ok(ComponentKind::Attention),
            "mlp" => Ok(ComponentKind::Mlp),
            "norm" => Ok(ComponentKind::Norm),
            "attention_core" => Ok(ComponentKind::AttentionCore),
            "other" => Ok(ComponentKind::Other),
            other => Err(format!("unknown component kind '{other}'")),
        }
    }
}

/// One observable module inside a transformer layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentPath {
    pub path: String,
    pub layer: usize,
    /// Last path segment (`q_proj`, `core`, ...).
    pub name: String,
    pub kind: ComponentKind,
}

impl ComponentPath {
    /// Parse `layers.{i}.….{name}`; `None` for paths outside the layer stack.
    pub fn parse(path: &str) -> Option<ComponentPath> {
        let mut parts = path.split('.');
        if parts.next()? != "layers" {
            return None;
        }
        let layer: usize = parts.next()?.parse().ok()?;
        let name = parts.last()?.to_string();
        Some(ComponentPath {
            path: path.to_string(),
            layer,
            kind: ComponentKind::classify(&name),
            name,
        })
    }
}

/// Components expected in every layer; `gate_proj` is optional (non-gated MLPs).
const EXPECTED: [&str; 8] = [
    "q_proj",
    "k_proj",
    "v_proj",
    "o_proj",
    "up_proj",
    "down_proj",
    "input_layernorm",
    "post_attention_layernorm",
];

#[derive(Debug, Clone, Default)]
pub struct ComponentLayout {
    layers: BTreeMap<usize, Vec<ComponentPath>>,
}

impl ComponentLayout {
    pub fn detect<'a>(paths: impl IntoIterator<Item = &'a str>) -> Result<Self, InstrumentError> {
        let mut layers: BTreeMap<usize, Vec<ComponentPath>> = BTreeMap::new();
        let mut seen = 0usize;
        for p in paths {
            seen += 1;
            if let Some(c) = ComponentPath::parse(p) {
                if c.kind != ComponentKind::Other {
                    layers.entry(c.layer).or_default().push(c);
                }
            }
        }
        if layers.is_empty() {
            return Err(InstrumentError::NoLayers(seen));
        }
        for (layer, comps) in &layers {
            let missing: Vec<&str> = EXPECTED
                .iter()
                .copied()
                .filter(|e| !comps.iter().any(|c| c.name == *e))
                .collect();
            if !missing.is_empty() {
                warn!(layer, missing = ?missing, "layer is missing components, skipping them");
            }
        }
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers.keys().copied()
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentPath> {
        self.layers.values().flatten()
    }

    pub fn attention_cores(&self) -> impl Iterator<Item = &ComponentPath> {
        self.components()
            .filter(|c| c.kind == ComponentKind::AttentionCore)
    }

    /// Components observed at `depth`.
    pub fn targets(&self, depth: ProfilingDepth) -> Vec<&ComponentPath> {
        match depth {
            ProfilingDepth::Off => Vec::new(),
            ProfilingDepth::Minimal | ProfilingDepth::Module => self
                .components()
                .filter(|c| c.kind != ComponentKind::AttentionCore)
                .collect(),
            ProfilingDepth::Operation => self.components().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llama_paths(layers: usize, core: bool) -> Vec<String> {
        let mut v = vec!["embed_tokens".to_string(), "norm".to_string()];
        for i in 0..layers {
            for n in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                v.push(format!("layers.{i}.self_attn.{n}"));
            }
            if core {
                v.push(format!("layers.{i}.self_attn.core"));
            }
            for n in ["gate_proj", "up_proj", "down_proj"] {
                v.push(format!("layers.{i}.mlp.{n}"));
            }
            v.push(format!("layers.{i}.input_layernorm"));
            v.push(format!("layers.{i}.post_attention_layernorm"));
        }
        v
    }

    #[test]
    fn parse_component_path() {
        let c = ComponentPath::parse("layers.12.mlp.gate_proj").unwrap();
        assert_eq!(c.layer, 12);
        assert_eq!(c.name, "gate_proj");
        assert_eq!(c.kind, ComponentKind::Mlp);
        assert!(ComponentPath::parse("lm_head").is_none());
        assert!(ComponentPath::parse("layers.x.q_proj").is_none());
    }

    #[test]
    fn detect_groups_by_layer() {
        let paths = llama_paths(2, true);
        let layout = ComponentLayout::detect(paths.iter().map(String::as_str)).unwrap();
        assert_eq!(layout.num_layers(), 2);
        assert_eq!(layout.targets(ProfilingDepth::Module).len(), 18);
        assert_eq!(layout.targets(ProfilingDepth::Operation).len(), 20);
        assert_eq!(layout.attention_cores().count(), 2);
        assert!(layout.targets(ProfilingDepth::Off).is_empty());
    }

    #[test]
    fn no_layers_is_error() {
        let err = ComponentLayout::detect(["embed", "lm_head"]).unwrap_err();
        assert!(matches!(err, InstrumentError::NoLayers(2)));
    }
}
