//! Per-boundary accumulation of component and operation observations.
//!
//! Observers write here on the workload thread; the session drains it at each
//! token boundary. A scope stack attributes operations to the component that
//! is currently executing.

use super::layout::{ComponentKind, ComponentPath};
use super::ops::{OpKind, OperationExtras};
use super::stats::ActivationStats;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    pub name: String,
    pub kind: OpKind,
    pub duration_ms: f64,
    pub calls: u32,
    pub flops: u64,
    pub stats: Option<ActivationStats>,
    pub extras: OperationExtras,
}

impl OperationRecord {
    fn absorb(&mut self, other: OperationRecord) {
        self.extras = self
            .extras
            .combine(self.calls as f64, other.extras, other.calls as f64);
        self.duration_ms += other.duration_ms;
        self.calls += other.calls;
        self.flops += other.flops;
        self.stats = ActivationStats::pool(self.stats, other.stats);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRecord {
    pub path: String,
    pub layer: usize,
    pub name: String,
    pub kind: ComponentKind,
    pub duration_ms: f64,
    pub calls: u32,
    pub stats: Option<ActivationStats>,
    pub operations: Vec<OperationRecord>,
}

impl ComponentRecord {
    fn new(target: &ComponentPath) -> Self {
        Self {
            path: target.path.clone(),
            layer: target.layer,
            name: target.name.clone(),
            kind: target.kind,
            duration_ms: 0.0,
            calls: 0,
            stats: None,
            operations: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct CaptureState {
    components: Vec<ComponentRecord>,
    index: HashMap<String, usize>,
    scope: Vec<usize>,
    sealed: bool,
}

#[derive(Debug, Default)]
pub struct CaptureBuffer {
    state: Mutex<CaptureState>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a component scope. Ignored once sealed.
    pub fn enter(&self, target: &ComponentPath) {
        let mut st = self.state.lock();
        if st.sealed {
            return;
        }
        let existing = st.index.get(&target.path).copied();
        let idx = match existing {
            Some(i) => i,
            None => {
                let i = st.components.len();
                st.components.push(ComponentRecord::new(target));
                st.index.insert(target.path.clone(), i);
                i
            }
        };
        st.scope.push(idx);
    }

    /// Close the innermost scope, adding one call's duration and output statistics.
    pub fn exit(&self, duration_ms: f64, stats: Option<ActivationStats>) {
        let mut st = self.state.lock();
        let Some(idx) = st.scope.pop() else {
            return;
        };
        if st.sealed {
            return;
        }
        if let Some(c) = st.components.get_mut(idx) {
            c.duration_ms += duration_ms;
            c.calls += 1;
            c.stats = ActivationStats::pool(c.stats, stats);
        }
    }

    /// Whether an operation executed now would be recorded.
    pub fn wants_operations(&self) -> bool {
        let st = self.state.lock();
        !st.sealed
            && st
                .scope
                .last()
                .and_then(|&i| st.components.get(i))
                .map(|c| c.kind == ComponentKind::AttentionCore)
                .unwrap_or(false)
    }

    /// Attribute an operation to the innermost attention-core scope. Returns false
    /// when no such scope is open.
    pub fn record_operation(&self, op: OperationRecord) -> bool {
        let mut st = self.state.lock();
        if st.sealed {
            return false;
        }
        let Some(&idx) = st.scope.last() else {
            return false;
        };
        let Some(component) = st.components.get_mut(idx) else {
            return false;
        };
        if component.kind != ComponentKind::AttentionCore {
            return false;
        }
        match component.operations.iter_mut().find(|o| o.name == op.name) {
            Some(existing) => existing.absorb(op),
            None => component.operations.push(op),
        }
        true
    }

    /// Drain everything accumulated since the previous call, in first-seen order.
    pub fn take(&self) -> Vec<ComponentRecord> {
        let mut st = self.state.lock();
        st.index.clear();
        st.scope.clear();
        std::mem::take(&mut st.components)
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().components.is_empty()
    }

    /// Stop accepting observations; anything arriving later is dropped.
    pub fn seal(&self) {
        let mut st = self.state.lock();
        st.sealed = true;
        st.scope.clear();
    }

    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> ComponentPath {
        ComponentPath::parse(p).unwrap()
    }

    fn op(name: &str, ms: f64) -> OperationRecord {
        OperationRecord {
            name: name.to_string(),
            kind: OpKind::Softmax,
            duration_ms: ms,
            calls: 1,
            flops: 10,
            stats: None,
            extras: OperationExtras::None,
        }
    }

    #[test]
    fn accumulates_calls_per_component() {
        let buf = CaptureBuffer::new();
        let q = path("layers.0.self_attn.q_proj");
        buf.enter(&q);
        buf.exit(1.0, Some(ActivationStats::from_slice(&[1.0, 2.0], 0.0)));
        buf.enter(&q);
        buf.exit(2.0, Some(ActivationStats::from_slice(&[3.0], 0.0)));
        let taken = buf.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].calls, 2);
        assert_eq!(taken[0].duration_ms, 3.0);
        assert_eq!(taken[0].stats.unwrap().elements, 3);
        assert!(buf.take().is_empty());
    }

    #[test]
    fn operations_only_inside_attention_core() {
        let buf = CaptureBuffer::new();
        assert!(!buf.record_operation(op("softmax", 1.0)));
        buf.enter(&path("layers.0.self_attn.q_proj"));
        assert!(!buf.wants_operations());
        assert!(!buf.record_operation(op("softmax", 1.0)));
        buf.exit(1.0, None);

        buf.enter(&path("layers.0.self_attn.core"));
        assert!(buf.wants_operations());
        assert!(buf.record_operation(op("softmax", 1.0)));
        assert!(buf.record_operation(op("softmax", 0.5)));
        assert!(buf.record_operation(op("scale", 0.1)));
        buf.exit(2.0, None);

        let taken = buf.take();
        let core = taken.iter().find(|c| c.name == "core").unwrap();
        assert_eq!(core.operations.len(), 2);
        assert_eq!(core.operations[0].calls, 2);
        assert_eq!(core.operations[0].duration_ms, 1.5);
        assert_eq!(core.operations[0].flops, 20);
    }

    #[test]
    fn sealed_buffer_ignores_observations() {
        let buf = CaptureBuffer::new();
        buf.seal();
        buf.enter(&path("layers.0.mlp.up_proj"));
        buf.exit(1.0, None);
        assert!(buf.is_empty());
        assert!(buf.is_sealed());
    }
}
