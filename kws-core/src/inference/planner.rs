//! Greedy, lifetime-aware placement of activation tensors in the arena.
//!
//! Each activation tensor lives from the operator that produces it (the graph
//! input from operator 0) to the last operator that reads it (the graph
//! output until the end of the pass). Tensors are placed largest first at the
//! lowest aligned offset that does not overlap any already-placed tensor with
//! an intersecting lifetime. Tensors whose lifetimes never meet share bytes.

use std::ops::Range;

use super::model::Graph;
use crate::error::InitError;

/// Offsets are rounded up to this many bytes.
pub const BUFFER_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lifetime {
    first: usize,
    last: usize,
}

impl Lifetime {
    fn overlaps(&self, other: &Lifetime) -> bool {
        self.first <= other.last && other.first <= self.last
    }
}

/// Arena layout for one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaPlan {
    /// Byte range per tensor index; `None` for constants and unused tensors.
    ranges: Vec<Option<Range<usize>>>,
    /// High-water mark of the plan.
    pub required: usize,
}

impl ArenaPlan {
    pub fn range(&self, tensor: usize) -> Option<Range<usize>> {
        self.ranges.get(tensor).cloned().flatten()
    }
}

fn align_up(n: usize) -> Option<usize> {
    n.checked_next_multiple_of(BUFFER_ALIGNMENT)
}

fn overflow(t: usize) -> InitError {
    InitError::Malformed(format!("placing tensor {t} overflows the address space"))
}

fn lifetimes(graph: &Graph) -> Result<Vec<Option<Lifetime>>, InitError> {
    let end = graph.operators.len();
    let mut spans: Vec<Option<Lifetime>> = vec![None; graph.tensors.len()];
    spans[graph.input] = Some(Lifetime { first: 0, last: 0 });

    for (i, op) in graph.operators.iter().enumerate() {
        for &t in &op.inputs {
            if graph.tensors[t].is_constant() {
                continue;
            }
            match spans[t].as_mut() {
                Some(span) => span.last = span.last.max(i),
                None => {
                    return Err(InitError::Malformed(format!(
                        "operator {i} reads tensor {t} before it is written"
                    )))
                }
            }
        }
        for &t in &op.outputs {
            if graph.tensors[t].is_constant() {
                return Err(InitError::Malformed(format!(
                    "operator {i} writes constant tensor {t}"
                )));
            }
            if spans[t].is_some() {
                return Err(InitError::Malformed(format!(
                    "tensor {t} is written more than once"
                )));
            }
            spans[t] = Some(Lifetime { first: i, last: i });
        }
    }

    match spans[graph.output].as_mut() {
        Some(span) => span.last = end,
        None => {
            return Err(InitError::Malformed(
                "graph output is never written".into(),
            ))
        }
    }
    Ok(spans)
}

/// Compute the arena layout for `graph`.
///
/// # Errors
/// `InitError::Malformed` when the operator order is not a valid schedule
/// (reads before writes, double writes, unwritten output), or when tensor
/// sizes overflow `usize` while being placed.
pub fn plan(graph: &Graph) -> Result<ArenaPlan, InitError> {
    let spans = lifetimes(graph)?;

    let mut order: Vec<usize> = (0..graph.tensors.len())
        .filter(|&t| spans[t].is_some())
        .collect();
    // Largest first; ties by index so the plan is reproducible.
    order.sort_by(|&a, &b| {
        graph.tensors[b]
            .byte_len()
            .cmp(&graph.tensors[a].byte_len())
            .then(a.cmp(&b))
    });

    let mut ranges: Vec<Option<Range<usize>>> = vec![None; graph.tensors.len()];
    let mut placed: Vec<(Range<usize>, Lifetime)> = Vec::with_capacity(order.len());
    let mut required = 0usize;

    for t in order {
        let size = graph.tensors[t].byte_len();
        let Some(span) = spans[t] else { continue };

        let mut conflicts: Vec<&Range<usize>> = placed
            .iter()
            .filter(|(_, other)| other.overlaps(&span))
            .map(|(r, _)| r)
            .collect();
        conflicts.sort_by_key(|r| r.start);

        let mut offset = 0usize;
        for r in conflicts {
            let end = offset.checked_add(size).ok_or_else(|| overflow(t))?;
            if end <= r.start {
                break;
            }
            offset = offset.max(align_up(r.end).ok_or_else(|| overflow(t))?);
        }

        let end = offset.checked_add(size).ok_or_else(|| overflow(t))?;
        let range = offset..end;
        required = required.max(range.end);
        ranges[t] = Some(range.clone());
        placed.push((range, span));
    }

    Ok(ArenaPlan { ranges, required })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SCHEMA_VERSION;
    use crate::inference::builder::{reference_model, ModelBuilder};
    use crate::inference::model::{DType, OpCode, OpParams, Operator, QuantParams, TensorInfo};

    fn graph_of(b: &ModelBuilder) -> Graph {
        Graph::parse(&b.build(), SCHEMA_VERSION).unwrap()
    }

    fn overlap(a: &Range<usize>, b: &Range<usize>) -> bool {
        a.start < b.end && b.start < a.end
    }

    #[test]
    fn chain_reuses_dead_buffers() {
        // a → b → c → d, each 100 bytes: a and c can share, b and d can share.
        let q = QuantParams::new(1.0, 0);
        let mut b = ModelBuilder::new();
        let t: Vec<usize> = (0..4).map(|_| b.activation(&[1, 100], q)).collect();
        for w in t.windows(2) {
            b.operator(OpCode::Reshape, OpParams::default(), &[w[0]], &[w[1]]);
        }
        b.set_io(t[0], t[3]);
        let plan = plan(&graph_of(&b)).unwrap();

        assert_eq!(plan.required, align_up(100).unwrap() + 100);
        for w in t.windows(2) {
            assert!(!overlap(&plan.range(w[0]).unwrap(), &plan.range(w[1]).unwrap()));
        }
    }

    #[test]
    fn reference_model_fits_default_arena() {
        let model = reference_model();
        let graph = Graph::parse(model.as_bytes(), SCHEMA_VERSION).unwrap();
        let plan = plan(&graph).unwrap();
        assert!(plan.required <= crate::constants::TENSOR_ARENA_SIZE);
        // Naive allocation would need 1960 * 2 + 4000 * 2 + 8 bytes.
        assert!(plan.required < 1960 * 2 + 4000 * 2);

        // Operands of every operator are disjoint.
        for op in &graph.operators {
            let out = plan.range(op.outputs[0]).unwrap();
            if let Some(inp) = plan.range(op.inputs[0]) {
                assert!(!overlap(&inp, &out), "{:?} aliases its input", op.opcode);
            }
        }
        assert!(plan.range(graph.operators[1].inputs[1]).is_none(), "constants are not planned");
    }

    #[test]
    fn placement_overflow_is_malformed() {
        let q = QuantParams::new(1.0, 0);
        let huge = |_| TensorInfo {
            dtype: DType::Int8,
            dims: vec![usize::MAX - 8],
            quant: q,
            constant: None,
        };
        let graph = Graph {
            tensors: (0..2).map(huge).collect(),
            operators: vec![Operator {
                opcode: OpCode::Reshape,
                params: OpParams::default(),
                inputs: vec![0],
                outputs: vec![1],
            }],
            input: 0,
            output: 1,
        };
        assert!(matches!(plan(&graph), Err(InitError::Malformed(_))));
    }

    #[test]
    fn read_before_write_is_malformed() {
        let q = QuantParams::new(1.0, 0);
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 4], q);
        let orphan = b.activation(&[1, 4], q);
        let output = b.activation(&[1, 4], q);
        b.operator(OpCode::Reshape, OpParams::default(), &[orphan], &[output]);
        b.set_io(input, output);
        assert!(matches!(plan(&graph_of(&b)), Err(InitError::Malformed(_))));
    }
}
