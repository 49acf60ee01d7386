//! Operator registry and the context kernels run in.
//!
//! The resolver has room for exactly the operators the keyword model needs.
//! A model that asks for anything else fails to load instead of being
//! partially executed.

use std::ops::Range;

use super::kernels;
use super::model::{DType, Graph, OpCode, Operator};
use super::planner::ArenaPlan;
use crate::error::InitError;

/// Maximum number of distinct operator registrations.
pub const MAX_REGISTRATIONS: usize = 4;

/// Load-time validation of one operator against the graph.
pub type PrepareFn = fn(&Graph, &Operator) -> Result<(), String>;
/// One execution of an operator.
pub type EvalFn = fn(&mut KernelContext<'_>, &Operator) -> Result<(), String>;

#[derive(Clone, Copy)]
pub struct Registration {
    pub opcode: OpCode,
    pub prepare: PrepareFn,
    pub eval: EvalFn,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("opcode", &self.opcode)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpResolver {
    registrations: Vec<Registration>,
}

impl OpResolver {
    pub fn new() -> Self {
        Self {
            registrations: Vec::with_capacity(MAX_REGISTRATIONS),
        }
    }

    /// Resolver with depthwise conv 2-D, fully connected, softmax and reshape.
    /// The builtin table is sized to fill every slot exactly.
    pub fn micro_speech() -> Self {
        Self {
            registrations: Vec::from(kernels::builtin_registrations()),
        }
    }

    /// Add a kernel. Re-registering an opcode replaces its kernel.
    ///
    /// # Errors
    /// `InitError::UnsupportedOperator` once all slots are taken.
    pub fn register(&mut self, reg: Registration) -> Result<(), InitError> {
        if let Some(existing) = self
            .registrations
            .iter_mut()
            .find(|r| r.opcode == reg.opcode)
        {
            *existing = reg;
            return Ok(());
        }
        if self.registrations.len() >= MAX_REGISTRATIONS {
            return Err(InitError::UnsupportedOperator { op: reg.opcode });
        }
        self.registrations.push(reg);
        Ok(())
    }

    pub fn find(&self, opcode: OpCode) -> Option<&Registration> {
        self.registrations.iter().find(|r| r.opcode == opcode)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// Everything a kernel may touch during one pass.
pub struct KernelContext<'a> {
    pub graph: &'a Graph,
    /// Artifact bytes, for constant payloads.
    pub model: &'a [u8],
    pub arena: &'a mut [i8],
    pub plan: &'a ArenaPlan,
}

impl<'a> KernelContext<'a> {
    /// Payload of a constant tensor, with its dtype checked.
    pub fn constant(&self, tensor: usize, dtype: DType) -> Result<&'a [u8], String> {
        let model: &'a [u8] = self.model;
        let info = self.graph.tensor(tensor);
        if info.dtype != dtype {
            return Err(format!("tensor {tensor} is {:?}, expected {dtype:?}", info.dtype));
        }
        let range = info
            .constant
            .clone()
            .ok_or_else(|| format!("tensor {tensor} is not constant"))?;
        Ok(&model[range])
    }

    fn arena_range(&self, tensor: usize) -> Result<Range<usize>, String> {
        self.plan
            .range(tensor)
            .ok_or_else(|| format!("tensor {tensor} has no arena storage"))
    }

    /// Split the arena into an activation input and an output. The plan
    /// guarantees the two never overlap while the operator runs.
    pub fn io(&mut self, input: usize, output: usize) -> Result<(&[i8], &mut [i8]), String> {
        let in_r = self.arena_range(input)?;
        let out_r = self.arena_range(output)?;
        if in_r.start < out_r.end && out_r.start < in_r.end {
            return Err(format!("tensors {input} and {output} alias in the arena"));
        }
        if in_r.start < out_r.start {
            let (lo, hi) = self.arena.split_at_mut(out_r.start);
            Ok((&lo[in_r], &mut hi[..out_r.len()]))
        } else {
            let (lo, hi) = self.arena.split_at_mut(in_r.start);
            Ok((&hi[..in_r.len()], &mut lo[out_r]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_prepare(_: &Graph, _: &Operator) -> Result<(), String> {
        Ok(())
    }

    fn noop_eval(_: &mut KernelContext<'_>, _: &Operator) -> Result<(), String> {
        Ok(())
    }

    #[test]
    fn micro_speech_registers_four_ops() {
        let r = OpResolver::micro_speech();
        assert_eq!(r.len(), MAX_REGISTRATIONS);
        for op in [
            OpCode::DepthwiseConv2d,
            OpCode::FullyConnected,
            OpCode::Softmax,
            OpCode::Reshape,
        ] {
            assert!(r.find(op).is_some(), "{op:?} missing");
        }
        assert!(r.find(OpCode::Conv2d).is_none());
    }

    #[test]
    fn fifth_registration_is_rejected() {
        let mut r = OpResolver::micro_speech();
        let err = r
            .register(Registration {
                opcode: OpCode::AveragePool2d,
                prepare: noop_prepare,
                eval: noop_eval,
            })
            .unwrap_err();
        assert_eq!(
            err,
            InitError::UnsupportedOperator {
                op: OpCode::AveragePool2d
            }
        );
        assert_eq!(r.len(), MAX_REGISTRATIONS);
    }

    #[test]
    fn re_registering_replaces_in_place() {
        let mut r = OpResolver::micro_speech();
        r.register(Registration {
            opcode: OpCode::Softmax,
            prepare: noop_prepare,
            eval: noop_eval,
        })
        .unwrap();
        assert_eq!(r.len(), MAX_REGISTRATIONS);
    }
}
