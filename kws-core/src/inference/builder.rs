//! Authoring side of the `KWSM` format.
//!
//! Used to produce test fixtures and the reference model the host falls back
//! to when no trained artifact is configured.

use super::model::{Activation, DType, Model, OpCode, OpParams, Padding, QuantParams, MAGIC};
use crate::constants::{
    CATEGORY_COUNT, FEATURE_ELEMENT_COUNT, FEATURE_SLICE_COUNT, FEATURE_SLICE_SIZE,
    SCHEMA_VERSION, SILENCE_INDEX,
};

struct TensorRecord {
    dtype: DType,
    dims: Vec<usize>,
    quant: QuantParams,
    payload: Option<Vec<u8>>,
}

struct OperatorRecord {
    opcode: OpCode,
    params: OpParams,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

/// Incremental model writer. Tensor helpers return the new tensor's index.
pub struct ModelBuilder {
    schema_version: u32,
    tensors: Vec<TensorRecord>,
    operators: Vec<OperatorRecord>,
    input: usize,
    output: usize,
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tensors: Vec::new(),
            operators: Vec::new(),
            input: 0,
            output: 0,
        }
    }

    /// Override the header version (to exercise version checks).
    pub fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Activation tensor of arbitrary dtype.
    pub fn tensor(&mut self, dtype: DType, dims: &[usize], quant: QuantParams) -> usize {
        self.tensors.push(TensorRecord {
            dtype,
            dims: dims.to_vec(),
            quant,
            payload: None,
        });
        self.tensors.len() - 1
    }

    /// Int8 activation tensor.
    pub fn activation(&mut self, dims: &[usize], quant: QuantParams) -> usize {
        self.tensor(DType::Int8, dims, quant)
    }

    /// Int8 constant, e.g. weights.
    pub fn constant_i8(&mut self, dims: &[usize], values: &[i8], quant: QuantParams) -> usize {
        let payload = values.iter().map(|&v| v as u8).collect();
        self.tensors.push(TensorRecord {
            dtype: DType::Int8,
            dims: dims.to_vec(),
            quant,
            payload: Some(payload),
        });
        self.tensors.len() - 1
    }

    /// Int32 constant, e.g. bias.
    pub fn constant_i32(&mut self, dims: &[usize], values: &[i32], quant: QuantParams) -> usize {
        let payload = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.tensors.push(TensorRecord {
            dtype: DType::Int32,
            dims: dims.to_vec(),
            quant,
            payload: Some(payload),
        });
        self.tensors.len() - 1
    }

    pub fn operator(
        &mut self,
        opcode: OpCode,
        params: OpParams,
        inputs: &[usize],
        outputs: &[usize],
    ) -> &mut Self {
        self.operators.push(OperatorRecord {
            opcode,
            params,
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
        });
        self
    }

    pub fn set_io(&mut self, input: usize, output: usize) -> &mut Self {
        self.input = input;
        self.output = output;
        self
    }

    /// Serialise to artifact bytes.
    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        put_u32(&mut out, self.schema_version);
        put_u32(&mut out, self.tensors.len() as u32);
        put_u32(&mut out, self.operators.len() as u32);
        put_u32(&mut out, self.input as u32);
        put_u32(&mut out, self.output as u32);

        for t in &self.tensors {
            out.push(t.dtype.code());
            out.push(u8::from(t.payload.is_some()));
            out.push(t.dims.len() as u8);
            out.push(0);
            for &d in &t.dims {
                put_u32(&mut out, d as u32);
            }
            put_u32(&mut out, t.quant.scale.to_bits());
            put_u32(&mut out, t.quant.zero_point as u32);
            if let Some(payload) = &t.payload {
                put_u32(&mut out, payload.len() as u32);
                out.extend_from_slice(payload);
            }
        }

        for op in &self.operators {
            out.push(op.opcode.code());
            out.push(op.inputs.len() as u8);
            out.push(op.outputs.len() as u8);
            out.push(0);
            for p in op.params.encode() {
                put_u32(&mut out, p);
            }
            for &i in op.inputs.iter().chain(&op.outputs) {
                put_u32(&mut out, i as u32);
            }
        }
        out
    }

    pub fn finish(&self) -> Model {
        Model::from_bytes(self.build())
    }
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

/// Deterministic weights in `[-limit, limit]` (64-bit LCG).
pub fn fixed_weights(count: usize, seed: u64, limit: i8) -> Vec<i8> {
    let span = 2 * i64::from(limit) + 1;
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((state >> 33) as i64 % span - i64::from(limit)) as i8
        })
        .collect()
}

/// Untrained model with the micro-speech "tiny conv" topology and fixed
/// weights:
///
/// ```text
/// [1,1960] → Reshape [1,49,40,1] → DepthwiseConv2D 10×8 s2 SAME ×8 + ReLU
///          → Reshape [1,4000] → FullyConnected [1,4] → Softmax [1,4]
/// ```
///
/// Biases favour `silence`, so an all-zero feature matrix decodes to
/// silence. Useful as a placeholder; predictions on real speech are
/// meaningless.
pub fn reference_model() -> Model {
    const DEPTH: usize = 8;
    const KH: usize = 10;
    const KW: usize = 8;
    let out_h = FEATURE_SLICE_COUNT.div_ceil(2);
    let out_w = FEATURE_SLICE_SIZE.div_ceil(2);
    let flat = out_h * out_w * DEPTH;

    let in_q = QuantParams::new(0.1, 0);
    let filter_q = QuantParams::new(0.02, 0);
    let conv_q = QuantParams::new(0.1, 0);
    let fc_w_q = QuantParams::new(0.01, 0);
    let logits_q = QuantParams::new(0.1, 0);
    let probs_q = QuantParams::new(1.0 / 256.0, -128);

    let mut b = ModelBuilder::new();
    let input = b.activation(&[1, FEATURE_ELEMENT_COUNT], in_q);
    let image = b.activation(&[1, FEATURE_SLICE_COUNT, FEATURE_SLICE_SIZE, 1], in_q);
    let filter = b.constant_i8(&[1, KH, KW, DEPTH], &fixed_weights(KH * KW * DEPTH, 7, 20), filter_q);
    let conv_bias = b.constant_i32(&[DEPTH], &[0; DEPTH], QuantParams::new(0.1 * 0.02, 0));
    let conv = b.activation(&[1, out_h, out_w, DEPTH], conv_q);
    let flat_t = b.activation(&[1, flat], conv_q);
    let fc_w = b.constant_i8(&[CATEGORY_COUNT, flat], &fixed_weights(CATEGORY_COUNT * flat, 11, 6), fc_w_q);
    let mut fc_bias_values = [0i32; CATEGORY_COUNT];
    // 3.0 in real units at bias scale 0.1 * 0.01.
    fc_bias_values[SILENCE_INDEX] = 3_000;
    let fc_bias = b.constant_i32(&[CATEGORY_COUNT], &fc_bias_values, QuantParams::new(0.1 * 0.01, 0));
    let logits = b.activation(&[1, CATEGORY_COUNT], logits_q);
    let probs = b.activation(&[1, CATEGORY_COUNT], probs_q);

    b.operator(OpCode::Reshape, OpParams::default(), &[input], &[image]);
    b.operator(
        OpCode::DepthwiseConv2d,
        OpParams {
            stride_h: 2,
            stride_w: 2,
            padding: Padding::Same,
            activation: Activation::Relu,
        },
        &[image, filter, conv_bias],
        &[conv],
    );
    b.operator(OpCode::Reshape, OpParams::default(), &[conv], &[flat_t]);
    b.operator(
        OpCode::FullyConnected,
        OpParams::default(),
        &[flat_t, fc_w, fc_bias],
        &[logits],
    );
    b.operator(OpCode::Softmax, OpParams::default(), &[logits], &[probs]);
    b.set_io(input, probs);
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_weights_are_reproducible_and_bounded() {
        let a = fixed_weights(500, 3, 20);
        assert_eq!(a, fixed_weights(500, 3, 20));
        assert_ne!(a, fixed_weights(500, 4, 20));
        assert!(a.iter().all(|&w| (-20..=20).contains(&w)));
    }

    #[test]
    fn header_carries_overridden_version() {
        let bytes = ModelBuilder::new().schema_version(9).build();
        assert_eq!(&bytes[..4], b"KWSM");
        assert_eq!(Model::from_bytes(bytes).schema_version(), Some(9));
    }
}
