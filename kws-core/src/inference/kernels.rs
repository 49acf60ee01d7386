//! Int8 reference kernels for the four operators the keyword model uses.
//!
//! Arithmetic follows the usual affine scheme: accumulate
//! `(q_in - zp_in) * (q_w - zp_w)` plus an int32 bias in 64 bits, scale by
//! `s_in * s_w / s_out`, round half away from zero, add `zp_out` and clamp
//! to the fused activation range. Kernels never allocate.

use super::model::{Activation, DType, Graph, OpCode, Operator, Padding, QuantParams, TensorInfo};
use super::resolver::{KernelContext, Registration, MAX_REGISTRATIONS};

pub fn builtin_registrations() -> [Registration; MAX_REGISTRATIONS] {
    [
        Registration {
            opcode: OpCode::DepthwiseConv2d,
            prepare: prepare_depthwise_conv,
            eval: eval_depthwise_conv,
        },
        Registration {
            opcode: OpCode::FullyConnected,
            prepare: prepare_fully_connected,
            eval: eval_fully_connected,
        },
        Registration {
            opcode: OpCode::Softmax,
            prepare: prepare_softmax,
            eval: eval_softmax,
        },
        Registration {
            opcode: OpCode::Reshape,
            prepare: prepare_reshape,
            eval: eval_reshape,
        },
    ]
}

// ── shared helpers ──────────────────────────────────────────────────────────

fn expect_arity(op: &Operator, inputs: &[usize], outputs: usize) -> Result<(), String> {
    if !inputs.contains(&op.inputs.len()) || op.outputs.len() != outputs {
        return Err(format!(
            "expected {inputs:?} inputs and {outputs} outputs, got {} and {}",
            op.inputs.len(),
            op.outputs.len()
        ));
    }
    Ok(())
}

fn expect_activation<'g>(graph: &'g Graph, t: usize) -> Result<&'g TensorInfo, String> {
    let info = graph.tensor(t);
    if info.is_constant() || info.dtype != DType::Int8 {
        return Err(format!("tensor {t} must be an int8 activation"));
    }
    Ok(info)
}

fn expect_constant<'g>(graph: &'g Graph, t: usize, dtype: DType) -> Result<&'g TensorInfo, String> {
    let info = graph.tensor(t);
    if !info.is_constant() || info.dtype != dtype {
        return Err(format!("tensor {t} must be a {dtype:?} constant"));
    }
    Ok(info)
}

fn output_multiplier(input: QuantParams, weights: QuantParams, output: QuantParams) -> Result<f64, String> {
    let m = f64::from(input.scale) * f64::from(weights.scale) / f64::from(output.scale);
    if !m.is_finite() || m <= 0.0 {
        return Err(format!("invalid requantization multiplier {m}"));
    }
    Ok(m)
}

/// Quantized clamp bounds for a fused activation.
fn activation_range(activation: Activation, q: QuantParams) -> (i32, i32) {
    let lo = i32::from(i8::MIN);
    let hi = i32::from(i8::MAX);
    match activation {
        Activation::None => (lo, hi),
        Activation::Relu => (q.zero_point.max(lo), hi),
        Activation::Relu6 => {
            let six = q.zero_point + (6.0 / q.scale).round() as i32;
            (q.zero_point.max(lo), six.min(hi))
        }
    }
}

fn requantize(acc: i64, multiplier: f64, zero_point: i32, range: (i32, i32)) -> i8 {
    let scaled = (acc as f64 * multiplier).round() as i64 + i64::from(zero_point);
    scaled.clamp(i64::from(range.0), i64::from(range.1)) as i8
}

fn read_i32(bytes: &[u8], index: usize) -> i32 {
    let b = &bytes[index * 4..index * 4 + 4];
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn checked_acc(acc: i64) -> Result<i64, String> {
    if acc < i64::from(i32::MIN) || acc > i64::from(i32::MAX) {
        return Err(format!("accumulator overflow ({acc})"));
    }
    Ok(acc)
}

// ── FULLY_CONNECTED ─────────────────────────────────────────────────────────
// inputs: activation, weights [out_dim, in_dim] int8, optional bias [out_dim] int32

fn fc_dims(graph: &Graph, op: &Operator) -> Result<(usize, usize, usize), String> {
    let input = expect_activation(graph, op.inputs[0])?;
    let weights = expect_constant(graph, op.inputs[1], DType::Int8)?;
    if weights.dims.len() != 2 {
        return Err(format!("weights must be rank 2, got {:?}", weights.dims));
    }
    let (out_dim, in_dim) = (weights.dims[0], weights.dims[1]);
    if in_dim == 0 || input.element_count() % in_dim != 0 {
        return Err(format!(
            "input of {} elements does not divide into rows of {in_dim}",
            input.element_count()
        ));
    }
    Ok((input.element_count() / in_dim, in_dim, out_dim))
}

fn prepare_fully_connected(graph: &Graph, op: &Operator) -> Result<(), String> {
    expect_arity(op, &[2, 3], 1)?;
    let (batch, _, out_dim) = fc_dims(graph, op)?;
    let output = expect_activation(graph, op.outputs[0])?;
    if output.element_count() != batch * out_dim {
        return Err(format!(
            "output {:?} cannot hold {batch} × {out_dim}",
            output.dims
        ));
    }
    if let Some(&bias) = op.inputs.get(2) {
        let bias = expect_constant(graph, bias, DType::Int32)?;
        if bias.element_count() != out_dim {
            return Err(format!("bias has {} entries, expected {out_dim}", bias.element_count()));
        }
    }
    output_multiplier(
        graph.tensor(op.inputs[0]).quant,
        graph.tensor(op.inputs[1]).quant,
        output.quant,
    )?;
    Ok(())
}

fn eval_fully_connected(ctx: &mut KernelContext<'_>, op: &Operator) -> Result<(), String> {
    let graph = ctx.graph;
    let (batch, in_dim, out_dim) = fc_dims(graph, op)?;
    let in_q = graph.tensor(op.inputs[0]).quant;
    let w_q = graph.tensor(op.inputs[1]).quant;
    let out_info = graph.tensor(op.outputs[0]);
    let multiplier = output_multiplier(in_q, w_q, out_info.quant)?;
    let range = activation_range(op.params.activation, out_info.quant);

    let weights = ctx.constant(op.inputs[1], DType::Int8)?;
    let bias = match op.inputs.get(2) {
        Some(&t) => Some(ctx.constant(t, DType::Int32)?),
        None => None,
    };
    let (input, output) = ctx.io(op.inputs[0], op.outputs[0])?;

    let in_zp = i64::from(in_q.zero_point);
    let w_zp = i64::from(w_q.zero_point);
    for b in 0..batch {
        let x = &input[b * in_dim..(b + 1) * in_dim];
        for o in 0..out_dim {
            let row = &weights[o * in_dim..(o + 1) * in_dim];
            let mut acc = bias.map(|bias| i64::from(read_i32(bias, o))).unwrap_or(0);
            for (&xv, &wv) in x.iter().zip(row) {
                acc += (i64::from(xv) - in_zp) * (i64::from(wv as i8) - w_zp);
            }
            let acc = checked_acc(acc)?;
            output[b * out_dim + o] = requantize(acc, multiplier, out_info.quant.zero_point, range);
        }
    }
    Ok(())
}

// ── DEPTHWISE_CONV_2D ───────────────────────────────────────────────────────
// inputs: activation [1,H,W,C], filter [1,KH,KW,C*M] int8, optional bias [C*M] int32

struct ConvGeometry {
    in_h: usize,
    in_w: usize,
    channels: usize,
    k_h: usize,
    k_w: usize,
    out_c: usize,
    out_h: usize,
    out_w: usize,
    pad_top: usize,
    pad_left: usize,
}

/// Output size and leading pad for one spatial axis.
fn conv_axis(input: usize, kernel: usize, stride: usize, padding: Padding) -> Option<(usize, usize)> {
    match padding {
        Padding::Valid => {
            if input < kernel {
                return None;
            }
            Some(((input - kernel) / stride + 1, 0))
        }
        Padding::Same => {
            if input == 0 {
                return None;
            }
            let out = input.div_ceil(stride);
            let total = ((out - 1) * stride + kernel).saturating_sub(input);
            Some((out, total / 2))
        }
    }
}

fn conv_geometry(graph: &Graph, op: &Operator) -> Result<ConvGeometry, String> {
    let input = expect_activation(graph, op.inputs[0])?;
    let filter = expect_constant(graph, op.inputs[1], DType::Int8)?;
    let [1, in_h, in_w, channels] = input.dims[..] else {
        return Err(format!("input must be [1,H,W,C], got {:?}", input.dims));
    };
    let [1, k_h, k_w, out_c] = filter.dims[..] else {
        return Err(format!("filter must be [1,KH,KW,C*M], got {:?}", filter.dims));
    };
    if channels == 0 || out_c % channels != 0 {
        return Err(format!("{out_c} output channels is not a multiple of {channels}"));
    }
    let (stride_h, stride_w) = (op.params.stride_h as usize, op.params.stride_w as usize);
    if stride_h == 0 || stride_w == 0 {
        return Err("stride must be at least 1".into());
    }
    let (out_h, pad_top) = conv_axis(in_h, k_h, stride_h, op.params.padding)
        .ok_or_else(|| format!("kernel height {k_h} exceeds input {in_h}"))?;
    let (out_w, pad_left) = conv_axis(in_w, k_w, stride_w, op.params.padding)
        .ok_or_else(|| format!("kernel width {k_w} exceeds input {in_w}"))?;
    Ok(ConvGeometry {
        in_h,
        in_w,
        channels,
        k_h,
        k_w,
        out_c,
        out_h,
        out_w,
        pad_top,
        pad_left,
    })
}

fn prepare_depthwise_conv(graph: &Graph, op: &Operator) -> Result<(), String> {
    expect_arity(op, &[2, 3], 1)?;
    let g = conv_geometry(graph, op)?;
    let output = expect_activation(graph, op.outputs[0])?;
    let expected = [1, g.out_h, g.out_w, g.out_c];
    if output.dims[..] != expected {
        return Err(format!("output must be {expected:?}, got {:?}", output.dims));
    }
    if let Some(&bias) = op.inputs.get(2) {
        let bias = expect_constant(graph, bias, DType::Int32)?;
        if bias.element_count() != g.out_c {
            return Err(format!("bias has {} entries, expected {}", bias.element_count(), g.out_c));
        }
    }
    output_multiplier(
        graph.tensor(op.inputs[0]).quant,
        graph.tensor(op.inputs[1]).quant,
        output.quant,
    )?;
    Ok(())
}

fn eval_depthwise_conv(ctx: &mut KernelContext<'_>, op: &Operator) -> Result<(), String> {
    let graph = ctx.graph;
    let g = conv_geometry(graph, op)?;
    let in_q = graph.tensor(op.inputs[0]).quant;
    let f_q = graph.tensor(op.inputs[1]).quant;
    let out_q = graph.tensor(op.outputs[0]).quant;
    let multiplier = output_multiplier(in_q, f_q, out_q)?;
    let range = activation_range(op.params.activation, out_q);
    let (stride_h, stride_w) = (op.params.stride_h as usize, op.params.stride_w as usize);
    let depth_multiplier = g.out_c / g.channels;

    let filter = ctx.constant(op.inputs[1], DType::Int8)?;
    let bias = match op.inputs.get(2) {
        Some(&t) => Some(ctx.constant(t, DType::Int32)?),
        None => None,
    };
    let (input, output) = ctx.io(op.inputs[0], op.outputs[0])?;

    let in_zp = i64::from(in_q.zero_point);
    let f_zp = i64::from(f_q.zero_point);
    for oy in 0..g.out_h {
        for ox in 0..g.out_w {
            for c in 0..g.channels {
                for m in 0..depth_multiplier {
                    let oc = c * depth_multiplier + m;
                    let mut acc = bias.map(|bias| i64::from(read_i32(bias, oc))).unwrap_or(0);
                    for ky in 0..g.k_h {
                        let Some(iy) = (oy * stride_h + ky).checked_sub(g.pad_top) else {
                            continue;
                        };
                        if iy >= g.in_h {
                            continue;
                        }
                        for kx in 0..g.k_w {
                            let Some(ix) = (ox * stride_w + kx).checked_sub(g.pad_left) else {
                                continue;
                            };
                            if ix >= g.in_w {
                                continue;
                            }
                            let x = i64::from(input[(iy * g.in_w + ix) * g.channels + c]);
                            let f = i64::from(filter[(ky * g.k_w + kx) * g.out_c + oc] as i8);
                            acc += (x - in_zp) * (f - f_zp);
                        }
                    }
                    let acc = checked_acc(acc)?;
                    output[(oy * g.out_w + ox) * g.out_c + oc] =
                        requantize(acc, multiplier, out_q.zero_point, range);
                }
            }
        }
    }
    Ok(())
}

// ── SOFTMAX ─────────────────────────────────────────────────────────────────
// Normalises along the innermost dimension.

fn prepare_softmax(graph: &Graph, op: &Operator) -> Result<(), String> {
    expect_arity(op, &[1], 1)?;
    let input = expect_activation(graph, op.inputs[0])?;
    let output = expect_activation(graph, op.outputs[0])?;
    if input.dims != output.dims {
        return Err(format!("output {:?} differs from input {:?}", output.dims, input.dims));
    }
    if input.dims.last().copied().unwrap_or(0) == 0 {
        return Err("softmax over an empty axis".into());
    }
    if !(output.quant.scale.is_finite() && output.quant.scale > 0.0) {
        return Err(format!("invalid output scale {}", output.quant.scale));
    }
    Ok(())
}

fn eval_softmax(ctx: &mut KernelContext<'_>, op: &Operator) -> Result<(), String> {
    let graph = ctx.graph;
    let in_info = graph.tensor(op.inputs[0]);
    let out_q = graph.tensor(op.outputs[0]).quant;
    let in_scale = in_info.quant.scale;
    let depth = in_info.dims.last().copied().unwrap_or(0);
    let (input, output) = ctx.io(op.inputs[0], op.outputs[0])?;

    for (row_in, row_out) in input.chunks_exact(depth).zip(output.chunks_exact_mut(depth)) {
        let max = row_in.iter().copied().max().unwrap_or(0);
        let sum: f32 = row_in
            .iter()
            .map(|&q| ((i32::from(q) - i32::from(max)) as f32 * in_scale).exp())
            .sum();
        if !sum.is_finite() || sum <= 0.0 {
            return Err(format!("softmax normaliser is {sum}"));
        }
        for (&q, out) in row_in.iter().zip(row_out.iter_mut()) {
            let p = ((i32::from(q) - i32::from(max)) as f32 * in_scale).exp() / sum;
            let v = (p / out_q.scale).round() as i32 + out_q.zero_point;
            *out = v.clamp(i32::from(i8::MIN), i32::from(i8::MAX)) as i8;
        }
    }
    Ok(())
}

// ── RESHAPE ─────────────────────────────────────────────────────────────────
// Optional second input (target shape) is informational; the output tensor's
// dims are authoritative.

fn prepare_reshape(graph: &Graph, op: &Operator) -> Result<(), String> {
    expect_arity(op, &[1, 2], 1)?;
    let input = expect_activation(graph, op.inputs[0])?;
    let output = expect_activation(graph, op.outputs[0])?;
    if input.element_count() != output.element_count() {
        return Err(format!(
            "cannot reshape {:?} into {:?}",
            input.dims, output.dims
        ));
    }
    Ok(())
}

fn eval_reshape(ctx: &mut KernelContext<'_>, op: &Operator) -> Result<(), String> {
    let (input, output) = ctx.io(op.inputs[0], op.outputs[0])?;
    output.copy_from_slice(input);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SCHEMA_VERSION;
    use crate::inference::builder::ModelBuilder;
    use crate::inference::model::{Graph, OpParams};
    use crate::inference::planner;

    /// Run every operator of a built graph on `input`, returning the output.
    fn run(b: &ModelBuilder, input: &[i8]) -> Result<Vec<i8>, String> {
        let bytes = b.build();
        let graph = Graph::parse(&bytes, SCHEMA_VERSION).map_err(|e| e.to_string())?;
        let regs = builtin_registrations();
        for op in &graph.operators {
            let reg = regs.iter().find(|r| r.opcode == op.opcode).unwrap();
            (reg.prepare)(&graph, op)?;
        }
        let plan = planner::plan(&graph).map_err(|e| e.to_string())?;
        let mut arena = vec![0i8; plan.required];
        let in_r = plan.range(graph.input).unwrap();
        arena[in_r].copy_from_slice(input);
        for op in &graph.operators {
            let reg = regs.iter().find(|r| r.opcode == op.opcode).unwrap();
            let mut ctx = KernelContext {
                graph: &graph,
                model: &bytes,
                arena: &mut arena,
                plan: &plan,
            };
            (reg.eval)(&mut ctx, op)?;
        }
        Ok(arena[plan.range(graph.output).unwrap()].to_vec())
    }

    const UNIT: QuantParams = QuantParams::new(1.0, 0);

    #[test]
    fn fully_connected_matches_hand_computation() {
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 3], UNIT);
        let w = b.constant_i8(&[2, 3], &[1, 2, 3, -1, 0, 1], UNIT);
        let bias = b.constant_i32(&[2], &[10, -5], UNIT);
        let out = b.activation(&[1, 2], UNIT);
        b.operator(OpCode::FullyConnected, OpParams::default(), &[input, w, bias], &[out]);
        b.set_io(input, out);

        // [1,2,3]·[1,2,3] + 10 = 24 ; [1,2,3]·[-1,0,1] - 5 = -3
        assert_eq!(run(&b, &[1, 2, 3]).unwrap(), vec![24, -3]);
    }

    #[test]
    fn fully_connected_requantizes_and_applies_relu() {
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 2], QuantParams::new(0.5, 0));
        let w = b.constant_i8(&[2, 2], &[4, 4, -4, -4], QuantParams::new(0.5, 0));
        let out = b.activation(&[1, 2], QuantParams::new(1.0, -10));
        b.operator(
            OpCode::FullyConnected,
            OpParams {
                activation: Activation::Relu,
                ..OpParams::default()
            },
            &[input, w],
            &[out],
        );
        b.set_io(input, out);

        // acc = 4*(3+5) = 32 → 32 * 0.25 = 8 → +zp = -2 ; negative row clamps at zp.
        assert_eq!(run(&b, &[3, 5]).unwrap(), vec![-2, -10]);
    }

    #[test]
    fn fully_connected_saturates() {
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 4], UNIT);
        let w = b.constant_i8(&[1, 4], &[127; 4], UNIT);
        let out = b.activation(&[1, 1], UNIT);
        b.operator(OpCode::FullyConnected, OpParams::default(), &[input, w], &[out]);
        b.set_io(input, out);
        assert_eq!(run(&b, &[100; 4]).unwrap(), vec![127]);
    }

    #[test]
    fn depthwise_valid_padding() {
        // 1×3×3×1 input, 2×2 filter of ones, stride 1 → 2×2 window sums.
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 3, 3, 1], UNIT);
        let f = b.constant_i8(&[1, 2, 2, 1], &[1; 4], UNIT);
        let out = b.activation(&[1, 2, 2, 1], UNIT);
        b.operator(OpCode::DepthwiseConv2d, OpParams::default(), &[input, f], &[out]);
        b.set_io(input, out);
        assert_eq!(
            run(&b, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap(),
            vec![12, 16, 24, 28]
        );
    }

    #[test]
    fn depthwise_same_padding_with_multiplier() {
        // 1×2×2×1 input, 3×3 filter, depth multiplier 2 (filters 1 and -1).
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 2, 2, 1], UNIT);
        let mut filter = Vec::new();
        for _ in 0..9 {
            filter.extend_from_slice(&[1i8, -1]);
        }
        let f = b.constant_i8(&[1, 3, 3, 2], &filter, UNIT);
        let bias = b.constant_i32(&[2], &[1, 0], UNIT);
        let out = b.activation(&[1, 2, 2, 2], UNIT);
        b.operator(
            OpCode::DepthwiseConv2d,
            OpParams {
                padding: Padding::Same,
                ..OpParams::default()
            },
            &[input, f, bias],
            &[out],
        );
        b.set_io(input, out);
        // Every 3×3 window centred on a 2×2 input covers all four pixels.
        assert_eq!(
            run(&b, &[1, 2, 3, 4]).unwrap(),
            vec![11, -10, 11, -10, 11, -10, 11, -10]
        );
    }

    #[test]
    fn depthwise_rejects_wrong_output_shape() {
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 3, 3, 1], UNIT);
        let f = b.constant_i8(&[1, 2, 2, 1], &[1; 4], UNIT);
        let out = b.activation(&[1, 3, 3, 1], UNIT);
        b.operator(OpCode::DepthwiseConv2d, OpParams::default(), &[input, f], &[out]);
        b.set_io(input, out);
        assert!(run(&b, &[0; 9]).is_err());
    }

    #[test]
    fn softmax_prefers_largest_logit() {
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 4], QuantParams::new(0.1, 0));
        let out = b.activation(&[1, 4], QuantParams::new(1.0 / 256.0, -128));
        b.operator(OpCode::Softmax, OpParams::default(), &[input], &[out]);
        b.set_io(input, out);

        let probs = run(&b, &[30, 0, 0, 0]).unwrap();
        // e^3 / (e^3 + 3) ≈ 0.870 → 223 - 128
        assert_eq!(probs[0], 95);
        assert!(probs[1..].iter().all(|&p| p == probs[1]));
        assert!(probs[1] < probs[0]);
    }

    #[test]
    fn softmax_of_equal_logits_is_uniform() {
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 4], QuantParams::new(0.1, 0));
        let out = b.activation(&[1, 4], QuantParams::new(1.0 / 256.0, -128));
        b.operator(OpCode::Softmax, OpParams::default(), &[input], &[out]);
        b.set_io(input, out);
        // 0.25 * 256 = 64 → -64
        assert_eq!(run(&b, &[-7; 4]).unwrap(), vec![-64; 4]);
    }

    #[test]
    fn reshape_copies_and_checks_counts() {
        let mut b = ModelBuilder::new();
        let input = b.activation(&[1, 6], UNIT);
        let out = b.activation(&[1, 2, 3, 1], UNIT);
        b.operator(OpCode::Reshape, OpParams::default(), &[input], &[out]);
        b.set_io(input, out);
        assert_eq!(run(&b, &[1, 2, 3, 4, 5, 6]).unwrap(), vec![1, 2, 3, 4, 5, 6]);

        let mut bad = ModelBuilder::new();
        let input = bad.activation(&[1, 6], UNIT);
        let out = bad.activation(&[1, 5], UNIT);
        bad.operator(OpCode::Reshape, OpParams::default(), &[input], &[out]);
        bad.set_io(input, out);
        assert!(run(&bad, &[0; 6]).is_err());
    }

    #[test]
    fn relu6_range_tracks_zero_point() {
        assert_eq!(activation_range(Activation::Relu6, QuantParams::new(0.1, -128)), (-128, -68));
        assert_eq!(activation_range(Activation::Relu, QuantParams::new(1.0, -200)), (-128, 127));
    }
}
