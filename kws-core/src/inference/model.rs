//! Model artifact and its parsed graph.
//!
//! ## Wire format (`KWSM`, little-endian)
//!
//! ```text
//! header   : magic "KWSM" | u32 schema | u32 tensors | u32 operators
//!            | u32 input tensor | u32 output tensor
//! tensor   : u8 dtype | u8 is_const | u8 rank | u8 reserved | rank × u32 dims
//!            | f32 scale | i32 zero_point | [u32 byte_len | bytes]   (const only)
//! operator : u8 opcode | u8 n_inputs | u8 n_outputs | u8 reserved
//!            | 4 × u32 params | n_inputs × u32 | n_outputs × u32
//! ```
//!
//! Constant tensor payloads stay in the artifact; the graph records byte
//! ranges into it. Activation tensors get their storage from the arena plan.

use std::borrow::Cow;
use std::ops::Range;

use crate::error::InitError;

pub const MAGIC: [u8; 4] = *b"KWSM";

/// Immutable, opaque model artifact.
#[derive(Clone)]
pub struct Model {
    bytes: Cow<'static, [u8]>,
}

impl Model {
    /// Wrap an artifact linked into the binary (e.g. `include_bytes!`).
    pub fn from_static(bytes: &'static [u8]) -> Self {
        Self {
            bytes: Cow::Borrowed(bytes),
        }
    }

    /// Wrap an artifact loaded at runtime.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Cow::Owned(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Schema version from the header, if the header is present.
    pub fn schema_version(&self) -> Option<u32> {
        if self.bytes.len() < 8 || self.bytes[..4] != MAGIC {
            return None;
        }
        Some(u32::from_le_bytes([
            self.bytes[4],
            self.bytes[5],
            self.bytes[6],
            self.bytes[7],
        ]))
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("len", &self.bytes.len())
            .field("schema_version", &self.schema_version())
            .finish()
    }
}

/// Operator type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    FullyConnected,
    DepthwiseConv2d,
    Softmax,
    Reshape,
    Conv2d,
    AveragePool2d,
    Unknown(u8),
}

impl OpCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => OpCode::FullyConnected,
            1 => OpCode::DepthwiseConv2d,
            2 => OpCode::Softmax,
            3 => OpCode::Reshape,
            4 => OpCode::Conv2d,
            5 => OpCode::AveragePool2d,
            other => OpCode::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            OpCode::FullyConnected => 0,
            OpCode::DepthwiseConv2d => 1,
            OpCode::Softmax => 2,
            OpCode::Reshape => 3,
            OpCode::Conv2d => 4,
            OpCode::AveragePool2d => 5,
            OpCode::Unknown(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    Int8,
    Int32,
}

impl DType {
    pub fn size(self) -> usize {
        match self {
            DType::Int8 => 1,
            DType::Int32 => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self, InitError> {
        match code {
            0 => Ok(DType::Int8),
            1 => Ok(DType::Int32),
            other => Err(InitError::Malformed(format!("unknown dtype {other}"))),
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            DType::Int8 => 0,
            DType::Int32 => 1,
        }
    }
}

/// Affine quantization: `real = scale * (q - zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub const fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    #[default]
    None,
    Relu,
    Relu6,
}

/// Per-operator attributes. Only the fields an operator uses are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpParams {
    pub stride_h: u32,
    pub stride_w: u32,
    pub padding: Padding,
    pub activation: Activation,
}

impl Default for OpParams {
    fn default() -> Self {
        Self {
            stride_h: 1,
            stride_w: 1,
            padding: Padding::Valid,
            activation: Activation::None,
        }
    }
}

impl OpParams {
    fn decode(raw: [u32; 4]) -> Result<Self, InitError> {
        let padding = match raw[2] {
            0 => Padding::Valid,
            1 => Padding::Same,
            other => return Err(InitError::Malformed(format!("unknown padding {other}"))),
        };
        let activation = match raw[3] {
            0 => Activation::None,
            1 => Activation::Relu,
            2 => Activation::Relu6,
            other => return Err(InitError::Malformed(format!("unknown activation {other}"))),
        };
        Ok(Self {
            stride_h: raw[0],
            stride_w: raw[1],
            padding,
            activation,
        })
    }

    pub(crate) fn encode(&self) -> [u32; 4] {
        let padding = match self.padding {
            Padding::Valid => 0,
            Padding::Same => 1,
        };
        let activation = match self.activation {
            Activation::None => 0,
            Activation::Relu => 1,
            Activation::Relu6 => 2,
        };
        [self.stride_h, self.stride_w, padding, activation]
    }
}

/// Largest tensor a model may declare. Constant payload lengths are stored as
/// `u32`, so nothing larger can be backed by real data either.
pub const MAX_TENSOR_BYTES: usize = u32::MAX as usize;

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub dtype: DType,
    pub dims: Vec<usize>,
    pub quant: QuantParams,
    /// Byte range of the payload inside the artifact; `None` for activations.
    pub constant: Option<Range<usize>>,
}

impl TensorInfo {
    /// Saturates instead of wrapping; parsed tensors are already bounded by
    /// [`MAX_TENSOR_BYTES`].
    pub fn element_count(&self) -> usize {
        self.dims.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
    }

    pub fn byte_len(&self) -> usize {
        self.element_count().saturating_mul(self.dtype.size())
    }

    /// Payload size, or `None` if it does not fit in `usize`.
    pub fn checked_byte_len(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))?
            .checked_mul(self.dtype.size())
    }

    pub fn is_constant(&self) -> bool {
        self.constant.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Operator {
    pub opcode: OpCode,
    pub params: OpParams,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// Parsed, validated view of an artifact.
#[derive(Debug, Clone)]
pub struct Graph {
    pub tensors: Vec<TensorInfo>,
    pub operators: Vec<Operator>,
    pub input: usize,
    pub output: usize,
}

impl Graph {
    /// Parse `bytes`, checking the schema version before anything else.
    ///
    /// # Errors
    /// `SchemaMismatch` when the version differs from `expected_schema`;
    /// `Malformed` for truncated or inconsistent artifacts.
    pub fn parse(bytes: &[u8], expected_schema: u32) -> Result<Self, InitError> {
        let mut r = Reader::new(bytes);
        if r.take(4)? != MAGIC {
            return Err(InitError::Malformed("bad magic".into()));
        }
        let found = r.u32()?;
        if found != expected_schema {
            return Err(InitError::SchemaMismatch {
                expected: expected_schema,
                found,
            });
        }

        let tensor_count = r.u32()? as usize;
        let operator_count = r.u32()? as usize;
        let input = r.u32()? as usize;
        let output = r.u32()? as usize;

        // Every record is at least 4 bytes; reject absurd counts before
        // reserving memory for them.
        if tensor_count.saturating_add(operator_count) > bytes.len() / 4 {
            return Err(InitError::Malformed("record counts exceed artifact size".into()));
        }

        let mut tensors = Vec::with_capacity(tensor_count);
        for _ in 0..tensor_count {
            tensors.push(r.tensor()?);
        }

        let mut operators = Vec::with_capacity(operator_count);
        for _ in 0..operator_count {
            let op = r.operator()?;
            if let Some(&bad) = op.inputs.iter().chain(&op.outputs).find(|&&t| t >= tensor_count) {
                return Err(InitError::Malformed(format!(
                    "operator references tensor {bad} of {tensor_count}"
                )));
            }
            operators.push(op);
        }

        if r.remaining() != 0 {
            return Err(InitError::Malformed(format!(
                "{} trailing bytes",
                r.remaining()
            )));
        }
        if input >= tensor_count || output >= tensor_count {
            return Err(InitError::Malformed("graph io index out of range".into()));
        }
        if tensors[input].is_constant() || tensors[output].is_constant() {
            return Err(InitError::Malformed("graph io tensors must be activations".into()));
        }
        if let Some(t) = tensors
            .iter()
            .position(|t| !t.is_constant() && t.dtype != DType::Int8)
        {
            return Err(InitError::Malformed(format!(
                "activation tensor {t} is not int8"
            )));
        }

        Ok(Self {
            tensors,
            operators,
            input,
            output,
        })
    }

    pub fn tensor(&self, index: usize) -> &TensorInfo {
        &self.tensors[index]
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], InitError> {
        if self.remaining() < n {
            return Err(InitError::Malformed(format!(
                "truncated at byte {} (wanted {n} more)",
                self.pos
            )));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, InitError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, InitError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, InitError> {
        Ok(self.u32()? as i32)
    }

    fn f32(&mut self) -> Result<f32, InitError> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn tensor(&mut self) -> Result<TensorInfo, InitError> {
        let dtype = DType::from_code(self.u8()?)?;
        let is_const = self.u8()? != 0;
        let rank = self.u8()? as usize;
        self.u8()?;

        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(self.u32()? as usize);
        }
        let quant = QuantParams::new(self.f32()?, self.i32()?);

        let mut info = TensorInfo {
            dtype,
            dims,
            quant,
            constant: None,
        };
        let byte_len = match info.checked_byte_len() {
            Some(n) if n <= MAX_TENSOR_BYTES => n,
            _ => {
                return Err(InitError::Malformed(format!(
                    "tensor shape {:?} is too large",
                    info.dims
                )))
            }
        };
        if is_const {
            let len = self.u32()? as usize;
            let start = self.pos;
            self.take(len)?;
            if len != byte_len {
                return Err(InitError::Malformed(format!(
                    "constant payload is {len} bytes, shape {:?} needs {byte_len}",
                    info.dims
                )));
            }
            info.constant = Some(start..start + len);
        }
        Ok(info)
    }

    fn operator(&mut self) -> Result<Operator, InitError> {
        let opcode = OpCode::from_code(self.u8()?);
        let n_inputs = self.u8()? as usize;
        let n_outputs = self.u8()? as usize;
        self.u8()?;
        let params = OpParams::decode([self.u32()?, self.u32()?, self.u32()?, self.u32()?])?;

        let mut inputs = Vec::with_capacity(n_inputs);
        for _ in 0..n_inputs {
            inputs.push(self.u32()? as usize);
        }
        let mut outputs = Vec::with_capacity(n_outputs);
        for _ in 0..n_outputs {
            outputs.push(self.u32()? as usize);
        }
        Ok(Operator {
            opcode,
            params,
            inputs,
            outputs,
        })
    }
}
