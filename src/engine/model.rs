use std::error::Error;
use std::fmt;
use std::io::{self, Cursor, Read};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use tracing::debug;

use crate::quant::QuantParams;

/// The magic bytes that identify a model artifact
pub const MODEL_MAGIC: [u8; 4] = *b"SPTM";

/// Artifact schema version this runtime understands
pub const SCHEMA_VERSION: u32 = 3;

/// Layer kind tag for an int8 fully-connected layer
const LAYER_FULLY_CONNECTED: u8 = 0;

/// Errors raised while decoding a model artifact
#[derive(Debug)]
pub enum ModelError {
    /// Wraps std::io::Error, typically a truncated artifact
    IoError(io::Error),
    /// Invalid format errors with a message
    InvalidFormat(String),
    SchemaMismatch { expected: u32, found: u32 },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ModelError::IoError(e) => write!(f, "I/O error: {}", e),
            ModelError::InvalidFormat(msg) => write!(f, "Invalid model format: {}", msg),
            ModelError::SchemaMismatch { expected, found } => {
                write!(f, "Schema version mismatch: expected {}, found {}", expected, found)
            }
        }
    }
}

impl Error for ModelError {}

impl From<io::Error> for ModelError {
    fn from(err: io::Error) -> Self {
        ModelError::IoError(err)
    }
}

/// Activation applied after a layer's requantization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Activation {
    None,
    Relu,
}

impl Activation {
    fn from_tag(tag: u8) -> Result<Self, ModelError> {
        match tag {
            0 => Ok(Activation::None),
            1 => Ok(Activation::Relu),
            other => Err(ModelError::InvalidFormat(format!("Unknown activation tag {}", other))),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Activation::None => 0,
            Activation::Relu => 1,
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Activation::None => write!(f, "none"),
            Activation::Relu => write!(f, "relu"),
        }
    }
}

/// Int8 fully-connected layer with per-tensor symmetric weights.
///
/// Weights are row-major `[out_features][in_features]`. Bias is stored at
/// scale `input_scale * weight_scale` with zero point 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullyConnected {
    pub activation: Activation,
    pub in_features: usize,
    pub out_features: usize,
    pub weight_scale: f32,
    pub output: QuantParams,
    #[serde(skip)]
    pub weights: Vec<i8>,
    #[serde(skip)]
    pub bias: Vec<i32>,
}

/// A decoded model artifact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Model {
    pub schema_version: u32,
    pub input_len: usize,
    pub input: QuantParams,
    pub output_len: usize,
    pub output: QuantParams,
    pub layers: Vec<FullyConnected>,
}

impl Model {
    /// Reads the schema version without decoding the rest
    pub fn peek_schema_version(bytes: &[u8]) -> Result<u32, ModelError> {
        let mut reader = Cursor::new(bytes);
        read_magic(&mut reader)?;
        Ok(reader.read_u32::<LittleEndian>()?)
    }

    /// Decodes an artifact of the current schema version
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        let mut reader = Cursor::new(bytes);
        read_magic(&mut reader)?;

        let schema_version = reader.read_u32::<LittleEndian>()?;
        if schema_version != SCHEMA_VERSION {
            return Err(ModelError::SchemaMismatch {
                expected: SCHEMA_VERSION,
                found: schema_version,
            });
        }

        let input_len = read_len(&mut reader)?;
        let input = read_params(&mut reader)?;
        let output_len = read_len(&mut reader)?;
        let output = read_params(&mut reader)?;

        let layer_count = read_len(&mut reader)?;
        let mut layers = Vec::with_capacity(layer_count.min(64));
        for _ in 0..layer_count {
            layers.push(read_layer(&mut reader)?);
        }

        let trailing = bytes.len() as u64 - reader.position();
        if trailing != 0 {
            return Err(ModelError::InvalidFormat(format!("{} trailing bytes after last layer", trailing)));
        }

        let model = Self {
            schema_version,
            input_len,
            input,
            output_len,
            output,
            layers,
        };
        model.validate()?;

        debug!("Decoded model: {} -> {} with {} layers", model.input_len, model.output_len, model.layers.len());
        Ok(model)
    }

    /// Serializes the model in artifact layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MODEL_MAGIC);
        // Writing into a Vec cannot fail
        let _ = self.write_body(&mut out);
        out
    }

    fn write_body(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u32::<LittleEndian>(self.schema_version)?;
        out.write_u32::<LittleEndian>(self.input_len as u32)?;
        write_params(out, &self.input)?;
        out.write_u32::<LittleEndian>(self.output_len as u32)?;
        write_params(out, &self.output)?;
        out.write_u32::<LittleEndian>(self.layers.len() as u32)?;
        for layer in &self.layers {
            out.write_u8(LAYER_FULLY_CONNECTED)?;
            out.write_u8(layer.activation.tag())?;
            out.write_u32::<LittleEndian>(layer.in_features as u32)?;
            out.write_u32::<LittleEndian>(layer.out_features as u32)?;
            out.write_f32::<LittleEndian>(layer.weight_scale)?;
            write_params(out, &layer.output)?;
            for &w in &layer.weights {
                out.write_i8(w)?;
            }
            for &b in &layer.bias {
                out.write_i32::<LittleEndian>(b)?;
            }
        }
        Ok(())
    }

    /// Quantization parameters of each layer's input
    pub fn layer_input_params(&self, layer: usize) -> QuantParams {
        if layer == 0 {
            self.input
        } else {
            self.layers[layer - 1].output
        }
    }

    /// Lengths of every activation tensor: the input, then each layer's output
    pub fn activation_lengths(&self) -> Vec<usize> {
        std::iter::once(self.input_len)
            .chain(self.layers.iter().map(|l| l.out_features))
            .collect()
    }

    pub fn weight_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.weights.len() + l.bias.len() * 4).sum()
    }

    /// Structural checks shared by the decoder and `Engine::allocate`
    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        if self.input_len == 0 || self.output_len == 0 {
            return Err(ModelError::InvalidFormat("Tensor lengths must be non-zero".into()));
        }
        if !self.input.is_valid() || !self.output.is_valid() {
            return Err(ModelError::InvalidFormat("Tensor scales must be positive and finite".into()));
        }
        let Some(last) = self.layers.last() else {
            return Err(ModelError::InvalidFormat("Model has no layers".into()));
        };

        let mut expected_in = self.input_len;
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.in_features != expected_in {
                return Err(ModelError::InvalidFormat(format!(
                    "Layer {} expects {} inputs but receives {}", i, layer.in_features, expected_in
                )));
            }
            if !(layer.weight_scale.is_finite() && layer.weight_scale > 0.0) || !layer.output.is_valid() {
                return Err(ModelError::InvalidFormat(format!("Layer {} has an invalid scale", i)));
            }
            if layer.weights.len() != layer.in_features * layer.out_features
                || layer.bias.len() != layer.out_features
            {
                return Err(ModelError::InvalidFormat(format!(
                    "Layer {} holds {} weights and {} biases for a {}x{} shape",
                    i, layer.weights.len(), layer.bias.len(), layer.out_features, layer.in_features
                )));
            }
            expected_in = layer.out_features;
        }

        if last.out_features != self.output_len || last.output != self.output {
            return Err(ModelError::InvalidFormat(
                "Last layer does not produce the declared output tensor".into()
            ));
        }
        Ok(())
    }
}

fn read_magic(reader: &mut Cursor<&[u8]>) -> Result<(), ModelError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MODEL_MAGIC {
        return Err(ModelError::InvalidFormat("Invalid magic number".into()));
    }
    Ok(())
}

fn read_len(reader: &mut Cursor<&[u8]>) -> Result<usize, ModelError> {
    Ok(reader.read_u32::<LittleEndian>()? as usize)
}

fn read_params(reader: &mut Cursor<&[u8]>) -> Result<QuantParams, ModelError> {
    let scale = reader.read_f32::<LittleEndian>()?;
    let zero_point = reader.read_i32::<LittleEndian>()?;
    Ok(QuantParams::new(scale, zero_point))
}

fn write_params(out: &mut Vec<u8>, params: &QuantParams) -> io::Result<()> {
    out.write_f32::<LittleEndian>(params.scale)?;
    out.write_i32::<LittleEndian>(params.zero_point)
}

fn read_layer(reader: &mut Cursor<&[u8]>) -> Result<FullyConnected, ModelError> {
    let kind = reader.read_u8()?;
    if kind != LAYER_FULLY_CONNECTED {
        return Err(ModelError::InvalidFormat(format!("Unsupported layer kind {}", kind)));
    }
    let activation = Activation::from_tag(reader.read_u8()?)?;
    let in_features = read_len(reader)?;
    let out_features = read_len(reader)?;
    let weight_scale = reader.read_f32::<LittleEndian>()?;
    let output = read_params(reader)?;

    let weight_count = in_features
        .checked_mul(out_features)
        .ok_or_else(|| ModelError::InvalidFormat("Layer dimensions overflow".into()))?;
    let remaining = reader.get_ref().len() as u64 - reader.position();
    if weight_count as u64 + out_features as u64 * 4 > remaining {
        return Err(ModelError::InvalidFormat(format!(
            "Layer {}x{} needs more data than the artifact holds", out_features, in_features
        )));
    }

    let mut weights = vec![0i8; weight_count];
    reader.read_i8_into(&mut weights)?;
    let mut bias = vec![0i32; out_features];
    reader.read_i32_into::<LittleEndian>(&mut bias)?;

    Ok(FullyConnected {
        activation,
        in_features,
        out_features,
        weight_scale,
        output,
        weights,
        bias,
    })
}
