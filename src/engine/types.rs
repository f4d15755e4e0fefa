use std::error::Error;
use std::fmt;

use super::arena::Arena;
use super::model::{Model, ModelError};
use crate::quant::QuantParams;

/// Errors surfaced by an inference engine
#[derive(Debug)]
pub enum EngineError {
    /// The artifact was built for another schema version
    SchemaMismatch { expected: u32, found: u32 },
    /// The artifact could not be decoded or is inconsistent
    InvalidModel(String),
    /// The arena cannot hold the model's working set
    ArenaExhausted { required: usize, capacity: usize },
    /// A forward pass failed
    InvocationError(String),
    /// No tensor with that index
    TensorIndex { kind: TensorKind, index: usize },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineError::SchemaMismatch { expected, found } => write!(
                f, "Model schema version {} does not match runtime version {}", found, expected
            ),
            EngineError::InvalidModel(msg) => write!(f, "Invalid model: {}", msg),
            EngineError::ArenaExhausted { required, capacity } => write!(
                f, "Arena too small: model needs {} bytes, arena holds {}", required, capacity
            ),
            EngineError::InvocationError(msg) => write!(f, "Invocation failed: {}", msg),
            EngineError::TensorIndex { kind, index } => write!(f, "No {} tensor at index {}", kind, index),
        }
    }
}

impl Error for EngineError {}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::SchemaMismatch { expected, found } => EngineError::SchemaMismatch { expected, found },
            other => EngineError::InvalidModel(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    Input,
    Output,
}

impl fmt::Display for TensorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TensorKind::Input => write!(f, "input"),
            TensorKind::Output => write!(f, "output"),
        }
    }
}

/// Location of one int8 tensor inside an interpreter's arena.
///
/// Handles are obtained once after allocation and stay valid for the
/// interpreter's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorHandle {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
    pub params: QuantParams,
}

/// A model bound to its working memory, ready to run forward passes.
pub trait Interpreter {
    fn input_tensor(&self, index: usize) -> Result<TensorHandle, EngineError>;

    fn output_tensor(&self, index: usize) -> Result<TensorHandle, EngineError>;

    /// Tensor contents. `handle` must come from this interpreter.
    fn tensor(&self, handle: &TensorHandle) -> &[i8];

    fn tensor_mut(&mut self, handle: &TensorHandle) -> &mut [i8];

    /// One forward pass over whatever the input tensors currently hold
    fn invoke(&mut self) -> Result<(), EngineError>;

    /// Bytes of the arena taken by the tensor plan
    fn arena_used(&self) -> usize;

    fn arena_capacity(&self) -> usize;
}

/// Capability set of an inference runtime: load, then allocate.
pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Schema version this runtime understands
    fn schema_version(&self) -> u32;

    /// Decodes an artifact after checking its schema version
    fn load(&self, model_bytes: &[u8]) -> Result<Model, EngineError>;

    /// Plans the model's tensors into `arena`
    fn allocate(&self, model: Model, arena: Arena) -> Result<Box<dyn Interpreter>, EngineError>;

    fn clone_box(&self) -> Box<dyn Engine>;
}
