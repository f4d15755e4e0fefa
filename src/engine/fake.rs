//! Deterministic stand-in runtime for hardware-independent tests.
//!
//! The fake ignores the artifact's layers: its output is the mean of the
//! dequantized inputs, requantized with the output parameters. Invocation
//! can be forced to fail.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::arena::{required_bytes, Arena};
use super::model::{Activation, FullyConnected, Model, SCHEMA_VERSION};
use super::types::{Engine, EngineError, Interpreter, TensorHandle, TensorKind};
use crate::quant::QuantParams;

#[derive(Debug, Clone)]
pub struct FakeEngine {
    schema_version: u32,
    fail_invoke: bool,
    invocations: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            fail_invoke: false,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every `invoke` returns `InvocationError`
    pub fn failing() -> Self {
        Self {
            fail_invoke: true,
            ..Self::new()
        }
    }

    /// Pretend to be a runtime built for another schema
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Number of `invoke` calls across all interpreters from this engine
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for FakeEngine {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn load(&self, model_bytes: &[u8]) -> Result<Model, EngineError> {
        let found = Model::peek_schema_version(model_bytes)?;
        if found != self.schema_version() {
            return Err(EngineError::SchemaMismatch {
                expected: self.schema_version(),
                found,
            });
        }
        Ok(Model::from_bytes(model_bytes)?)
    }

    fn allocate(&self, model: Model, mut arena: Arena) -> Result<Box<dyn Interpreter>, EngineError> {
        model.validate()?;
        let required = required_bytes(&[model.input_len, model.output_len]);
        if required > arena.capacity() {
            return Err(EngineError::ArenaExhausted {
                required,
                capacity: arena.capacity(),
            });
        }
        let input = TensorHandle {
            index: 0,
            offset: arena.reserve(model.input_len)?,
            len: model.input_len,
            params: model.input,
        };
        let output = TensorHandle {
            index: 0,
            offset: arena.reserve(model.output_len)?,
            len: model.output_len,
            params: model.output,
        };
        Ok(Box::new(FakeInterpreter {
            arena,
            input,
            output,
            fail_invoke: self.fail_invoke,
            invocations: Arc::clone(&self.invocations),
        }))
    }

    fn clone_box(&self) -> Box<dyn Engine> {
        Box::new(self.clone())
    }
}

struct FakeInterpreter {
    arena: Arena,
    input: TensorHandle,
    output: TensorHandle,
    fail_invoke: bool,
    invocations: Arc<AtomicUsize>,
}

impl Interpreter for FakeInterpreter {
    fn input_tensor(&self, index: usize) -> Result<TensorHandle, EngineError> {
        if index == 0 {
            Ok(self.input)
        } else {
            Err(EngineError::TensorIndex { kind: TensorKind::Input, index })
        }
    }

    fn output_tensor(&self, index: usize) -> Result<TensorHandle, EngineError> {
        if index == 0 {
            Ok(self.output)
        } else {
            Err(EngineError::TensorIndex { kind: TensorKind::Output, index })
        }
    }

    fn tensor(&self, handle: &TensorHandle) -> &[i8] {
        self.arena.region(handle.offset, handle.len)
    }

    fn tensor_mut(&mut self, handle: &TensorHandle) -> &mut [i8] {
        self.arena.region_mut(handle.offset, handle.len)
    }

    fn invoke(&mut self) -> Result<(), EngineError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if self.fail_invoke {
            return Err(EngineError::InvocationError("fake engine configured to fail".into()));
        }

        let input = self.arena.region(self.input.offset, self.input.len);
        let sum: f32 = input.iter().map(|&q| self.input.params.dequantize(q)).sum();
        let mean = sum / input.len() as f32;
        let q = self.output.params.quantize_saturating(mean);
        self.arena.region_mut(self.output.offset, self.output.len).fill(q);
        Ok(())
    }

    fn arena_used(&self) -> usize {
        self.arena.used()
    }

    fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }
}

/// Artifact bytes accepted by [`FakeEngine`] (and, being well-formed, by the
/// native engine too)
pub fn fake_model_bytes(
    schema_version: u32,
    input_len: usize,
    input: QuantParams,
    output_len: usize,
    output: QuantParams,
) -> Vec<u8> {
    Model {
        schema_version,
        input_len,
        input,
        output_len,
        output,
        layers: vec![FullyConnected {
            activation: Activation::None,
            in_features: input_len,
            out_features: output_len,
            weight_scale: 1.0,
            output,
            weights: vec![0; input_len * output_len],
            bias: vec![0; output_len],
        }],
    }
    .to_bytes()
}

/// Seven inputs over [0, 6], one output at 1/32 resolution
pub fn seven_input_model_bytes() -> Vec<u8> {
    fake_model_bytes(
        SCHEMA_VERSION,
        7,
        QuantParams::new(6.0 / 255.0, -128),
        1,
        QuantParams::new(1.0 / 32.0, 0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_mean_of_inputs() {
        let engine = FakeEngine::new();
        let model = engine.load(&seven_input_model_bytes()).unwrap();
        let mut interpreter = engine.allocate(model, Arena::new(64)).unwrap();
        let input = interpreter.input_tensor(0).unwrap();
        let output = interpreter.output_tensor(0).unwrap();

        // All inputs at real value 2.0
        let q = input.params.quantize(2.0);
        interpreter.tensor_mut(&input).fill(q);
        interpreter.invoke().unwrap();

        let value = output.params.dequantize(interpreter.tensor(&output)[0]);
        assert!((value - 2.0).abs() <= output.params.scale, "value={}", value);
        assert_eq!(engine.invocations(), 1);
    }

    #[test]
    fn test_failing_engine() {
        let engine = FakeEngine::failing();
        let model = engine.load(&seven_input_model_bytes()).unwrap();
        let mut interpreter = engine.allocate(model, Arena::new(64)).unwrap();
        assert!(matches!(interpreter.invoke(), Err(EngineError::InvocationError(_))));
        assert!(matches!(interpreter.invoke(), Err(EngineError::InvocationError(_))));
        assert_eq!(engine.invocations(), 2);
    }

    #[test]
    fn test_schema_gate() {
        let engine = FakeEngine::new().with_schema_version(SCHEMA_VERSION + 1);
        let err = engine.load(&seven_input_model_bytes()).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_schema_version_reported() {
        assert_eq!(FakeEngine::new().schema_version(), SCHEMA_VERSION);
        let engine = FakeEngine::new().with_schema_version(7);
        assert_eq!(engine.schema_version(), 7);
        match engine.load(&seven_input_model_bytes()) {
            Err(EngineError::SchemaMismatch { expected, found }) => {
                assert_eq!(expected, 7);
                assert_eq!(found, SCHEMA_VERSION);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_allocate_validates_hand_built_model() {
        let engine = FakeEngine::new();
        let mut model = engine.load(&seven_input_model_bytes()).unwrap();
        model.layers[0].in_features = 3;
        assert!(matches!(
            engine.allocate(model, Arena::new(64)),
            Err(EngineError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_arena_too_small() {
        let engine = FakeEngine::new();
        let model = engine.load(&seven_input_model_bytes()).unwrap();
        assert!(matches!(
            engine.allocate(model, Arena::new(16)),
            Err(EngineError::ArenaExhausted { required: 32, capacity: 16 })
        ));
    }
}
