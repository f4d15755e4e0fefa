use tracing::{debug, info};

use super::arena::{required_bytes, Arena};
use super::model::{Activation, Model, SCHEMA_VERSION};
use super::types::{Engine, EngineError, Interpreter, TensorHandle, TensorKind};

/// Built-in int8 runtime for fully-connected models
#[derive(Debug, Clone)]
pub struct NativeEngine {
    schema_version: u32,
}

impl NativeEngine {
    pub fn new() -> Self {
        Self { schema_version: SCHEMA_VERSION }
    }
}

impl Default for NativeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for NativeEngine {
    fn name(&self) -> &'static str {
        "native"
    }

    fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn load(&self, model_bytes: &[u8]) -> Result<Model, EngineError> {
        // Check the version before trusting the rest of the layout
        let found = Model::peek_schema_version(model_bytes)?;
        if found != self.schema_version() {
            return Err(EngineError::SchemaMismatch {
                expected: self.schema_version(),
                found,
            });
        }
        let model = Model::from_bytes(model_bytes)?;
        info!(
            "Loaded model (schema {}): input [{}] {}, output [{}] {}, {} layers, {} weight bytes",
            model.schema_version, model.input_len, model.input, model.output_len, model.output,
            model.layers.len(), model.weight_bytes()
        );
        Ok(model)
    }

    fn allocate(&self, model: Model, mut arena: Arena) -> Result<Box<dyn Interpreter>, EngineError> {
        model.validate()?;
        let lengths = model.activation_lengths();
        let required = required_bytes(&lengths);
        if required > arena.capacity() {
            return Err(EngineError::ArenaExhausted {
                required,
                capacity: arena.capacity(),
            });
        }

        let mut tensors = Vec::with_capacity(lengths.len());
        for (index, &len) in lengths.iter().enumerate() {
            let offset = arena.reserve(len)?;
            let params = if index == 0 {
                model.input
            } else {
                model.layers[index - 1].output
            };
            tensors.push(TensorHandle { index, offset, len, params });
        }

        // Folded requantization scale per layer
        let multipliers = model
            .layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                model.layer_input_params(i).scale * layer.weight_scale / layer.output.scale
            })
            .collect::<Vec<f32>>();
        if let Some(bad) = multipliers.iter().position(|m| !m.is_finite()) {
            return Err(EngineError::InvalidModel(format!("Layer {} has a non-finite requantization scale", bad)));
        }

        info!("Arena plan: {} tensors, {}/{} bytes", tensors.len(), arena.used(), arena.capacity());
        Ok(Box::new(NativeInterpreter {
            model,
            arena,
            tensors,
            multipliers,
        }))
    }

    fn clone_box(&self) -> Box<dyn Engine> {
        Box::new(self.clone())
    }
}

struct NativeInterpreter {
    model: Model,
    arena: Arena,
    /// Input tensor first, then one output tensor per layer
    tensors: Vec<TensorHandle>,
    multipliers: Vec<f32>,
}

impl Interpreter for NativeInterpreter {
    fn input_tensor(&self, index: usize) -> Result<TensorHandle, EngineError> {
        if index != 0 {
            return Err(EngineError::TensorIndex { kind: TensorKind::Input, index });
        }
        Ok(self.tensors[0])
    }

    fn output_tensor(&self, index: usize) -> Result<TensorHandle, EngineError> {
        match self.tensors.last() {
            Some(handle) if index == 0 => Ok(*handle),
            _ => Err(EngineError::TensorIndex { kind: TensorKind::Output, index }),
        }
    }

    fn tensor(&self, handle: &TensorHandle) -> &[i8] {
        self.arena.region(handle.offset, handle.len)
    }

    fn tensor_mut(&mut self, handle: &TensorHandle) -> &mut [i8] {
        self.arena.region_mut(handle.offset, handle.len)
    }

    fn invoke(&mut self) -> Result<(), EngineError> {
        for (i, layer) in self.model.layers.iter().enumerate() {
            let src = self.tensors[i];
            let dst = self.tensors[i + 1];
            let input_zero_point = src.params.zero_point;
            let multiplier = self.multipliers[i];

            let (x, y) = self
                .arena
                .split_regions((src.offset, src.len), (dst.offset, dst.len))
                .ok_or_else(|| EngineError::InvocationError(format!("Layer {} tensors overlap", i)))?;

            // ReLU clamps at the real value 0, i.e. the output zero point
            let floor = match layer.activation {
                Activation::Relu => layer.output.zero_point.max(i8::MIN as i32),
                Activation::None => i8::MIN as i32,
            };

            for (o, out) in y.iter_mut().enumerate() {
                let row = &layer.weights[o * layer.in_features..(o + 1) * layer.in_features];
                let mut acc = layer.bias[o];
                for (&w, &v) in row.iter().zip(x.iter()) {
                    let term = i32::from(w) * (i32::from(v) - input_zero_point);
                    acc = acc.checked_add(term).ok_or_else(|| {
                        EngineError::InvocationError(format!("Accumulator overflow in layer {} unit {}", i, o))
                    })?;
                }

                let scaled = (acc as f32 * multiplier).round();
                if !scaled.is_finite() {
                    return Err(EngineError::InvocationError(format!("Non-finite activation in layer {}", i)));
                }
                let q = (scaled as i32).saturating_add(layer.output.zero_point);
                *out = q.clamp(floor, i8::MAX as i32) as i8;
            }
        }
        debug!("Forward pass complete over {} layers", self.model.layers.len());
        Ok(())
    }

    fn arena_used(&self) -> usize {
        self.arena.used()
    }

    fn arena_capacity(&self) -> usize {
        self.arena.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::FullyConnected;
    use crate::quant::QuantParams;

    /// y = x0 + x1 with unit scales
    fn adder(activation: Activation, bias: i32) -> Model {
        let unit = QuantParams::new(1.0, 0);
        Model {
            schema_version: SCHEMA_VERSION,
            input_len: 2,
            input: unit,
            output_len: 1,
            output: unit,
            layers: vec![FullyConnected {
                activation,
                in_features: 2,
                out_features: 1,
                weight_scale: 1.0,
                output: unit,
                weights: vec![1, 1],
                bias: vec![bias],
            }],
        }
    }

    fn run(model: Model, inputs: &[i8]) -> Result<i8, EngineError> {
        let engine = NativeEngine::new();
        let model = engine.load(&model.to_bytes())?;
        let mut interpreter = engine.allocate(model, Arena::new(256))?;
        let input = interpreter.input_tensor(0)?;
        let output = interpreter.output_tensor(0)?;
        interpreter.tensor_mut(&input).copy_from_slice(inputs);
        interpreter.invoke()?;
        Ok(interpreter.tensor(&output)[0])
    }

    #[test]
    fn test_fully_connected_sum() {
        assert_eq!(run(adder(Activation::None, 0), &[3, 4]).unwrap(), 7);
        assert_eq!(run(adder(Activation::None, 0), &[-3, -4]).unwrap(), -7);
        assert_eq!(run(adder(Activation::None, 10), &[1, 1]).unwrap(), 12);
    }

    #[test]
    fn test_relu_and_saturation() {
        assert_eq!(run(adder(Activation::Relu, 0), &[-3, -4]).unwrap(), 0);
        assert_eq!(run(adder(Activation::None, 0), &[100, 100]).unwrap(), 127);
        assert_eq!(run(adder(Activation::None, 0), &[-100, -100]).unwrap(), -128);
    }

    #[test]
    fn test_accumulator_overflow_is_invocation_error() {
        let result = run(adder(Activation::None, i32::MAX), &[1, 1]);
        assert!(matches!(result, Err(EngineError::InvocationError(_))));
    }

    #[test]
    fn test_schema_mismatch_on_load() {
        let mut model = adder(Activation::None, 0);
        model.schema_version = 2;
        match NativeEngine::new().load(&model.to_bytes()) {
            Err(EngineError::SchemaMismatch { expected, found }) => {
                assert_eq!(expected, SCHEMA_VERSION);
                assert_eq!(found, 2);
            }
            other => panic!("expected SchemaMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_allocate_rejects_short_weights() {
        let mut model = adder(Activation::None, 0);
        model.layers[0].weights.truncate(1);
        match NativeEngine::new().allocate(model, Arena::new(256)) {
            Err(EngineError::InvalidModel(msg)) => assert!(msg.contains("Layer 0"), "{}", msg),
            other => panic!("expected InvalidModel, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_allocate_rejects_missing_bias() {
        let mut model = adder(Activation::None, 0);
        model.layers[0].bias.clear();
        assert!(matches!(
            NativeEngine::new().allocate(model, Arena::new(256)),
            Err(EngineError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_arena_exhausted() {
        let engine = NativeEngine::new();
        let model = engine.load(&adder(Activation::None, 0).to_bytes()).unwrap();
        match engine.allocate(model, Arena::new(20)) {
            Err(EngineError::ArenaExhausted { required, capacity }) => {
                assert_eq!(required, 32);
                assert_eq!(capacity, 20);
            }
            other => panic!("expected ArenaExhausted, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_handles_are_fixed() {
        let engine = NativeEngine::new();
        let model = engine.load(&adder(Activation::None, 0).to_bytes()).unwrap();
        let interpreter = engine.allocate(model, Arena::new(64)).unwrap();
        let input = interpreter.input_tensor(0).unwrap();
        let output = interpreter.output_tensor(0).unwrap();
        assert_eq!(input.len, 2);
        assert_eq!(output.len, 1);
        assert_eq!(interpreter.input_tensor(0).unwrap(), input);
        assert!(interpreter.input_tensor(1).is_err());
        assert!(interpreter.output_tensor(1).is_err());
        assert_eq!(interpreter.arena_used(), 32);
        assert_eq!(interpreter.arena_capacity(), 64);
    }
}
