// Explicit module imports for better IDE support
mod arena;
pub mod fake;
pub mod model;
mod native;
mod types;

use once_cell::sync::Lazy;

pub use arena::{align_up, required_bytes, Arena, ARENA_ALIGNMENT, TENSOR_ARENA_SIZE};
pub use model::{Activation, FullyConnected, Model, ModelError, MODEL_MAGIC, SCHEMA_VERSION};
pub use native::NativeEngine;
pub use types::{Engine, EngineError, Interpreter, TensorHandle, TensorKind};

/// Pre-compiled 7-16-1 int8 network approximating `sin(mean(inputs))`
pub static EMBEDDED_MODEL: &[u8] = include_bytes!("../../models/sine7.sptm");

// Registry of runtimes selectable by name
static ENGINE_REGISTRY: Lazy<Vec<Box<dyn Engine>>> = Lazy::new(|| {
    vec![
        Box::new(NativeEngine::new()),
        Box::new(fake::FakeEngine::new()),
    ]
});

/// Get a runtime by its registered name
pub fn get_engine_by_name(name: &str) -> Option<Box<dyn Engine>> {
    ENGINE_REGISTRY
        .iter()
        .find(|engine| engine.name().eq_ignore_ascii_case(name))
        .map(|engine| engine.clone_box())
}

/// Names of all registered runtimes
pub fn engine_names() -> Vec<&'static str> {
    ENGINE_REGISTRY.iter().map(|engine| engine.name()).collect()
}
