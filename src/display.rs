use comfy_table::{Attribute, Cell, CellAlignment, ContentArrangement, Table};
use colored::*;
use serde_json::{json, Value};

use crate::engine::{required_bytes, Model};

fn header(text: &str) -> Cell {
    Cell::new(text).fg(comfy_table::Color::Cyan).add_attribute(Attribute::Bold)
}

/// Renders the artifact header, its layers and the arena plan.
///
/// # Arguments
///
/// * `model` - The decoded artifact
/// * `arena_size` - Configured arena capacity in bytes
pub fn render_model(model: &Model, arena_size: usize) -> String {
    let mut summary = Table::new();
    summary
        .set_header(vec![header("Property"), header("Value")])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    summary.add_row(vec![Cell::new("Schema version"), Cell::new(model.schema_version)]);
    summary.add_row(vec![
        Cell::new("Input"),
        Cell::new(format!("int8[{}] {}", model.input_len, model.input)),
    ]);
    summary.add_row(vec![
        Cell::new("Output"),
        Cell::new(format!("int8[{}] {}", model.output_len, model.output)),
    ]);
    let (lo, hi) = model.output.range();
    summary.add_row(vec![Cell::new("Output range"), Cell::new(format!("{} .. {}", lo, hi))]);
    summary.add_row(vec![Cell::new("Weight bytes"), Cell::new(model.weight_bytes())]);

    let mut layers = Table::new();
    layers
        .set_header(vec![
            header("#"),
            header("Kind"),
            header("In"),
            header("Out"),
            header("Activation"),
            header("Weight scale"),
            header("Output quantization"),
        ])
        .load_preset(comfy_table::presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    for (i, layer) in model.layers.iter().enumerate() {
        layers.add_row(vec![
            Cell::new(i).set_alignment(CellAlignment::Center),
            Cell::new("fully_connected").fg(comfy_table::Color::Green),
            Cell::new(layer.in_features).set_alignment(CellAlignment::Right),
            Cell::new(layer.out_features).set_alignment(CellAlignment::Right),
            Cell::new(layer.activation).fg(comfy_table::Color::Magenta),
            Cell::new(layer.weight_scale),
            Cell::new(layer.output),
        ]);
    }

    let required = required_bytes(&model.activation_lengths());
    let plan = if required <= arena_size {
        let text = format!("Arena plan: {} / {} bytes", required, arena_size);
        text.as_str().bright_green()
    } else {
        let text = format!("Arena plan: {} bytes needed, only {} configured", required, arena_size);
        text.as_str().red()
    };

    format!("{}\n{}\n{}", summary, layers, plan)
}

/// Machine-readable form of [`render_model`]
pub fn model_summary_json(model: &Model, arena_size: usize) -> Value {
    let required = required_bytes(&model.activation_lengths());
    json!({
        "model": model,
        "weight_bytes": model.weight_bytes(),
        "arena": {
            "required": required,
            "capacity": arena_size,
            "fits": required <= arena_size,
        },
    })
}
