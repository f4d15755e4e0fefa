//! Serial-command harness around a quantized int8 model.
//!
//! A line of seven comma-separated integers arrives over a serial channel,
//! is quantized into the model's input tensor, run through an inference
//! engine, and the dequantized prediction is reported with timings.

pub mod config;
pub mod control;
pub mod display;
pub mod engine;
pub mod parser;
pub mod quant;
pub mod serial;
