use std::fmt;
use serde::Serialize;

/// Affine int8 quantization parameters: `real = (q - zero_point) * scale`
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: i32,
}

impl QuantParams {
    pub fn new(scale: f32, zero_point: i32) -> Self {
        Self { scale, zero_point }
    }

    /// Nearest quantized value, wrapped into i8 the way a C `(int8_t)` cast
    /// does. Inputs outside the representable range do not clamp.
    pub fn quantize(&self, real: f32) -> i8 {
        let q = (real / self.scale + self.zero_point as f32).round();
        // f32 -> i32 saturates, i32 -> i8 truncates to the low byte
        (q as i32) as i8
    }

    /// Nearest quantized value, clamped to the i8 range
    pub fn quantize_saturating(&self, real: f32) -> i8 {
        let q = (real / self.scale + self.zero_point as f32).round();
        q.clamp(i8::MIN as f32, i8::MAX as f32) as i8
    }

    pub fn dequantize(&self, q: i8) -> f32 {
        (i32::from(q) - self.zero_point) as f32 * self.scale
    }

    /// Real values exactly representable at the ends of the i8 range
    pub fn range(&self) -> (f32, f32) {
        (self.dequantize(i8::MIN), self.dequantize(i8::MAX))
    }

    pub fn is_valid(&self) -> bool {
        self.scale.is_finite() && self.scale > 0.0
    }
}

impl fmt::Display for QuantParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "scale={} zero_point={}", self.scale, self.zero_point)
    }
}

/// Maps raw command integers into the model's input domain and the model's
/// output back into a readable scalar. Parameters travel with the model
/// artifact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationAdapter {
    input: QuantParams,
    output: QuantParams,
}

impl QuantizationAdapter {
    pub fn new(input: QuantParams, output: QuantParams) -> Self {
        Self { input, output }
    }

    pub fn quantize(&self, raw: i32) -> i8 {
        self.input.quantize(raw as f32)
    }

    /// Element-wise, in order. `dst` must be at least as long as `raw`.
    pub fn quantize_into(&self, raw: &[i32], dst: &mut [i8]) {
        for (slot, &value) in dst.iter_mut().zip(raw) {
            *slot = self.quantize(value);
        }
    }

    pub fn dequantize(&self, q: i8) -> f32 {
        self.output.dequantize(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_input() -> QuantParams {
        QuantParams::new(6.0 / 255.0, -128)
    }

    fn sine_output() -> QuantParams {
        QuantParams::new(1.0 / 32.0, 0)
    }

    #[test]
    fn test_input_transform_matches_affine_formula() {
        let params = sine_input();
        for raw in 0..=6 {
            let expected = (raw as f32 * (255.0 / 6.0) - 128.0).round() as i32;
            let q = i32::from(params.quantize(raw as f32));
            // Odd inputs land on .5 and may round either way
            assert!((q - expected).abs() <= 1, "raw={} q={} expected={}", raw, q, expected);
        }
        assert_eq!(params.quantize(0.0), -128);
        assert_eq!(params.quantize(2.0), -43);
        assert_eq!(params.quantize(4.0), 42);
        assert_eq!(params.quantize(6.0), 127);
    }

    #[test]
    fn test_out_of_domain_wraps() {
        let params = sine_input();
        // 8 * 42.5 - 128 = 212 -> wraps to -44
        assert_eq!(params.quantize(8.0), -44);
        // -2 * 42.5 - 128 = -213 -> wraps to 43
        assert_eq!(params.quantize(-2.0), 43);
        assert_eq!(params.quantize_saturating(8.0), 127);
        assert_eq!(params.quantize_saturating(-2.0), -128);
    }

    #[test]
    fn test_output_scale() {
        let adapter = QuantizationAdapter::new(sine_input(), sine_output());
        assert_eq!(adapter.dequantize(32), 1.0);
        assert_eq!(adapter.dequantize(-16), -0.5);
        assert_eq!(adapter.dequantize(4), 0.125);
        assert_eq!(adapter.dequantize(0), 0.0);
    }

    #[test]
    fn test_round_trip_within_one_step() {
        let params = sine_input();
        for i in 0..=600 {
            let raw = i as f32 / 100.0;
            let back = params.dequantize(params.quantize(raw));
            assert!((back - raw).abs() <= params.scale, "raw={} back={}", raw, back);
        }
    }

    #[test]
    fn test_quantize_into_is_elementwise() {
        let adapter = QuantizationAdapter::new(sine_input(), sine_output());
        let mut dst = [0i8; 7];
        adapter.quantize_into(&[0, 1, 2, 3, 4, 5, 6], &mut dst);
        let expected: Vec<i8> = (0..=6).map(|r| adapter.quantize(r)).collect();
        assert_eq!(dst.to_vec(), expected);
        assert_eq!(dst[0], -128);
        assert_eq!(dst[6], 127);
    }

    #[test]
    fn test_range() {
        let (lo, hi) = sine_output().range();
        assert_eq!(lo, -4.0);
        assert_eq!(hi, 127.0 / 32.0);
    }
}
