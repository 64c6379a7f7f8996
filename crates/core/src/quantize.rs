//! Integer weight quantisation primitives: group scales, rounding, packing.
//!
//! Symmetric min-max scheme, one scale per `group_size` consecutive input
//! columns of each output row:
//!
//! ```text
//! scale = max(|min(w, 0)|, |max(w, 0)|) / ((2^bits − 1) / 2)
//! q     = clamp(round_half_even(w / scale), −2^(bits−1), 2^(bits−1) − 1)
//! ```
//!
//! Scales are rounded through f16 so the values used during GPTQ are the
//! ones that end up on disk.

use anyhow::{bail, Result};
use half::f16;

use squeeze_common::QuantRecipe;

/// Smallest scale kept for an all-zero group.
const MIN_SCALE: f32 = f32::EPSILON;

/// Quantisation arguments for one weight tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantArgs {
    pub num_bits: u32,
    pub group_size: usize,
    pub symmetric: bool,
}

impl QuantArgs {
    pub fn new(num_bits: u32, group_size: usize) -> Result<Self> {
        if !(2..=8).contains(&num_bits) || 32 % num_bits != 0 {
            bail!("{num_bits}-bit weights cannot be packed into int32 words");
        }
        if group_size == 0 {
            bail!("group_size must be positive");
        }
        Ok(Self {
            num_bits,
            group_size,
            symmetric: true,
        })
    }

    pub fn from_recipe(recipe: &QuantRecipe) -> Result<Self> {
        let scheme = recipe.quant_scheme()?;
        Self::new(scheme.weight_bits, recipe.group_size)
    }

    /// Lowest code, e.g. −8 for 4 bits.
    #[inline]
    pub fn qmin(&self) -> i32 {
        -(1 << (self.num_bits - 1))
    }

    /// Highest code, e.g. 7 for 4 bits.
    #[inline]
    pub fn qmax(&self) -> i32 {
        (1 << (self.num_bits - 1)) - 1
    }

    /// Codes per packed `i32`.
    #[inline]
    pub fn pack_factor(&self) -> usize {
        (32 / self.num_bits) as usize
    }

    pub fn num_groups(&self, columns: usize) -> usize {
        columns.div_ceil(self.group_size)
    }

    /// Symmetric min-max scale for one group of weights.
    pub fn group_scale(&self, values: &[f32]) -> f32 {
        let (lo, hi) = values
            .iter()
            .fold((0.0f32, 0.0f32), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let max_abs = lo.abs().max(hi.abs());
        let bit_range = (self.qmax() - self.qmin()) as f32;
        let scale = (max_abs / (bit_range / 2.0)).max(MIN_SCALE);
        f16::from_f32(scale).to_f32().max(MIN_SCALE)
    }

    /// Quantise one value with a given scale.
    #[inline]
    pub fn quantize(&self, value: f32, scale: f32) -> i8 {
        (value / scale)
            .round_ties_even()
            .clamp(self.qmin() as f32, self.qmax() as f32) as i8
    }

    #[inline]
    pub fn dequantize(&self, code: i8, scale: f32) -> f32 {
        code as f32 * scale
    }
}

/// Pack signed codes (row-major `rows × cols`) into `i32` words.
///
/// Codes are offset by `−qmin` to unsigned, then `pack_factor` of them share
/// a word, code `i` of a word at bits `num_bits · i`. Each row is padded to
/// a whole number of words.
pub fn pack_codes(codes: &[i8], rows: usize, cols: usize, args: &QuantArgs) -> Result<Vec<i32>> {
    if codes.len() != rows * cols {
        bail!("expected {} codes, got {}", rows * cols, codes.len());
    }
    let factor = args.pack_factor();
    let words_per_row = cols.div_ceil(factor);
    let mask = (1u32 << args.num_bits) - 1;
    let offset = -args.qmin();
    let mut packed = vec![0i32; rows * words_per_row];
    for r in 0..rows {
        let row = &codes[r * cols..(r + 1) * cols];
        let out = &mut packed[r * words_per_row..(r + 1) * words_per_row];
        for (c, &code) in row.iter().enumerate() {
            let unsigned = ((code as i32 + offset) as u32) & mask;
            let shift = (c % factor) as u32 * args.num_bits;
            out[c / factor] = (out[c / factor] as u32 | (unsigned << shift)) as i32;
        }
    }
    Ok(packed)
}

/// Inverse of [`pack_codes`].
pub fn unpack_codes(packed: &[i32], rows: usize, cols: usize, args: &QuantArgs) -> Vec<i8> {
    let factor = args.pack_factor();
    let words_per_row = cols.div_ceil(factor);
    let mask = (1u32 << args.num_bits) - 1;
    let offset = -args.qmin();
    let mut codes = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            let word = packed[r * words_per_row + c / factor] as u32;
            let shift = (c % factor) as u32 * args.num_bits;
            codes.push((((word >> shift) & mask) as i32 - offset) as i8);
        }
    }
    codes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w4g16() -> QuantArgs {
        QuantArgs::new(4, 16).unwrap()
    }

    #[test]
    fn int4_range() {
        let a = w4g16();
        assert_eq!(a.qmin(), -8);
        assert_eq!(a.qmax(), 7);
        assert_eq!(a.pack_factor(), 8);
        assert_eq!(a.num_groups(64), 4);
        assert_eq!(a.num_groups(65), 5);
    }

    #[test]
    fn unpackable_widths_rejected() {
        assert!(QuantArgs::new(3, 16).is_err());
        assert!(QuantArgs::new(16, 16).is_err());
        assert!(QuantArgs::new(8, 16).is_ok());
        assert!(QuantArgs::new(4, 0).is_err());
    }

    #[test]
    fn symmetric_scale_uses_largest_magnitude() {
        let a = w4g16();
        // max |w| = 1.5 → scale = 1.5 / 7.5 = 0.2
        let s = a.group_scale(&[-1.5, 0.3, 1.0]);
        assert!((s - 0.2).abs() < 1e-3, "{s}");
        // Positive-only groups still include zero in the range.
        let s = a.group_scale(&[0.5, 0.75]);
        assert!((s - 0.1).abs() < 1e-3, "{s}");
    }

    #[test]
    fn zero_group_has_positive_scale() {
        let a = w4g16();
        let s = a.group_scale(&[0.0; 16]);
        assert!(s > 0.0);
        assert_eq!(a.quantize(0.0, s), 0);
    }

    #[test]
    fn quantize_clamps_and_rounds_half_even() {
        let a = w4g16();
        assert_eq!(a.quantize(100.0, 1.0), 7);
        assert_eq!(a.quantize(-100.0, 1.0), -8);
        assert_eq!(a.quantize(2.5, 1.0), 2);
        assert_eq!(a.quantize(3.5, 1.0), 4);
        assert_eq!(a.quantize(-0.4, 1.0), 0);
        assert_eq!(a.dequantize(-3, 0.5), -1.5);
    }

    #[test]
    fn pack_layout_matches_nibble_order() {
        let a = w4g16();
        // Codes −8..=7 map to nibbles 0..=15.
        let codes: Vec<i8> = vec![-8, -7, -6, -5, -4, -3, -2, -1];
        let packed = pack_codes(&codes, 1, 8, &a).unwrap();
        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0] as u32, 0x7654_3210);

        let codes: Vec<i8> = vec![0, 1, 2, 3, 4, 5, 6, 7];
        let packed = pack_codes(&codes, 1, 8, &a).unwrap();
        assert_eq!(packed[0] as u32, 0xFEDC_BA98);
    }

    #[test]
    fn pack_unpack_with_padding() {
        let a = w4g16();
        let codes: Vec<i8> = (0..2 * 10).map(|i| ((i % 16) as i8) - 8).collect();
        let packed = pack_codes(&codes, 2, 10, &a).unwrap();
        assert_eq!(packed.len(), 2 * 2);
        assert_eq!(unpack_codes(&packed, 2, 10, &a), codes);
    }

    #[test]
    fn pack_rejects_wrong_length() {
        assert!(pack_codes(&[0, 1, 2], 2, 2, &w4g16()).is_err());
    }
}
