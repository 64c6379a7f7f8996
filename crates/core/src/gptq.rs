//! GPTQ: Hessian-aware, error-compensating weight quantisation.
//!
//! For a linear layer `y = W x` with calibration inputs `X`, GPTQ quantises
//! the columns of `W` one at a time. After each column the rounding error is
//! spread over the not-yet-quantised columns through the upper Cholesky
//! factor of `H⁻¹`, `H = 2 XᵀX / n`:
//!
//! ```text
//! err      = (w[:, i] − q[:, i]) / Hinv[i, i]
//! w[:, j] -= err · Hinv[i, j]          for j > i
//! ```
//!
//! Updates inside a block of `block_size` columns are applied eagerly; the
//! accumulated block error is applied to the remaining columns once per
//! block. Rows are independent given `Hinv`, so they run in parallel.
//! Columns are visited in natural order (no activation reordering).

use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;

use squeeze_common::QuantRecipe;

use crate::linalg::gptq_inverse_hessian;
use crate::quantize::{pack_codes, QuantArgs};

// ── Hessian ─────────────────────────────────────────────────────────────────

/// Running estimate of `H = 2/n · Σ XᵀX` over calibration sequences.
pub struct HessianAccumulator {
    hessian: Tensor,
    columns: usize,
    nsamples: usize,
}

impl HessianAccumulator {
    pub fn new(columns: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            hessian: Tensor::zeros((columns, columns), DType::F32, device)?,
            columns,
            nsamples: 0,
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    /// Fold in one batch of layer inputs, shape `(b, t, k)` or `(t, k)`.
    ///
    /// Each of the `b` sequences counts as one sample.
    pub fn add_batch(&mut self, input: &Tensor) -> Result<()> {
        let batch = match input.rank() {
            2 => 1,
            3 => input.dim(0)?,
            r => bail!("layer input must be rank 2 or 3, got rank {r}"),
        };
        let k = input.dim(input.rank() - 1)?;
        if k != self.columns {
            bail!("layer input has {k} features, Hessian expects {}", self.columns);
        }
        let x = input
            .to_device(self.hessian.device())?
            .to_dtype(DType::F32)?
            .reshape(((), k))?;

        let previous = self.nsamples;
        self.nsamples += batch;
        let decay = previous as f64 / self.nsamples as f64;
        let x = x.affine((2.0 / self.nsamples as f64).sqrt(), 0.0)?;
        let xtx = x.t()?.matmul(&x)?;
        self.hessian = (self.hessian.affine(decay, 0.0)? + xtx)?;
        Ok(())
    }

    /// Copy the Hessian to host memory as row-major `f64`.
    pub fn to_host(&self) -> Result<Vec<f64>> {
        let flat: Vec<f32> = self
            .hessian
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1()?;
        Ok(flat.into_iter().map(f64::from).collect())
    }
}

// ── Result ──────────────────────────────────────────────────────────────────

/// A quantised weight matrix: integer codes plus one scale per row group.
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    pub rows: usize,
    pub cols: usize,
    pub args: QuantArgs,
    /// Row-major `rows × cols`.
    pub codes: Vec<i8>,
    /// Row-major `rows × num_groups`.
    pub scales: Vec<f32>,
    /// Σ (w − q)² / Hinv[i,i]² / 2 over all entries.
    pub loss: f64,
}

impl QuantizedLinear {
    pub fn num_groups(&self) -> usize {
        self.args.num_groups(self.cols)
    }

    /// Fake-quantised weights `q · scale`, row-major.
    pub fn dequantized(&self) -> Vec<f32> {
        let groups = self.num_groups();
        let g = self.args.group_size;
        let mut out = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                let scale = self.scales[r * groups + c / g];
                out.push(self.args.dequantize(self.codes[r * self.cols + c], scale));
            }
        }
        out
    }

    /// Dequantised weights as a `(rows, cols)` tensor.
    pub fn dequantized_tensor(&self, device: &Device, dtype: DType) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.dequantized(), (self.rows, self.cols), device)?.to_dtype(dtype)?)
    }

    /// Codes packed into `i32` words, `rows × ceil(cols / pack_factor)`.
    pub fn packed(&self) -> Result<Vec<i32>> {
        pack_codes(&self.codes, self.rows, self.cols, &self.args)
    }

    pub fn packed_cols(&self) -> usize {
        self.cols.div_ceil(self.args.pack_factor())
    }
}

// ── Quantizer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct GptqQuantizer {
    args: QuantArgs,
    block_size: usize,
    dampening_frac: f64,
}

impl GptqQuantizer {
    pub fn new(args: QuantArgs, block_size: usize, dampening_frac: f64) -> Result<Self> {
        if block_size == 0 || block_size % args.group_size != 0 {
            bail!(
                "block_size ({block_size}) must be a positive multiple of group_size ({})",
                args.group_size
            );
        }
        Ok(Self {
            args,
            block_size,
            dampening_frac,
        })
    }

    pub fn from_recipe(recipe: &QuantRecipe) -> Result<Self> {
        Self::new(
            QuantArgs::from_recipe(recipe)?,
            recipe.block_size,
            recipe.dampening_frac,
        )
    }

    pub fn args(&self) -> &QuantArgs {
        &self.args
    }

    /// Quantise a row-major `rows × cols` weight.
    ///
    /// Without a Hessian (no calibration samples reached the layer) this is
    /// plain round-to-nearest.
    pub fn quantize(
        &self,
        weight: &[f32],
        rows: usize,
        cols: usize,
        hessian: Option<&HessianAccumulator>,
    ) -> Result<QuantizedLinear> {
        if weight.len() != rows * cols {
            bail!("weight has {} values, expected {rows}×{cols}", weight.len());
        }
        let factor = match hessian {
            Some(h) if h.nsamples() > 0 => {
                if h.columns() != cols {
                    bail!("Hessian is {0}×{0}, weight has {cols} columns", h.columns());
                }
                let (hinv, dead) = gptq_inverse_hessian(h.to_host()?, cols, self.dampening_frac)?;
                Some((hinv.into_iter().map(|v| v as f32).collect::<Vec<f32>>(), dead))
            }
            _ => None,
        };

        let groups = self.args.num_groups(cols);
        let mut codes = vec![0i8; rows * cols];
        let mut scales = vec![0f32; rows * groups];

        let loss: f64 = weight
            .par_chunks(cols)
            .zip(codes.par_chunks_mut(cols))
            .zip(scales.par_chunks_mut(groups))
            .map(|((w_row, code_row), scale_row)| {
                let mut w = w_row.to_vec();
                match &factor {
                    Some((hinv, dead)) => {
                        for (v, &is_dead) in w.iter_mut().zip(dead) {
                            if is_dead {
                                *v = 0.0;
                            }
                        }
                        self.quantize_row(&mut w, Some(hinv), code_row, scale_row)
                    }
                    None => self.quantize_row(&mut w, None, code_row, scale_row),
                }
            })
            .sum();

        Ok(QuantizedLinear {
            rows,
            cols,
            args: self.args,
            codes,
            scales,
            loss,
        })
    }

    /// GPTQ over one output row; returns the row's loss.
    fn quantize_row(
        &self,
        w: &mut [f32],
        hinv: Option<&Vec<f32>>,
        codes: &mut [i8],
        scales: &mut [f32],
    ) -> f64 {
        let n = w.len();
        let g = self.args.group_size;
        let mut loss = 0.0f64;
        let mut scale = 1.0f32;
        let mut block_err = vec![0f32; self.block_size];

        for b1 in (0..n).step_by(self.block_size) {
            let b2 = (b1 + self.block_size).min(n);
            for i in b1..b2 {
                if i % g == 0 {
                    scale = self.args.group_scale(&w[i..(i + g).min(n)]);
                    scales[i / g] = scale;
                }
                let q = self.args.quantize(w[i], scale);
                codes[i] = q;
                let deq = self.args.dequantize(q, scale);
                let Some(hinv) = hinv else {
                    let e = (w[i] - deq) as f64;
                    loss += e * e / 2.0;
                    continue;
                };
                let row = &hinv[i * n..(i + 1) * n];
                let d = row[i];
                let err = (w[i] - deq) / d;
                loss += (err as f64) * (err as f64) / 2.0;
                for j in i + 1..b2 {
                    w[j] -= err * row[j];
                }
                block_err[i - b1] = err;
            }

            if let Some(hinv) = hinv {
                for (offset, &err) in block_err[..b2 - b1].iter().enumerate() {
                    if err == 0.0 {
                        continue;
                    }
                    let row = &hinv[(b1 + offset) * n..(b1 + offset + 1) * n];
                    for j in b2..n {
                        w[j] -= err * row[j];
                    }
                }
            }
        }
        loss
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantizer() -> GptqQuantizer {
        GptqQuantizer::new(QuantArgs::new(4, 8).unwrap(), 16, 0.01).unwrap()
    }

    /// Deterministic pseudo-random values in [-1, 1).
    fn lcg(seed: u64, n: usize) -> Vec<f32> {
        let mut s = seed;
        (0..n)
            .map(|_| {
                s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((s >> 33) as f32 / (1u64 << 31) as f32) * 2.0 - 1.0
            })
            .collect()
    }

    /// Correlated inputs: each feature mixes a few shared latent factors.
    fn correlated_inputs(tokens: usize, k: usize) -> Vec<f32> {
        let latent = lcg(7, tokens * 4);
        let mix = lcg(11, 4 * k);
        let noise = lcg(13, tokens * k);
        let mut x = vec![0f32; tokens * k];
        for t in 0..tokens {
            for c in 0..k {
                let mut v = 0.1 * noise[t * k + c];
                for l in 0..4 {
                    v += latent[t * 4 + l] * mix[l * k + c];
                }
                x[t * k + c] = v;
            }
        }
        x
    }

    fn output_error(w: &[f32], q: &[f32], x: &[f32], rows: usize, k: usize) -> f64 {
        let tokens = x.len() / k;
        let mut total = 0.0f64;
        for t in 0..tokens {
            for r in 0..rows {
                let mut d = 0.0f64;
                for c in 0..k {
                    d += ((w[r * k + c] - q[r * k + c]) * x[t * k + c]) as f64;
                }
                total += d * d;
            }
        }
        total
    }

    #[test]
    fn hessian_running_average() {
        let dev = Device::Cpu;
        let mut h = HessianAccumulator::new(2, &dev).unwrap();
        let a = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &dev).unwrap();
        let b = Tensor::new(&[[[2f32, 2.0]]], &dev).unwrap();
        h.add_batch(&a).unwrap();
        h.add_batch(&b).unwrap();
        assert_eq!(h.nsamples(), 2);
        // H = 2/2 · (AᵀA + BᵀB) = [[1+4, 4], [4, 1+4]]
        let host = h.to_host().unwrap();
        let expect = [5.0, 4.0, 4.0, 5.0];
        for (got, want) in host.iter().zip(expect) {
            assert!((got - want).abs() < 1e-5, "{got} vs {want}");
        }
    }

    #[test]
    fn hessian_rejects_wrong_width() {
        let dev = Device::Cpu;
        let mut h = HessianAccumulator::new(3, &dev).unwrap();
        let x = Tensor::zeros((4, 2), DType::F32, &dev).unwrap();
        assert!(h.add_batch(&x).is_err());
    }

    #[test]
    fn round_to_nearest_without_hessian() {
        let q = quantizer();
        let w = lcg(3, 4 * 16);
        let out = q.quantize(&w, 4, 16, None).unwrap();
        assert_eq!(out.scales.len(), 4 * 2);
        for r in 0..4 {
            for c in 0..16 {
                let s = out.scales[r * 2 + c / 8];
                assert_eq!(out.codes[r * 16 + c], q.args().quantize(w[r * 16 + c], s));
            }
        }
    }

    #[test]
    fn gptq_beats_round_to_nearest_on_correlated_inputs() {
        let dev = Device::Cpu;
        let (rows, k, tokens) = (8, 32, 256);
        let w = lcg(5, rows * k);
        let x = correlated_inputs(tokens, k);

        let mut h = HessianAccumulator::new(k, &dev).unwrap();
        for chunk in x.chunks(16 * k) {
            let t = Tensor::from_vec(chunk.to_vec(), (1, chunk.len() / k, k), &dev).unwrap();
            h.add_batch(&t).unwrap();
        }

        let q = quantizer();
        let rtn = q.quantize(&w, rows, k, None).unwrap().dequantized();
        let gptq = q.quantize(&w, rows, k, Some(&h)).unwrap();
        assert!(gptq.loss.is_finite());
        let gptq = gptq.dequantized();

        let e_rtn = output_error(&w, &rtn, &x, rows, k);
        let e_gptq = output_error(&w, &gptq, &x, rows, k);
        assert!(e_gptq < e_rtn, "gptq {e_gptq} should beat rtn {e_rtn}");
    }

    #[test]
    fn dead_inputs_quantize_to_zero() {
        let dev = Device::Cpu;
        let k = 16;
        let mut data = lcg(17, 8 * k);
        for t in 0..8 {
            data[t * k + 3] = 0.0;
        }
        let mut h = HessianAccumulator::new(k, &dev).unwrap();
        h.add_batch(&Tensor::from_vec(data, (8, k), &dev).unwrap())
            .unwrap();
        let w = vec![0.5f32; 2 * k];
        let out = quantizer().quantize(&w, 2, k, Some(&h)).unwrap();
        assert_eq!(out.codes[3], 0);
        assert_eq!(out.codes[k + 3], 0);
    }

    #[test]
    fn codes_stay_in_range_and_pack() {
        let q = quantizer();
        let w = lcg(19, 3 * 24);
        let out = q.quantize(&w, 3, 24, None).unwrap();
        assert!(out.codes.iter().all(|&c| (-8..=7).contains(&c)));
        assert_eq!(out.packed().unwrap().len(), 3 * out.packed_cols());
        assert_eq!(out.packed_cols(), 3);
    }

    #[test]
    fn block_must_align_with_groups() {
        assert!(GptqQuantizer::new(QuantArgs::new(4, 16).unwrap(), 24, 0.01).is_err());
        assert!(GptqQuantizer::new(QuantArgs::new(4, 16).unwrap(), 128, 0.01).is_ok());
    }
}
