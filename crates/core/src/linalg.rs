//! Dense symmetric linear algebra on row-major `f64` matrices.
//!
//! Only what GPTQ needs: Cholesky factorisation, inverse from a Cholesky
//! factor, and the dampened upper factor of the inverse Hessian. Row updates
//! are parallelised with `rayon`.

use anyhow::{bail, Result};
use rayon::prelude::*;

/// In-place lower Cholesky factor: on return `a` holds `L` with `L Lᵀ = A`
/// (upper triangle zeroed).
pub fn cholesky_lower(a: &mut [f64], n: usize) -> Result<()> {
    assert_eq!(a.len(), n * n, "matrix must be n×n");
    for j in 0..n {
        let (head, tail) = a.split_at_mut((j + 1) * n);
        let row_j = &mut head[j * n..];
        let mut diag = row_j[j];
        for k in 0..j {
            diag -= row_j[k] * row_j[k];
        }
        if !(diag > 0.0) || !diag.is_finite() {
            bail!("matrix is not positive definite (pivot {j} = {diag:e})");
        }
        let d = diag.sqrt();
        row_j[j] = d;
        for v in row_j[j + 1..n].iter_mut() {
            *v = 0.0;
        }
        let row_j = &row_j[..n];
        tail.par_chunks_mut(n).for_each(|row_i| {
            let mut s = row_i[j];
            for k in 0..j {
                s -= row_i[k] * row_j[k];
            }
            row_i[j] = s / d;
        });
    }
    Ok(())
}

/// Inverse of `A = L Lᵀ` given its lower factor `l`.
pub fn cholesky_inverse(l: &[f64], n: usize) -> Vec<f64> {
    // Columns of L⁻¹ by forward substitution; column j is zero above j.
    let columns: Vec<Vec<f64>> = (0..n)
        .into_par_iter()
        .map(|j| {
            let mut x = vec![0.0f64; n];
            x[j] = 1.0 / l[j * n + j];
            for i in j + 1..n {
                let row = &l[i * n..i * n + i];
                let mut s = 0.0;
                for k in j..i {
                    s += row[k] * x[k];
                }
                x[i] = -s / l[i * n + i];
            }
            x
        })
        .collect();

    // A⁻¹[i][j] = Σ_k L⁻¹[k][i] · L⁻¹[k][j], k ≥ max(i, j).
    let mut inv = vec![0.0f64; n * n];
    inv.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let ci = &columns[i];
        for (j, out) in row.iter_mut().enumerate() {
            let cj = &columns[j];
            let start = i.max(j);
            let mut s = 0.0;
            for k in start..n {
                s += ci[k] * cj[k];
            }
            *out = s;
        }
    });
    inv
}

/// In-place upper Cholesky factor: on return `a` holds `U` with `Uᵀ U = A`.
pub fn cholesky_upper(a: &mut [f64], n: usize) -> Result<()> {
    cholesky_lower(a, n)?;
    transpose_in_place(a, n);
    Ok(())
}

fn transpose_in_place(a: &mut [f64], n: usize) {
    for i in 0..n {
        for j in i + 1..n {
            a.swap(i * n + j, j * n + i);
        }
    }
}

/// Inverse Hessian factor used by GPTQ.
///
/// Columns with a zero diagonal (inputs that never fired) are reported as
/// dead and get a unit diagonal. `damp_frac × mean(diag)` is added to the
/// diagonal before factorising. Returns the upper Cholesky factor of `H⁻¹`.
pub fn gptq_inverse_hessian(
    mut h: Vec<f64>,
    n: usize,
    damp_frac: f64,
) -> Result<(Vec<f64>, Vec<bool>)> {
    let mut dead = vec![false; n];
    for (i, d) in dead.iter_mut().enumerate() {
        if h[i * n + i] == 0.0 {
            *d = true;
            h[i * n + i] = 1.0;
        }
    }
    let mean_diag = (0..n).map(|i| h[i * n + i]).sum::<f64>() / n as f64;
    let damp = damp_frac * mean_diag;
    for i in 0..n {
        h[i * n + i] += damp;
    }

    if let Err(e) = cholesky_lower(&mut h, n) {
        bail!("{e}; the Hessian is singular, increase dampening_frac");
    }
    let mut hinv = cholesky_inverse(&h, n);
    drop(h);
    cholesky_upper(&mut hinv, n)?;
    Ok((hinv, dead))
}
