//! Eigen decompositions and transition-matrix construction.
//!
//! One decomposition (V, V⁻¹, λ) is stored per eigen slot. Exponentiation
//! runs in double precision regardless of the instance precision and the
//! finished matrix is converted on the final write.
//!
//! The real-eigenvalue path precomputes the rank-one cube
//! `cube[i][j][k] = V[i][k] * V⁻¹[k][j]` at store time, so each matrix
//! build is a single pass `P[i][j] = Σ_k cube[i][j][k] · exp(λ_k r t)`.
//! Complex conjugate pairs (flagged instances) go through the square
//! path: a block-diagonal factor with 2×2 rotation blocks multiplied out
//! against V⁻¹ and V.

use crate::buffers::{BufferLayout, BufferPool};
use crate::error::{EngineError, Result};
use crate::real::Real;
use rayon::prelude::*;

/// Which matrix a build pass produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatrixOrder {
    Probabilities,
    FirstDerivatives,
    SecondDerivatives,
}

#[derive(Debug)]
pub struct Decomposition {
    /// S×S eigenvectors, row-major. Conjugate pairs are stored as the
    /// real and imaginary column pair, as usual for a real Schur-style
    /// factorisation.
    vectors: Vec<f64>,
    /// S×S inverse eigenvectors, row-major.
    inverse: Vec<f64>,
    /// Real parts of the eigenvalues.
    values_re: Vec<f64>,
    /// Imaginary parts; all zero for a real decomposition. A non-zero
    /// entry at k marks the pair (k, k+1).
    values_im: Vec<f64>,
    /// `V[i][k] * V⁻¹[k][j]`, present only when every eigenvalue is real.
    cube: Vec<f64>,
}

#[derive(Debug)]
pub struct EigenStore {
    state_count: usize,
    complex_allowed: bool,
    slots: Vec<Option<Decomposition>>,
}

impl EigenStore {
    pub fn new(state_count: usize, eigen_count: usize, complex_allowed: bool) -> Self {
        EigenStore {
            state_count,
            complex_allowed,
            slots: (0..eigen_count).map(|_| None).collect(),
        }
    }

    /// Store a decomposition. `values` has length S for a real spectrum
    /// or 2S (real parts then imaginary parts) when the instance allows
    /// complex pairs.
    pub fn set(
        &mut self,
        index: usize,
        vectors: &[f64],
        inverse: &[f64],
        values: &[f64],
    ) -> Result<()> {
        let s = self.state_count;
        if index >= self.slots.len() {
            return Err(EngineError::OutOfRange {
                what: "eigen decomposition",
                index,
                count: self.slots.len(),
            });
        }
        if vectors.len() != s * s {
            return Err(EngineError::InvalidDimension {
                what: "eigenvectors",
                expected: s * s,
                got: vectors.len(),
            });
        }
        if inverse.len() != s * s {
            return Err(EngineError::InvalidDimension {
                what: "inverse eigenvectors",
                expected: s * s,
                got: inverse.len(),
            });
        }
        let (values_re, values_im) = match values.len() {
            n if n == s => (values.to_vec(), vec![0.0; s]),
            n if n == 2 * s && self.complex_allowed => {
                (values[..s].to_vec(), values[s..].to_vec())
            }
            _ => {
                return Err(EngineError::InvalidDimension {
                    what: "eigenvalues",
                    expected: if self.complex_allowed { 2 * s } else { s },
                    got: values.len(),
                })
            }
        };
        // a pair head must have a partner row
        let mut k = 0;
        while k < s {
            if values_im[k] != 0.0 {
                if k + 1 >= s {
                    return Err(EngineError::InvalidConfiguration(
                        "complex eigenvalue pair has no partner row",
                    ));
                }
                k += 2;
            } else {
                k += 1;
            }
        }

        let all_real = values_im.iter().all(|&b| b == 0.0);
        let cube = if all_real {
            let mut cube = vec![0.0; s * s * s];
            for i in 0..s {
                for j in 0..s {
                    let off = (i * s + j) * s;
                    for k in 0..s {
                        cube[off + k] = vectors[i * s + k] * inverse[k * s + j];
                    }
                }
            }
            cube
        } else {
            Vec::new()
        };

        self.slots[index] = Some(Decomposition {
            vectors: vectors.to_vec(),
            inverse: inverse.to_vec(),
            values_re,
            values_im,
            cube,
        });
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<&Decomposition> {
        if index >= self.slots.len() {
            return Err(EngineError::OutOfRange {
                what: "eigen decomposition",
                index,
                count: self.slots.len(),
            });
        }
        self.slots[index]
            .as_ref()
            .ok_or(EngineError::UninitialisedBuffer { index })
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }
}

impl Decomposition {
    /// Build one transition matrix (all categories) into `out`.
    fn fill<R: Real>(
        &self,
        layout: &BufferLayout,
        rates: &[f64],
        edge_length: f64,
        order: MatrixOrder,
        out: &mut [R],
    ) {
        let s = layout.state_count;
        let stride = layout.matrix_stride;
        let pad = match order {
            MatrixOrder::Probabilities => R::from_f64(1.0),
            _ => R::zero(),
        };
        let mut factors = vec![0.0f64; 2 * s];
        for (c, &rate) in rates.iter().enumerate().take(layout.category_count) {
            let distance = rate * edge_length;
            self.eigen_factors(rate, distance, order, &mut factors);
            let cat = c * layout.category_matrix_len();
            if !self.cube.is_empty() {
                // real spectrum: single contraction against the cube
                for i in 0..s {
                    let row = cat + i * stride;
                    for j in 0..s {
                        let coeffs = &self.cube[(i * s + j) * s..(i * s + j + 1) * s];
                        let mut sum = 0.0;
                        for k in 0..s {
                            sum += coeffs[k] * factors[2 * k];
                        }
                        if order == MatrixOrder::Probabilities && sum < 0.0 {
                            sum = 0.0;
                        }
                        out[row + j] = R::from_f64(sum);
                    }
                    out[row + s] = pad;
                }
            } else {
                self.fill_square(s, stride, cat, order, &factors, out);
            }
        }
    }

    /// Per-eigenvalue scalar factors: `(λ r)^d · exp(λ r t)` laid out as
    /// interleaved (re, im) pairs in `factors[2k], factors[2k+1]`.
    fn eigen_factors(&self, rate: f64, distance: f64, order: MatrixOrder, factors: &mut [f64]) {
        let s = self.values_re.len();
        let mut k = 0;
        while k < s {
            let a = self.values_re[k];
            let b = self.values_im[k];
            if b == 0.0 {
                let mut f = (a * distance).exp();
                match order {
                    MatrixOrder::Probabilities => {}
                    MatrixOrder::FirstDerivatives => f *= a * rate,
                    MatrixOrder::SecondDerivatives => f *= (a * rate) * (a * rate),
                }
                factors[2 * k] = f;
                factors[2 * k + 1] = 0.0;
                k += 1;
            } else {
                // w = exp((a + ib) d), then multiplied by (a + ib) r per
                // derivative order
                let e = (a * distance).exp();
                let theta = b * distance;
                let mut x = e * theta.cos();
                let mut y = e * theta.sin();
                let times = match order {
                    MatrixOrder::Probabilities => 0,
                    MatrixOrder::FirstDerivatives => 1,
                    MatrixOrder::SecondDerivatives => 2,
                };
                for _ in 0..times {
                    let nx = x * (a * rate) - y * (b * rate);
                    let ny = x * (b * rate) + y * (a * rate);
                    x = nx;
                    y = ny;
                }
                factors[2 * k] = x;
                factors[2 * k + 1] = y;
                // the partner row reuses the conjugate via the block form
                factors[2 * (k + 1)] = x;
                factors[2 * (k + 1) + 1] = -y;
                k += 2;
            }
        }
    }

    /// Square path: tmp = B·V⁻¹ with B block-diagonal, then out = V·tmp.
    fn fill_square<R: Real>(
        &self,
        s: usize,
        stride: usize,
        cat_offset: usize,
        order: MatrixOrder,
        factors: &[f64],
        out: &mut [R],
    ) {
        let mut tmp = vec![0.0f64; s * s];
        let mut k = 0;
        while k < s {
            if self.values_im[k] == 0.0 {
                let f = factors[2 * k];
                for j in 0..s {
                    tmp[k * s + j] = f * self.inverse[k * s + j];
                }
                k += 1;
            } else {
                let x = factors[2 * k];
                let y = factors[2 * k + 1];
                for j in 0..s {
                    let u = self.inverse[k * s + j];
                    let v = self.inverse[(k + 1) * s + j];
                    tmp[k * s + j] = x * u + y * v;
                    tmp[(k + 1) * s + j] = -y * u + x * v;
                }
                k += 2;
            }
        }
        let pad = match order {
            MatrixOrder::Probabilities => R::from_f64(1.0),
            _ => R::zero(),
        };
        for i in 0..s {
            let row = cat_offset + i * stride;
            for j in 0..s {
                let mut sum = 0.0;
                for m in 0..s {
                    sum += self.vectors[i * s + m] * tmp[m * s + j];
                }
                if order == MatrixOrder::Probabilities && sum < 0.0 {
                    sum = 0.0;
                }
                out[row + j] = R::from_f64(sum);
            }
            out[row + s] = pad;
        }
    }
}

/// One edge's worth of matrix builds.
struct EdgeJob<'a> {
    decomp: &'a Decomposition,
    rates: &'a [f64],
    edge_length: f64,
    prob: usize,
    first: Option<usize>,
    second: Option<usize>,
}

/// Exponentiate a batch of edges into the pool's matrix buffers.
///
/// `jobs` come from `update_transition_matrices` (shared eigen index and
/// rate vector) or its multi-model variant (per-edge selections). When
/// `parallel` and no two jobs share a target buffer, the batch fans out
/// on the rayon pool.
fn run_edge_jobs<R: Real>(
    pool: &mut BufferPool<R>,
    jobs: &[EdgeJob<'_>],
    parallel: bool,
) -> Result<()> {
    let layout = *pool.layout();
    for job in jobs {
        pool.matrix(job.prob)?;
        if let Some(i) = job.first {
            pool.matrix(i)?;
        }
        if let Some(i) = job.second {
            pool.matrix(i)?;
        }
    }

    let mut targets: Vec<usize> = jobs
        .iter()
        .flat_map(|j| {
            [Some(j.prob), j.first, j.second]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
        })
        .collect();
    targets.sort_unstable();
    let disjoint = targets.windows(2).all(|w| w[0] != w[1]);

    if parallel && disjoint && jobs.len() > 1 {
        struct MatrixTarget<R>(*mut R, usize);
        // SAFETY: each pointer addresses a whole matrix buffer and the
        // duplicate check above guarantees no two jobs share one.
        unsafe impl<R> Send for MatrixTarget<R> {}
        unsafe impl<R> Sync for MatrixTarget<R> {}

        let len = layout.matrix_len();
        let planned: Vec<(&EdgeJob<'_>, MatrixTarget<R>, Option<MatrixTarget<R>>, Option<MatrixTarget<R>>)> =
            jobs.iter()
                .map(|job| {
                    let prob = MatrixTarget(pool.matrix_base(job.prob).unwrap(), len);
                    let first = job
                        .first
                        .map(|i| MatrixTarget(pool.matrix_base(i).unwrap(), len));
                    let second = job
                        .second
                        .map(|i| MatrixTarget(pool.matrix_base(i).unwrap(), len));
                    (job, prob, first, second)
                })
                .collect();
        planned.par_iter().for_each(|(job, prob, first, second)| {
            // SAFETY: disjoint whole-buffer targets, see MatrixTarget.
            let out = unsafe { std::slice::from_raw_parts_mut(prob.0, prob.1) };
            job.decomp.fill(
                &layout,
                job.rates,
                job.edge_length,
                MatrixOrder::Probabilities,
                out,
            );
            if let Some(t) = first {
                let out = unsafe { std::slice::from_raw_parts_mut(t.0, t.1) };
                job.decomp.fill(
                    &layout,
                    job.rates,
                    job.edge_length,
                    MatrixOrder::FirstDerivatives,
                    out,
                );
            }
            if let Some(t) = second {
                let out = unsafe { std::slice::from_raw_parts_mut(t.0, t.1) };
                job.decomp.fill(
                    &layout,
                    job.rates,
                    job.edge_length,
                    MatrixOrder::SecondDerivatives,
                    out,
                );
            }
        });
        return Ok(());
    }

    for job in jobs {
        job.decomp.fill(
            &layout,
            job.rates,
            job.edge_length,
            MatrixOrder::Probabilities,
            pool.matrix_mut(job.prob)?,
        );
        if let Some(i) = job.first {
            job.decomp.fill(
                &layout,
                job.rates,
                job.edge_length,
                MatrixOrder::FirstDerivatives,
                pool.matrix_mut(i)?,
            );
        }
        if let Some(i) = job.second {
            job.decomp.fill(
                &layout,
                job.rates,
                job.edge_length,
                MatrixOrder::SecondDerivatives,
                pool.matrix_mut(i)?,
            );
        }
    }
    Ok(())
}

/// `update_transition_matrices`: one eigen index and rate vector for the
/// whole batch.
#[allow(clippy::too_many_arguments)]
pub fn update_transition_matrices<R: Real>(
    store: &EigenStore,
    pool: &mut BufferPool<R>,
    eigen_index: usize,
    rates: &[f64],
    probability_indices: &[usize],
    first_derivative_indices: Option<&[usize]>,
    second_derivative_indices: Option<&[usize]>,
    edge_lengths: &[f64],
    parallel: bool,
) -> Result<()> {
    let count = probability_indices.len();
    if edge_lengths.len() != count {
        return Err(EngineError::InvalidDimension {
            what: "edge lengths",
            expected: count,
            got: edge_lengths.len(),
        });
    }
    if let Some(d1) = first_derivative_indices {
        if d1.len() != count {
            return Err(EngineError::InvalidDimension {
                what: "first derivative indices",
                expected: count,
                got: d1.len(),
            });
        }
    }
    if let Some(d2) = second_derivative_indices {
        if d2.len() != count {
            return Err(EngineError::InvalidDimension {
                what: "second derivative indices",
                expected: count,
                got: d2.len(),
            });
        }
        if first_derivative_indices.is_none() {
            return Err(EngineError::InvalidConfiguration(
                "second derivatives require first derivatives",
            ));
        }
    }
    let decomp = store.get(eigen_index)?;
    let jobs: Vec<EdgeJob<'_>> = (0..count)
        .map(|i| EdgeJob {
            decomp,
            rates,
            edge_length: edge_lengths[i],
            prob: probability_indices[i],
            first: first_derivative_indices.map(|d| d[i]),
            second: second_derivative_indices.map(|d| d[i]),
        })
        .collect();
    run_edge_jobs(pool, &jobs, parallel)
}

/// Multi-model variant: each edge picks its own eigen slot and rate
/// vector.
#[allow(clippy::too_many_arguments)]
pub fn update_transition_matrices_multi<R: Real>(
    store: &EigenStore,
    pool: &mut BufferPool<R>,
    eigen_indices: &[usize],
    rate_vectors: &[&[f64]],
    probability_indices: &[usize],
    first_derivative_indices: Option<&[usize]>,
    second_derivative_indices: Option<&[usize]>,
    edge_lengths: &[f64],
    parallel: bool,
) -> Result<()> {
    let count = probability_indices.len();
    if eigen_indices.len() != count || rate_vectors.len() != count || edge_lengths.len() != count {
        return Err(EngineError::InvalidDimension {
            what: "multi-model update arrays",
            expected: count,
            got: eigen_indices.len().min(rate_vectors.len()).min(edge_lengths.len()),
        });
    }
    if second_derivative_indices.is_some() && first_derivative_indices.is_none() {
        return Err(EngineError::InvalidConfiguration(
            "second derivatives require first derivatives",
        ));
    }
    let mut jobs = Vec::with_capacity(count);
    for i in 0..count {
        jobs.push(EdgeJob {
            decomp: store.get(eigen_indices[i])?,
            rates: rate_vectors[i],
            edge_length: edge_lengths[i],
            prob: probability_indices[i],
            first: first_derivative_indices.map(|d| d[i]),
            second: second_derivative_indices.map(|d| d[i]),
        });
    }
    run_edge_jobs(pool, &jobs, parallel)
}

/// Category-wise matrix product `P_r = P_a · P_b` (epoch convolution).
/// Result indices may alias the operands; products are staged through a
/// scratch matrix.
pub fn convolve_transition_matrices<R: Real>(
    pool: &mut BufferPool<R>,
    first_indices: &[usize],
    second_indices: &[usize],
    result_indices: &[usize],
) -> Result<()> {
    let count = result_indices.len();
    if first_indices.len() != count || second_indices.len() != count {
        return Err(EngineError::InvalidDimension {
            what: "convolution index arrays",
            expected: count,
            got: first_indices.len().min(second_indices.len()),
        });
    }
    let layout = *pool.layout();
    let s = layout.state_count;
    let stride = layout.matrix_stride;
    let mut scratch = vec![R::zero(); layout.matrix_len()];
    for n in 0..count {
        {
            let a = pool.matrix(first_indices[n])?;
            let b = pool.matrix(second_indices[n])?;
            for c in 0..layout.category_count {
                let cat = c * layout.category_matrix_len();
                for i in 0..s {
                    for j in 0..s {
                        let mut sum = R::zero();
                        for m in 0..s {
                            sum = sum + a[cat + i * stride + m] * b[cat + m * stride + j];
                        }
                        scratch[cat + i * stride + j] = sum;
                    }
                    scratch[cat + i * stride + s] = R::from_f64(1.0);
                }
            }
        }
        pool.matrix_mut(result_indices[n])?.copy_from_slice(&scratch);
    }
    Ok(())
}

#[cfg(test)]
#[path = "eigen_test.rs"]
mod eigen_test;
