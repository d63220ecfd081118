use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::iter::{IndexedParallelIterator, ParallelIterator};
use rayon::slice::ParallelSliceMut;

/// Column-major matrix multiply capability
///
/// The index never multiplies matrices itself; it hands the work to an
/// implementation of this trait. The provided [`ReferenceGemm`] is a plain
/// loop nest, which is enough for moderate datasets; callers with a tuned
/// BLAS can plug it in through [`Builder::gemm`](crate::Builder::gemm).
pub trait Gemm: Send + Sync {
    /// Computes `C <- A^T * B` for column-major buffers
    ///
    /// `a` is `k x m`, `b` is `k x n` and `c` is `m x n`. Implementations
    /// may assume the slice lengths match those shapes exactly.
    fn transpose_multiply(&self, m: usize, n: usize, k: usize, a: &[f64], b: &[f64], c: &mut [f64]);
}

/// Straightforward `Gemm` implementation used when no external BLAS is wired in
#[derive(Clone, Copy, Debug, Default)]
pub struct ReferenceGemm;

impl Gemm for ReferenceGemm {
    fn transpose_multiply(&self, m: usize, n: usize, k: usize, a: &[f64], b: &[f64], c: &mut [f64]) {
        debug_assert_eq!(a.len(), k * m);
        debug_assert_eq!(b.len(), k * n);
        debug_assert_eq!(c.len(), m * n);

        c.par_chunks_mut(m).enumerate().for_each(|(col, out)| {
            let rhs = &b[col * k..(col + 1) * k];
            for (row, value) in out.iter_mut().enumerate() {
                let lhs = &a[row * k..(row + 1) * k];
                *value = lhs.iter().zip(rhs).map(|(x, y)| x * y).sum();
            }
        });
    }
}

/// Sample `num_directions` unit projection directions of dimension `dim`
///
/// Entries are drawn i.i.d. from the standard normal and every column is then
/// normalized to unit length, which makes the directions spherically
/// symmetric. Columns are not orthogonalized. The result is column-major,
/// `dim x num_directions`.
pub(crate) fn sample_projections(dim: usize, num_directions: usize, rng: &mut SmallRng) -> Vec<f64> {
    let mut proj = vec![0.0; dim * num_directions];
    for column in proj.chunks_exact_mut(dim) {
        for value in column.iter_mut() {
            *value = rng.sample(StandardNormal);
        }
        let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt();
        for value in column.iter_mut() {
            *value /= norm;
        }
    }
    proj
}

/// Euclidean distance between two points of the same dimension
pub(crate) fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
