//! Small dense linear algebra used by the decomposition and coding stages.
//!
//! Everything here operates on matrices whose dimensions are bounded by the
//! spectral band count or the atom count (tens, not thousands), so simple
//! dense algorithms in f64 are both fast enough and robust.

use crate::float_trait::FuseFloat;
use ndarray::{Array1, Array2, ArrayView2};

/// Maximum sweeps for the cyclic Jacobi eigensolver.
const JACOBI_MAX_SWEEPS: usize = 50;

/// Off-diagonal magnitude at which Jacobi stops rotating.
const JACOBI_TOL: f64 = 1e-12;

/// Eigendecomposition of a small symmetric matrix via cyclic Jacobi rotations.
///
/// Returns `(eigenvalues, eigenvectors)` with eigenvalues sorted descending
/// and eigenvectors as the corresponding columns.
pub fn symmetric_eigen(matrix: ArrayView2<f64>) -> (Array1<f64>, Array2<f64>) {
    let n = matrix.nrows();
    debug_assert_eq!(n, matrix.ncols());

    let mut a = matrix.to_owned();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..JACOBI_MAX_SWEEPS {
        let mut off = 0.0;
        for p in 0..n {
            for q in (p + 1)..n {
                off += a[[p, q]].abs();
            }
        }
        if off < JACOBI_TOL {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[[p, q]];
                if apq.abs() < JACOBI_TOL {
                    continue;
                }
                let app = a[[p, p]];
                let aqq = a[[q, q]];
                let theta = 0.5 * (aqq - app) / apq;
                let t = theta.signum() / (theta.abs() + (1.0 + theta * theta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    // Sort eigenpairs by descending eigenvalue
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| a[[j, j]].total_cmp(&a[[i, i]]));

    let eigvals = Array1::from_iter(order.iter().map(|&i| a[[i, i]]));
    let mut eigvecs = Array2::<f64>::zeros((n, n));
    for (dst, &src) in order.iter().enumerate() {
        for k in 0..n {
            eigvecs[[k, dst]] = v[[k, src]];
        }
    }

    (eigvals, eigvecs)
}

/// Symmetric decorrelation: `W <- (W W^T)^{-1/2} W`.
///
/// Keeps the rows of `w` jointly orthonormal without privileging any single
/// row, which is what the parallel FastICA update requires.
pub fn symmetric_decorrelation(w: &mut Array2<f64>) {
    let n = w.nrows();
    let wwt = w.dot(&w.t());
    let (vals, vecs) = symmetric_eigen(wwt.view());

    // (W W^T)^{-1/2} = E diag(1/sqrt(lambda)) E^T
    let mut inv_sqrt = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        let lam = vals[i].max(1e-12);
        let scale = 1.0 / lam.sqrt();
        for r in 0..n {
            for c in 0..n {
                inv_sqrt[[r, c]] += vecs[[r, i]] * scale * vecs[[c, i]];
            }
        }
    }

    *w = inv_sqrt.dot(w);
}

/// Largest singular value of `matrix` by power iteration.
///
/// Same scheme as a rank-1 SVD: alternate `u = A v`, `v = A^T u` with
/// normalization; the norm of the un-normalized `v` converges to sigma_1.
pub fn spectral_norm<F: FuseFloat>(matrix: ArrayView2<F>, max_iter: usize) -> F {
    let (rows, cols) = matrix.dim();
    if rows == 0 || cols == 0 {
        return F::zero();
    }

    let mut v = Array1::from_elem(cols, F::from_f64_c(1.0 / (cols as f64).sqrt()));
    let mut s = F::zero();
    let tiny = F::from_f64_c(1e-12);

    for _ in 0..max_iter {
        let mut u = matrix.dot(&v);
        let u_norm = u.dot(&u).sqrt();
        if u_norm < tiny {
            return F::zero();
        }
        u.mapv_inplace(|x| x / u_norm);

        v = matrix.t().dot(&u);
        let v_norm = v.dot(&v).sqrt();
        s = v_norm;
        if v_norm < tiny {
            return F::zero();
        }
        v.mapv_inplace(|x| x / v_norm);
    }

    s
}

/// Solve a small dense system `A x = b` in place via Gaussian elimination
/// with partial pivoting. Returns `None` if the matrix is singular.
pub fn solve_small(a: &mut Array2<f64>, b: &mut Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    debug_assert_eq!(n, a.ncols());
    debug_assert_eq!(n, b.len());

    for col in 0..n {
        // Pivot
        let mut pivot_row = col;
        let mut pivot_val = a[[col, col]].abs();
        for r in (col + 1)..n {
            if a[[r, col]].abs() > pivot_val {
                pivot_val = a[[r, col]].abs();
                pivot_row = r;
            }
        }
        if pivot_val < 1e-12 {
            return None;
        }
        if pivot_row != col {
            for c in 0..n {
                let tmp = a[[col, c]];
                a[[col, c]] = a[[pivot_row, c]];
                a[[pivot_row, c]] = tmp;
            }
            b.swap(col, pivot_row);
        }

        for r in (col + 1)..n {
            let factor = a[[r, col]] / a[[col, col]];
            for c in col..n {
                let val = a[[col, c]];
                a[[r, c]] -= factor * val;
            }
            let bv = b[col];
            b[r] -= factor * bv;
        }
    }

    let mut x = Array1::<f64>::zeros(n);
    for r in (0..n).rev() {
        let mut sum = b[r];
        for c in (r + 1)..n {
            sum -= a[[r, c]] * x[c];
        }
        x[r] = sum / a[[r, r]];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn approx_eq(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn test_symmetric_eigen_diagonal() {
        let m = array![[3.0, 0.0], [0.0, 1.0]];
        let (vals, _) = symmetric_eigen(m.view());
        assert!(approx_eq(vals[0], 3.0, 1e-10));
        assert!(approx_eq(vals[1], 1.0, 1e-10));
    }

    #[test]
    fn test_symmetric_eigen_reconstruction() {
        let m = array![[2.0, 1.0, 0.0], [1.0, 3.0, 1.0], [0.0, 1.0, 2.0]];
        let (vals, vecs) = symmetric_eigen(m.view());

        // A = E diag(lambda) E^T
        let mut rec = Array2::<f64>::zeros((3, 3));
        for i in 0..3 {
            for r in 0..3 {
                for c in 0..3 {
                    rec[[r, c]] += vecs[[r, i]] * vals[i] * vecs[[c, i]];
                }
            }
        }
        for (a, b) in m.iter().zip(rec.iter()) {
            assert!(approx_eq(*a, *b, 1e-8), "reconstruction mismatch");
        }
    }

    #[test]
    fn test_spectral_norm_identity() {
        let m = Array2::<f64>::eye(4);
        let s = spectral_norm(m.view(), 50);
        assert!(approx_eq(s, 1.0, 1e-8));
    }

    #[test]
    fn test_spectral_norm_zero() {
        let m = Array2::<f64>::zeros((3, 5));
        let s = spectral_norm(m.view(), 50);
        assert_eq!(s, 0.0);
    }

    #[test]
    fn test_spectral_norm_scaled() {
        let mut m = Array2::<f64>::eye(3);
        m[[0, 0]] = 5.0;
        let s = spectral_norm(m.view(), 100);
        assert!(approx_eq(s, 5.0, 1e-6));
    }

    #[test]
    fn test_solve_small() {
        let mut a = array![[4.0, 1.0], [1.0, 3.0]];
        let mut b = array![1.0, 2.0];
        let x = solve_small(&mut a, &mut b).expect("solvable");

        // Verify against the original system
        let a0 = array![[4.0, 1.0], [1.0, 3.0]];
        let r = a0.dot(&x);
        assert!(approx_eq(r[0], 1.0, 1e-10));
        assert!(approx_eq(r[1], 2.0, 1e-10));
    }

    #[test]
    fn test_solve_singular() {
        let mut a = array![[1.0, 2.0], [2.0, 4.0]];
        let mut b = array![1.0, 2.0];
        assert!(solve_small(&mut a, &mut b).is_none());
    }

    #[test]
    fn test_symmetric_decorrelation_orthonormal_rows() {
        let mut w = array![[1.0, 0.5, 0.0], [0.2, 1.0, 0.3], [0.0, 0.4, 1.0]];
        symmetric_decorrelation(&mut w);
        let wwt = w.dot(&w.t());
        for r in 0..3 {
            for c in 0..3 {
                let expected = if r == c { 1.0 } else { 0.0 };
                assert!(approx_eq(wwt[[r, c]], expected, 1e-8));
            }
        }
    }
}
