use itertools::izip;
use multiversion::multiversion;

/// `out = a - b`
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn subtract_out(a: &[f64], b: &[f64], out: &mut [f64]) {
    let n = a.len();
    assert!(b.len() == n);
    assert!(out.len() == n);

    izip!(a, b, out).for_each(|(a, b, out)| *out = a - b);
}

/// Returns `sum(diff^2 / var)` and `sum(ln(var))`.
///
/// The caller has to make sure that all variances are positive.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+sse4.1", "aarch64+neon"))]
pub(crate) fn weighted_sum_sq_logdet(diff: &[f64], var: &[f64]) -> (f64, f64) {
    assert!(diff.len() == var.len());

    diff.iter()
        .zip(var)
        .fold((0f64, 0f64), |(quad, logdet), (&d, &v)| {
            (quad + d * d / v, logdet + v.ln())
        })
}
