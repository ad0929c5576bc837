//! Least squares polynomial fits
use ndarray::Array1;
use ndarray_linalg::{Lapack, LeastSquaresSvd, Scalar};

use crate::math::vandermonde;
use crate::{Error, Result};

/// Result of a least squares polynomial fit
#[derive(Clone, Debug)]
pub struct FitResult<E> {
    /// Polynomial coefficients in ascending order of power
    solution: Array1<E>,
    /// Sum of squared residuals, when the system is overdetermined
    residual_sum_of_squares: Option<E>,
}

impl<E: Scalar> FitResult<E> {
    pub const fn solution(&self) -> &Array1<E> {
        &self.solution
    }

    pub fn degree(&self) -> usize {
        self.solution.len() - 1
    }

    /// The zero order coefficient
    pub fn intercept(&self) -> E {
        self.solution[0]
    }

    /// The first order coefficient, zero for a constant fit
    pub fn slope(&self) -> E {
        self.solution.get(1).copied().unwrap_or_else(E::zero)
    }

    pub const fn residual_sum_of_squares(&self) -> Option<E> {
        self.residual_sum_of_squares
    }
}

/// Fit a polynomial of `degree` to the points (`x`, `y`) by ordinary least squares.
///
/// # Errors
/// - [`Error::Configuration`] if `x` and `y` differ in length
/// - [`Error::Numerical`] if there are too few points for the requested degree, or the design
///   matrix is rank deficient (for example when every `x` is identical)
pub fn polyfit<E: Lapack + Scalar<Real = E> + PartialOrd>(
    x: &[E],
    y: &[E],
    degree: usize,
) -> Result<FitResult<E>> {
    if x.len() != y.len() {
        return Err(Error::configuration(format!(
            "cannot fit {} abscissae against {} ordinates",
            x.len(),
            y.len()
        )));
    }
    if x.len() <= degree {
        return Err(Error::numerical(format!(
            "a degree {degree} fit needs at least {} points, got {}",
            degree + 1,
            x.len()
        )));
    }

    let design = vandermonde(x, degree);
    let rhs = Array1::from(y.to_vec());

    let fit = design
        .least_squares(&rhs)
        .map_err(|e| Error::numerical(format!("least squares solve failed: {e}")))?;

    if usize::try_from(fit.rank).map_or(true, |rank| rank <= degree) {
        return Err(Error::numerical(format!(
            "design matrix for a degree {degree} fit is rank deficient (rank {})",
            fit.rank
        )));
    }

    Ok(FitResult {
        solution: fit.solution,
        residual_sum_of_squares: fit.residual_sum_of_squares.map(|rss| rss.into_scalar()),
    })
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::polyfit;
    use crate::Error;

    #[test]
    fn straight_lines_are_recovered_exactly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let slope: f64 = rng.gen_range(-2.0..2.0);
        let intercept: f64 = rng.gen_range(-100.0..100.0);

        let x = (0..50).map(|_| rng.gen_range(0.0..1e4)).collect::<Vec<f64>>();
        let y = x.iter().map(|x| intercept + slope * x).collect::<Vec<_>>();

        let fit = polyfit(&x, &y, 1).unwrap();

        approx::assert_relative_eq!(fit.slope(), slope, max_relative = 1e-9);
        approx::assert_relative_eq!(fit.intercept(), intercept, max_relative = 1e-6);
        assert!(fit.residual_sum_of_squares().unwrap() < 1e-6);
    }

    #[test]
    fn higher_degree_polynomials_are_recovered() {
        let coeffs = [0.5, -1.5, 0.25];
        let x = (0..20).map(f64::from).collect::<Vec<_>>();
        let y = x
            .iter()
            .map(|x| coeffs[0] + coeffs[1] * x + coeffs[2] * x * x)
            .collect::<Vec<_>>();

        let fit = polyfit(&x, &y, 2).unwrap();

        assert_eq!(fit.degree(), 2);
        for (expected, calculated) in coeffs.iter().zip(fit.solution()) {
            approx::assert_relative_eq!(expected, calculated, max_relative = 1e-8);
        }
    }

    #[test]
    fn scattered_points_leave_residuals() {
        let x = [0., 1., 2., 3.];
        let y = [0., 3., 4., 7.];

        let fit = polyfit(&x, &y, 1).unwrap();

        approx::assert_relative_eq!(fit.slope(), 2.2, max_relative = 1e-9);
        approx::assert_relative_eq!(
            fit.residual_sum_of_squares().unwrap(),
            0.8,
            max_relative = 1e-9
        );
    }

    #[test]
    fn constant_abscissae_are_rank_deficient() {
        let x = [5.; 10];
        let y = (0..10).map(f64::from).collect::<Vec<_>>();

        assert!(matches!(polyfit(&x, &y, 1), Err(Error::Numerical(_))));
    }

    #[test]
    fn too_few_points_are_rejected() {
        assert!(matches!(polyfit(&[1.], &[1.], 1), Err(Error::Numerical(_))));
        assert!(matches!(
            polyfit(&[1., 2.], &[1.], 1),
            Err(Error::Configuration(_))
        ));
    }
}
