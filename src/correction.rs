use ndarray::Array2;
use ndarray_linalg::{Factorize, Inverse, ReciprocalConditionNum};

use crate::controls::require_channels;
use crate::experiment::Experiment;
use crate::spillover::SpilloverModel;
use crate::{Error, Result};

/// Inverse of the spillover matrix of `model`, with the channel order of its rows and columns.
///
/// Observed signals `y` relate to true signals `x` through `y = x S`, so the compensated signals
/// are `x = y S^-1`.
///
/// # Errors
/// Returns [`Error::Numerical`] if the spillover matrix is singular to working precision. No
/// pseudo-inverse is attempted, as a singular matrix points to misconfigured channels.
pub fn compensation_matrix(model: &SpilloverModel) -> Result<(Vec<String>, Array2<f64>)> {
    let (channels, spillover) = model.matrix();

    let lu = spillover
        .factorize()
        .map_err(|e| Error::numerical(format!("spillover matrix is singular: {e}")))?;
    let rcond = lu
        .rcond()
        .map_err(|e| Error::numerical(format!("condition number estimate failed: {e}")))?;
    if rcond.is_nan() || rcond < f64::EPSILON {
        return Err(Error::numerical(format!(
            "spillover matrix is singular to working precision (reciprocal condition {rcond:e})"
        )));
    }

    let inverse = lu
        .inv()
        .map_err(|e| Error::numerical(format!("spillover matrix is singular: {e}")))?;
    if inverse.iter().any(|v| !v.is_finite()) {
        return Err(Error::numerical("inverse spillover matrix is not finite"));
    }
    Ok((channels, inverse))
}

/// Remove bleedthrough from `experiment` using `model`.
///
/// Returns a new experiment in which the values of every channel named by the model are
/// compensated. Other channels and condition columns are copied unchanged, and `experiment` itself
/// is never modified.
///
/// # Errors
/// - [`Error::Configuration`] if the model is empty or invalid, or names a channel which is not a
///   fluorescence channel of `experiment`
/// - [`Error::Numerical`] if the spillover matrix cannot be inverted
pub fn apply(experiment: &Experiment, model: &SpilloverModel) -> Result<Experiment> {
    if model.is_empty() {
        return Err(Error::configuration(
            "spillover matrix isn't set, did you forget to estimate?",
        ));
    }
    model.validate()?;
    let channels = model.channels().into_iter().collect::<Vec<_>>();
    require_channels(experiment, &channels)?;

    let (channels, inverse) = compensation_matrix(model)?;
    log::info!(
        "compensating {} events across {} channels",
        experiment.len(),
        channels.len()
    );

    let observed = experiment.data().select_columns(&channels)?;
    let compensated = observed.dot(&inverse);

    let mut corrected = experiment.clone();
    corrected.data_mut().assign_columns(&channels, &compensated)?;
    Ok(corrected)
}
