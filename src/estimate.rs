use std::path::Path;

use crate::autofluorescence::AutofluorescenceSource;
use crate::controls::{check_tube, require_channels, Controls};
use crate::experiment::Experiment;
use crate::math::variance;
use crate::polyfit::polyfit;
use crate::sample::{EventTable, ReadMode, SampleReader};
use crate::spillover::SpilloverModel;
use crate::{Error, Result};

/// Estimate the spillover model from a set of single-color controls.
///
/// Each control tube is first checked against the detector voltages of `experiment`. Then, for
/// every control, the signal in each other channel is fitted as a straight line against the signal
/// in the control's own channel and the slope is recorded as the coefficient from the control's
/// channel into the other. The intercept is discarded: the model is purely multiplicative, which
/// holds once autofluorescence has been subtracted. Baselines from `autofluorescence` are
/// subtracted from every channel of every control before fitting.
///
/// The result holds `n * (n - 1)` coefficients for `n` controls.
///
/// # Errors
/// - [`Error::Configuration`] if fewer than two controls are given, a tube does not exist, or a
///   channel is not in the experiment
/// - [`Error::Validation`] if a tube's recorded voltages disagree with the experiment
/// - [`Error::DataFormat`] if a tube cannot be parsed
/// - [`Error::Numerical`] if a control's own channel has no variance to fit against
pub fn estimate<R: SampleReader + ?Sized>(
    experiment: &Experiment,
    controls: &Controls,
    reader: &R,
    autofluorescence: Option<&dyn AutofluorescenceSource>,
) -> Result<SpilloverModel> {
    controls.validate()?;
    let channels = controls.channels();
    require_channels(experiment, &channels)?;

    for (channel, tube) in controls.iter() {
        log::info!("checking settings of {} for {channel}", tube.display());
        check_tube(experiment, &channels, tube, reader)?;
    }

    let mut model = SpilloverModel::new();
    for (channel, tube) in controls.iter() {
        log::info!("fitting bleedthrough from {channel} using {}", tube.display());
        let data = load_control(experiment, &channels, tube, reader, autofluorescence)?;
        fit_control(&mut model, channel, &channels, tube, &data)?;
    }

    Ok(model)
}

/// Read a control tube and subtract any known autofluorescence from each of `channels`
fn load_control<R: SampleReader + ?Sized>(
    experiment: &Experiment,
    channels: &[&str],
    tube: &Path,
    reader: &R,
    autofluorescence: Option<&dyn AutofluorescenceSource>,
) -> Result<EventTable> {
    let (_, data) = reader.parse(tube, ReadMode::Full, experiment.channel_naming())?;
    let mut data = data.ok_or_else(|| Error::configuration("reader returned no events"))?;

    for &channel in channels {
        if data.column_index(channel).is_none() {
            return Err(Error::validation(channel, tube, "channel not recorded in tube"));
        }
        if let Some(baseline) = autofluorescence.and_then(|af| af.baseline(channel)) {
            data.offset_column(channel, baseline);
        }
    }
    Ok(data)
}

/// Fit the coefficients from `source` into every other channel, using the events of its control
fn fit_control(
    model: &mut SpilloverModel,
    source: &str,
    channels: &[&str],
    tube: &Path,
    data: &EventTable,
) -> Result<()> {
    // Sorted so the summation order is reproducible
    let data = data.sorted_by(source)?;
    let column = |name: &str| {
        data.column(name)
            .map(|view| view.to_vec())
            .ok_or_else(|| Error::validation(name, tube, "channel not recorded in tube"))
    };

    let x = column(source)?;
    if variance(&x) <= 0. {
        return Err(Error::numerical(format!(
            "{source} has no variance in its control {}, nothing to fit against",
            tube.display()
        )));
    }

    for &target in channels.iter().filter(|&&target| target != source) {
        let y = column(target)?;
        let fit = polyfit(&x, &y, 1).map_err(|e| match e {
            Error::Numerical(reason) => {
                Error::numerical(format!("fitting {source} -> {target}: {reason}"))
            }
            other => other,
        })?;

        let coefficient = fit.slope();
        log::debug!(
            "{source} -> {target}: slope {coefficient:.6}, discarded intercept {:.3}, rss {:.3e}",
            fit.intercept(),
            fit.residual_sum_of_squares().unwrap_or(0.)
        );
        if coefficient < 0. {
            log::warn!(
                "negative bleedthrough {coefficient:.6} from {source} into {target}; \
                 check the controls and autofluorescence"
            );
        }
        model.insert(source, target, coefficient);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use ndarray::Array2;
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::{fit_control, load_control};
    use crate::autofluorescence::Baselines;
    use crate::experiment::Experiment;
    use crate::sample::{ChannelNaming, EventTable, ReadMode, SampleMetadata, SampleReader};
    use crate::spillover::SpilloverModel;
    use crate::{Error, Result};

    /// Serves the same table for every path
    struct MemoryReader(EventTable);

    impl SampleReader for MemoryReader {
        fn parse(
            &self,
            _path: &Path,
            mode: ReadMode,
            _naming: ChannelNaming,
        ) -> Result<(SampleMetadata, Option<EventTable>)> {
            let data = (mode == ReadMode::Full).then(|| self.0.clone());
            Ok((SampleMetadata::default(), data))
        }
    }

    #[test]
    fn baselines_are_subtracted_from_controls() {
        let data = Array2::from_shape_vec((2, 2), vec![110., 25., 210., 35.]).unwrap();
        let reader = MemoryReader(EventTable::new(vec!["A".into(), "B".into()], data).unwrap());
        let baselines: Baselines = [("A".to_owned(), 10.), ("B".to_owned(), 5.)].into();

        let table = load_control(
            &Experiment::default(),
            &["A", "B"],
            Path::new("a.fcs"),
            &reader,
            Some(&baselines),
        )
        .unwrap();

        assert_eq!(table.column("A").unwrap().to_vec(), vec![100., 200.]);
        assert_eq!(table.column("B").unwrap().to_vec(), vec![20., 30.]);
    }

    struct UnreadableReader;

    impl SampleReader for UnreadableReader {
        fn parse(
            &self,
            path: &Path,
            _mode: ReadMode,
            _naming: ChannelNaming,
        ) -> Result<(SampleMetadata, Option<EventTable>)> {
            Err(Error::data_format(path, "checksum mismatch"))
        }
    }

    #[test]
    fn reader_errors_keep_their_source() {
        let result = load_control(
            &Experiment::default(),
            &["A", "B"],
            Path::new("a.fcs"),
            &UnreadableReader,
            None,
        );

        match result {
            Err(Error::DataFormat { path, source }) => {
                assert_eq!(path, Path::new("a.fcs"));
                assert_eq!(source.to_string(), "checksum mismatch");
            }
            other => panic!("expected a data format error, got {other:?}"),
        }
    }

    #[test]
    fn controls_must_record_every_channel() {
        let table = EventTable::new(vec!["A".into()], Array2::zeros((3, 1))).unwrap();
        let reader = MemoryReader(table);

        let result = load_control(
            &Experiment::default(),
            &["A", "B"],
            Path::new("a.fcs"),
            &reader,
            None,
        );

        assert!(matches!(result, Err(Error::Validation { channel, .. }) if channel == "B"));
    }

    #[test]
    fn slopes_are_recorded_for_every_other_channel() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_events = 200;
        let x = (0..num_events)
            .map(|_| rng.gen_range(0.0..1e4))
            .collect::<Vec<f64>>();
        let data = Array2::from_shape_fn((num_events, 3), |(ii, jj)| match jj {
            0 => x[ii],
            1 => 0.05 * x[ii] + 12.,
            _ => 0.3 * x[ii],
        });
        let table = EventTable::new(vec!["A".into(), "B".into(), "C".into()], data).unwrap();

        let mut model = SpilloverModel::new();
        fit_control(&mut model, "A", &["A", "B", "C"], Path::new("a.fcs"), &table).unwrap();

        assert_eq!(model.len(), 2);
        approx::assert_relative_eq!(model.get("A", "B").unwrap(), 0.05, max_relative = 1e-9);
        approx::assert_relative_eq!(model.get("A", "C").unwrap(), 0.3, max_relative = 1e-9);
        assert_eq!(model.get("A", "A"), None);
    }

    #[test]
    fn constant_source_channels_cannot_be_fitted() {
        let data = Array2::from_shape_fn((10, 2), |(ii, jj)| if jj == 0 { 7. } else { ii as f64 });
        let table = EventTable::new(vec!["A".into(), "B".into()], data).unwrap();

        let mut model = SpilloverModel::new();
        let result = fit_control(&mut model, "A", &["A", "B"], Path::new("a.fcs"), &table);

        assert!(matches!(result, Err(Error::Numerical(_))));
        assert!(model.is_empty());
    }
}
