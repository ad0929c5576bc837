//! Autofluorescence baselines, measured from an unstained blank control.
use std::collections::BTreeMap;
use std::path::Path;

use crate::controls::{check_tube, require_channels};
use crate::experiment::Experiment;
use crate::math::median;
use crate::sample::{ReadMode, SampleReader};
use crate::{Error, Result};

/// Per-channel autofluorescence, keyed by channel name
pub type Baselines = BTreeMap<String, f64>;

/// Anything which can report the autofluorescence baseline of a channel
pub trait AutofluorescenceSource {
    fn baseline(&self, channel: &str) -> Option<f64>;
}

impl AutofluorescenceSource for Experiment {
    fn baseline(&self, channel: &str) -> Option<f64> {
        self.metadata(channel).and_then(|meta| meta.af_median)
    }
}

impl AutofluorescenceSource for Baselines {
    fn baseline(&self, channel: &str) -> Option<f64> {
        self.get(channel).copied()
    }
}

/// Measure the median autofluorescence of each of `channels` in the `blank` tube.
///
/// # Errors
/// - [`Error::Configuration`] if no channels are given, the tube does not exist or a channel is
///   not in the experiment
/// - [`Error::Validation`] if the tube's voltages do not match the experiment, or it recorded no
///   events
/// - [`Error::DataFormat`] if the tube cannot be parsed
pub fn estimate<R: SampleReader + ?Sized>(
    experiment: &Experiment,
    blank: &Path,
    channels: &[&str],
    reader: &R,
) -> Result<Baselines> {
    if channels.is_empty() {
        return Err(Error::configuration(
            "no channels given to estimate autofluorescence for",
        ));
    }
    if !blank.is_file() {
        return Err(Error::configuration(format!(
            "can't find blank control {}",
            blank.display()
        )));
    }
    require_channels(experiment, channels)?;
    check_tube(experiment, channels, blank, reader)?;

    let (_, table) = reader.parse(blank, ReadMode::Full, experiment.channel_naming())?;
    let table = table.ok_or_else(|| Error::configuration("reader returned no events"))?;

    let mut baselines = Baselines::new();
    for &channel in channels {
        let values = table
            .column(channel)
            .ok_or_else(|| Error::validation(channel, blank, "channel not recorded in tube"))?
            .to_vec();
        let af_median = median(&values)
            .ok_or_else(|| Error::validation(channel, blank, "blank control has no events"))?;
        log::info!("autofluorescence median for {channel} is {af_median}");
        baselines.insert(channel.to_owned(), af_median);
    }
    Ok(baselines)
}

/// Subtract `baselines` from an experiment, recording each in the channel's metadata.
///
/// # Errors
/// Returns [`Error::Configuration`] if a baseline names a channel the experiment does not have.
pub fn apply(experiment: &Experiment, baselines: &Baselines) -> Result<Experiment> {
    let channels = baselines.keys().map(String::as_str).collect::<Vec<_>>();
    require_channels(experiment, &channels)?;

    let mut corrected = experiment.clone();
    for (channel, &baseline) in baselines {
        corrected.data_mut().offset_column(channel, baseline);
        if let Some(meta) = corrected.metadata_mut(channel) {
            meta.af_median = Some(baseline);
        }
    }
    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::{apply, AutofluorescenceSource, Baselines};
    use crate::experiment::Experiment;
    use crate::sample::ChannelNaming;
    use crate::Error;

    #[test]
    fn baselines_are_subtracted_and_recorded() {
        let mut experiment = Experiment::new(ChannelNaming::PnN);
        experiment
            .add_channel("FITC-A", &[10., 20.], Some(500.))
            .unwrap();
        experiment
            .add_channel("PE-A", &[5., 6.], Some(500.))
            .unwrap();
        let baselines = Baselines::from([("FITC-A".to_owned(), 4.)]);

        let corrected = apply(&experiment, &baselines).unwrap();

        assert_eq!(
            corrected.data().column("FITC-A").unwrap().to_vec(),
            vec![6., 16.]
        );
        assert_eq!(corrected.data().column("PE-A").unwrap().to_vec(), vec![5., 6.]);
        assert_eq!(corrected.baseline("FITC-A"), Some(4.));
        assert_eq!(corrected.baseline("PE-A"), None);
        assert_eq!(experiment.baseline("FITC-A"), None);
    }

    #[test]
    fn baselines_for_unknown_channels_are_rejected() {
        let experiment = Experiment::new(ChannelNaming::PnN);
        let baselines = Baselines::from([("FITC-A".to_owned(), 4.)]);
        assert!(matches!(
            apply(&experiment, &baselines),
            Err(Error::Configuration(_))
        ));
    }
}
