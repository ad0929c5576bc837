//! Single-color control tubes and their consistency with an experiment.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::experiment::{ColumnKind, Experiment};
use crate::sample::{ReadMode, SampleReader};
use crate::{Error, Result};

/// The control tube recorded for each channel to be corrected
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Controls(BTreeMap<String, PathBuf>);

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, channel: impl Into<String>, tube: impl Into<PathBuf>) -> Self {
        self.insert(channel, tube);
        self
    }

    pub fn insert(&mut self, channel: impl Into<String>, tube: impl Into<PathBuf>) {
        self.0.insert(channel.into(), tube.into());
    }

    pub fn get(&self, channel: &str) -> Option<&Path> {
        self.0.get(channel).map(PathBuf::as_path)
    }

    /// Channel names in sorted order
    pub fn channels(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.0
            .iter()
            .map(|(channel, tube)| (channel.as_str(), tube.as_path()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve relative tube paths against `base`
    #[must_use]
    pub fn relative_to(&self, base: &Path) -> Self {
        Self(
            self.0
                .iter()
                .map(|(channel, tube)| (channel.clone(), base.join(tube)))
                .collect(),
        )
    }

    /// Check there are enough channels to correct, and that every tube exists.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.len() < 2 {
            return Err(Error::configuration(
                "need at least two channels to correct bleedthrough",
            ));
        }
        for (channel, tube) in self.iter() {
            if !tube.is_file() {
                return Err(Error::configuration(format!(
                    "can't find file {} for channel {channel}",
                    tube.display()
                )));
            }
        }
        Ok(())
    }
}

impl<C: Into<String>, P: Into<PathBuf>> FromIterator<(C, P)> for Controls {
    fn from_iter<I: IntoIterator<Item = (C, P)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(channel, tube)| (channel.into(), tube.into()))
                .collect(),
        )
    }
}

/// Check every channel in `channels` is a fluorescence channel of `experiment`.
///
/// # Errors
/// Returns [`Error::Configuration`] naming the missing channels.
pub(crate) fn require_channels(experiment: &Experiment, channels: &[&str]) -> Result<()> {
    let missing = channels
        .iter()
        .filter(|channel| {
            experiment
                .metadata(channel)
                .map_or(true, |meta| meta.kind != ColumnKind::Channel)
        })
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "can't find channel(s) {} in experiment",
            missing.iter().join(", ")
        )))
    }
}

/// Check a tube was recorded with the same detector voltages as `experiment`.
///
/// Only the tube's metadata is read. A tube records every channel at once, so each of `channels`
/// is checked, not only the one the tube controls.
///
/// # Errors
/// - [`Error::DataFormat`] if the tube cannot be parsed
/// - [`Error::Validation`] if a channel is missing from the tube, has no recorded voltage in the
///   tube or the experiment, or the voltages differ
#[allow(clippy::float_cmp)]
pub(crate) fn check_tube<R: SampleReader + ?Sized>(
    experiment: &Experiment,
    channels: &[&str],
    tube: &Path,
    reader: &R,
) -> Result<()> {
    let (metadata, _) = reader.parse(tube, ReadMode::MetadataOnly, experiment.channel_naming())?;

    for &channel in channels {
        let info = metadata
            .channel(channel)
            .ok_or_else(|| Error::validation(channel, tube, "channel not recorded in tube"))?;
        let control_voltage = info
            .voltage
            .ok_or_else(|| Error::validation(channel, tube, "didn't find a voltage"))?;
        let experiment_voltage = experiment
            .metadata(channel)
            .and_then(|meta| meta.voltage)
            .ok_or_else(|| {
                Error::validation(channel, tube, "experiment has no voltage for this channel")
            })?;

        if control_voltage != experiment_voltage {
            return Err(Error::validation(
                channel,
                tube,
                format!(
                    "voltage {control_voltage} differs from experiment voltage {experiment_voltage}"
                ),
            ));
        }
    }
    Ok(())
}
