use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::fcs::{self, FcsReader};
use crate::sample::{
    ChannelInfo, ChannelNaming, Event, EventTable, ReadMode, SampleMetadata, SampleReader,
};
use crate::{Error, Result};

/// Whether a column holds a fluorescence measurement or an experimental condition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnKind {
    Channel,
    Condition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnMetadata {
    pub kind: ColumnKind,
    /// Detector voltage the channel was recorded at
    pub voltage: Option<f64>,
    /// Median autofluorescence of the channel, if it has been measured
    pub af_median: Option<f64>,
}

impl ColumnMetadata {
    pub const fn channel(voltage: Option<f64>) -> Self {
        Self {
            kind: ColumnKind::Channel,
            voltage,
            af_median: None,
        }
    }

    pub const fn condition() -> Self {
        Self {
            kind: ColumnKind::Condition,
            voltage: None,
            af_median: None,
        }
    }
}

/// A dataset of events with per-column metadata.
///
/// Operations never mutate an experiment they are given; they return a modified clone.
#[derive(Clone, Debug, Default)]
pub struct Experiment {
    data: EventTable,
    metadata: BTreeMap<String, ColumnMetadata>,
    channel_naming: ChannelNaming,
}

impl Experiment {
    pub fn new(channel_naming: ChannelNaming) -> Self {
        Self {
            channel_naming,
            ..Self::default()
        }
    }

    /// Build an experiment from a parsed sample, every column becoming a channel.
    pub fn from_sample(
        metadata: &SampleMetadata,
        data: EventTable,
        channel_naming: ChannelNaming,
    ) -> Self {
        let metadata = data
            .columns()
            .iter()
            .map(|column| {
                let voltage = metadata.channel(column).and_then(|info| info.voltage);
                (column.clone(), ColumnMetadata::channel(voltage))
            })
            .collect();
        Self {
            data,
            metadata,
            channel_naming,
        }
    }

    /// Load an experiment from an FCS file
    ///
    /// # Errors
    /// Returns [`Error::DataFormat`] if the file cannot be parsed.
    pub fn from_fcs(path: &Path, channel_naming: ChannelNaming) -> Result<Self> {
        let (metadata, data) = FcsReader.parse(path, ReadMode::Full, channel_naming)?;
        let data = data.ok_or_else(|| Error::configuration("reader returned no events"))?;
        Ok(Self::from_sample(&metadata, data, channel_naming))
    }

    /// Add a fluorescence channel, or replace the values of an existing one.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `values` does not have one entry per event.
    pub fn add_channel(&mut self, name: &str, values: &[f64], voltage: Option<f64>) -> Result<()> {
        self.data.insert_column(name, values)?;
        self.metadata
            .insert(name.to_owned(), ColumnMetadata::channel(voltage));
        Ok(())
    }

    /// Add a condition column, such as an inducer concentration.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `values` does not have one entry per event.
    pub fn add_condition(&mut self, name: &str, values: &[f64]) -> Result<()> {
        self.data.insert_column(name, values)?;
        self.metadata
            .insert(name.to_owned(), ColumnMetadata::condition());
        Ok(())
    }

    pub const fn data(&self) -> &EventTable {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut EventTable {
        &mut self.data
    }

    pub fn metadata(&self, column: &str) -> Option<&ColumnMetadata> {
        self.metadata.get(column)
    }

    pub fn metadata_mut(&mut self, column: &str) -> Option<&mut ColumnMetadata> {
        self.metadata.get_mut(column)
    }

    pub const fn channel_naming(&self) -> ChannelNaming {
        self.channel_naming
    }

    /// Names of the columns which are fluorescence channels, in column order
    pub fn channels(&self) -> Vec<&str> {
        self.data
            .columns()
            .iter()
            .filter(|column| {
                self.metadata
                    .get(column.as_str())
                    .is_some_and(|meta| meta.kind == ColumnKind::Channel)
            })
            .map(String::as_str)
            .collect()
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Write every column as CSV, with the column names as the header row
    ///
    /// # Errors
    /// Returns [`Error::Csv`] if writing fails.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        wtr.write_record(self.data.columns())?;
        for row in self.data.data().outer_iter() {
            wtr.write_record(row.iter().map(f64::to_string))?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the channels to an FCS file, keeping the recorded voltages
    ///
    /// Condition columns have no FCS parameter to live in and are left out. Use
    /// [`Self::write_csv`] to keep them.
    ///
    /// # Errors
    /// Returns [`Error::DataFormat`] if the file cannot be written.
    pub fn write_fcs(&self, path: &Path) -> Result<()> {
        let names = self.channels();
        let table = EventTable::new(
            names.iter().map(|&name| name.to_owned()).collect(),
            self.data.select_columns(&names)?,
        )?;
        let channels = names
            .iter()
            .map(|&name| ChannelInfo {
                voltage: self.metadata.get(name).and_then(|meta| meta.voltage),
                ..ChannelInfo::new(name)
            })
            .collect::<Vec<_>>();
        fcs::write(path, &table, &channels).map_err(|e| Error::data_format(path, e))
    }

    /// A new experiment holding only the events for which `predicate` is true
    #[must_use]
    pub fn query(&self, predicate: impl Fn(&Event<'_>) -> bool) -> Self {
        let indices = self
            .data
            .events()
            .enumerate()
            .filter(|(_, event)| predicate(event))
            .map(|(idx, _)| idx)
            .collect::<Vec<_>>();
        Self {
            data: self.data.select_rows(&indices),
            metadata: self.metadata.clone(),
            channel_naming: self.channel_naming,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::{ColumnKind, Experiment};
    use crate::sample::ChannelNaming;

    fn experiment() -> Experiment {
        let mut experiment = Experiment::new(ChannelNaming::PnN);
        experiment
            .add_channel("FITC-A", &[10., 20., 30., 40.], Some(500.))
            .unwrap();
        experiment.add_condition("Dox", &[0., 0., 1., 1.]).unwrap();
        experiment
            .add_channel("PE-A", &[1., 2., 3., 4.], Some(450.))
            .unwrap();
        experiment
    }

    #[test]
    fn conditions_are_not_channels() {
        let experiment = experiment();
        assert_eq!(experiment.channels(), vec!["FITC-A", "PE-A"]);
        assert_eq!(
            experiment.metadata("Dox").map(|meta| meta.kind),
            Some(ColumnKind::Condition)
        );
    }

    #[test]
    fn queries_select_matching_events() {
        let experiment = experiment();
        let induced = experiment.query(|event| event.get("Dox") == Some(1.));

        assert_eq!(induced.len(), 2);
        assert_eq!(
            induced.data().column("FITC-A").unwrap().to_vec(),
            vec![30., 40.]
        );
        assert_eq!(experiment.len(), 4);
    }

    #[test]
    fn csv_exports_have_a_header_row() {
        let mut buffer = vec![];
        experiment().write_csv(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("FITC-A,Dox,PE-A"));
        assert_eq!(lines.next(), Some("10,0,1"));
        assert_eq!(text.lines().count(), 5);
    }

    #[test]
    fn fcs_exports_keep_channels_and_voltages() {
        let dir = TempDir::new("fcs_exports_keep_channels_and_voltages").unwrap();
        let path = dir.path().join("experiment.fcs");
        let experiment = experiment();

        experiment.write_fcs(&path).unwrap();
        let read_back = Experiment::from_fcs(&path, ChannelNaming::PnN).unwrap();

        assert_eq!(read_back.channels(), vec!["FITC-A", "PE-A"]);
        assert!(read_back.metadata("Dox").is_none());
        assert_eq!(read_back.metadata("FITC-A").unwrap().voltage, Some(500.));
        assert_eq!(read_back.metadata("PE-A").unwrap().voltage, Some(450.));
        assert_eq!(
            read_back.data().column("PE-A").unwrap().to_vec(),
            vec![1., 2., 3., 4.]
        );
        assert_eq!(read_back.len(), 4);
    }
}
