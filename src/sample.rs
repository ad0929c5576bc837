//! Interfaces to the readers which turn sample files into event tables.
use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which keyword names a channel
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelNaming {
    /// The short name, `$PnN`. This is the name the instrument assigns to the detector.
    #[default]
    PnN,
    /// The long name, `$PnS`. Falls back to `$PnN` for parameters without one.
    PnS,
}

/// How much of a sample file to read
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    /// Only the header and keyword segments, no events are returned.
    MetadataOnly,
    Full,
}

/// Instrument settings recorded for one channel of a sample
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelInfo {
    /// Name of the channel under the requested [`ChannelNaming`]
    pub name: String,
    pub pnn: String,
    pub pns: Option<String>,
    /// Detector voltage, `$PnV`
    pub voltage: Option<f64>,
    /// Amplifier gain, `$PnG`
    pub gain: Option<f64>,
    /// Range, `$PnR`
    pub range: Option<f64>,
}

impl ChannelInfo {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            pnn: name.clone(),
            name,
            pns: None,
            voltage: None,
            gain: None,
            range: None,
        }
    }

    #[must_use]
    pub fn with_voltage(mut self, voltage: f64) -> Self {
        self.voltage = Some(voltage);
        self
    }
}

/// Metadata of a sample file.
#[derive(Clone, Debug, Default)]
pub struct SampleMetadata {
    /// Per-channel settings, in the order the channels are stored in the file
    pub channels: Vec<ChannelInfo>,
    /// Every keyword in the file, with upper case keys
    pub keywords: BTreeMap<String, String>,
}

impl SampleMetadata {
    pub fn channel(&self, name: &str) -> Option<&ChannelInfo> {
        self.channels.iter().find(|info| info.name == name)
    }
}

/// Something which can turn a sample file into instrument settings and events
pub trait SampleReader {
    /// Parse the file at `path`.
    ///
    /// When `mode` is [`ReadMode::MetadataOnly`] the returned table is `None`.
    ///
    /// # Errors
    /// Returns [`Error::DataFormat`] if the file cannot be read or is malformed.
    fn parse(
        &self,
        path: &Path,
        mode: ReadMode,
        naming: ChannelNaming,
    ) -> Result<(SampleMetadata, Option<EventTable>)>;
}

/// A row view into an [`EventTable`]
pub struct Event<'a> {
    columns: &'a [String],
    values: ArrayView1<'a, f64>,
}

impl Event<'_> {
    pub fn get(&self, column: &str) -> Option<f64> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|idx| self.values[idx])
    }
}

/// Tabular event data.
///
/// Rows are events and columns are named measurements.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventTable {
    columns: Vec<String>,
    data: Array2<f64>,
}

impl EventTable {
    /// # Errors
    /// Returns [`Error::Configuration`] if the number of names does not match the number of
    /// columns in `data`, or if a name is repeated.
    pub fn new(columns: Vec<String>, data: Array2<f64>) -> Result<Self> {
        if columns.len() != data.ncols() {
            return Err(Error::configuration(format!(
                "{} column names given for a table with {} columns",
                columns.len(),
                data.ncols()
            )));
        }
        for (ii, name) in columns.iter().enumerate() {
            if columns[..ii].contains(name) {
                return Err(Error::configuration(format!("duplicate column {name}")));
            }
        }
        Ok(Self { columns, data })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub const fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.data.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.column_index(name)
            .map(|idx| self.data.index_axis(Axis(1), idx))
    }

    pub fn events(&self) -> impl Iterator<Item = Event<'_>> {
        self.data.outer_iter().map(|values| Event {
            columns: &self.columns,
            values,
        })
    }

    /// Append a column, or replace an existing column of the same name.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if `values` does not have one entry per event.
    pub fn insert_column(&mut self, name: &str, values: &[f64]) -> Result<()> {
        if !self.columns.is_empty() && values.len() != self.len() {
            return Err(Error::configuration(format!(
                "column {name} has {} values but the table has {} events",
                values.len(),
                self.len()
            )));
        }

        if let Some(idx) = self.column_index(name) {
            self.data
                .index_axis_mut(Axis(1), idx)
                .assign(&ArrayView1::from(values));
            return Ok(());
        }

        if self.columns.is_empty() {
            self.data = Array1::from(values.to_vec())
                .into_shape((values.len(), 1))
                .map_err(|e| Error::configuration(e.to_string()))?;
        } else {
            self.data
                .push_column(ArrayView1::from(values))
                .map_err(|e| Error::configuration(e.to_string()))?;
        }
        self.columns.push(name.to_owned());
        Ok(())
    }

    /// Copy the named columns, in the order given, into an (events x columns) matrix.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] naming the first column which is not in the table.
    pub fn select_columns<S: AsRef<str>>(&self, names: &[S]) -> Result<Array2<f64>> {
        let indices = names
            .iter()
            .map(|name| {
                self.column_index(name.as_ref()).ok_or_else(|| {
                    Error::configuration(format!("can't find column {}", name.as_ref()))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.data.select(Axis(1), &indices))
    }

    /// Overwrite the named columns with the columns of `values`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if a column is missing or the shapes disagree.
    pub fn assign_columns<S: AsRef<str>>(
        &mut self,
        names: &[S],
        values: &Array2<f64>,
    ) -> Result<()> {
        if values.dim() != (self.len(), names.len()) {
            return Err(Error::configuration(format!(
                "cannot assign a {:?} block to {} columns of {} events",
                values.dim(),
                names.len(),
                self.len()
            )));
        }
        for (jj, name) in names.iter().enumerate() {
            let idx = self.column_index(name.as_ref()).ok_or_else(|| {
                Error::configuration(format!("can't find column {}", name.as_ref()))
            })?;
            self.data
                .index_axis_mut(Axis(1), idx)
                .assign(&values.index_axis(Axis(1), jj));
        }
        Ok(())
    }

    /// Subtract `offset` from every value in a column. Unknown columns are ignored.
    pub fn offset_column(&mut self, name: &str, offset: f64) {
        if let Some(idx) = self.column_index(name) {
            self.data
                .index_axis_mut(Axis(1), idx)
                .mapv_inplace(|value| value - offset);
        }
    }

    /// A new table holding the rows at `indices`, in that order.
    #[must_use]
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            data: self.data.select(Axis(0), indices),
        }
    }

    /// A new table with rows in ascending order of `column`.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if the column is not in the table.
    pub fn sorted_by(&self, column: &str) -> Result<Self> {
        let key = self
            .column(column)
            .ok_or_else(|| Error::configuration(format!("can't find column {column}")))?;
        let mut order = (0..self.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| key[a].total_cmp(&key[b]));
        Ok(self.select_rows(&order))
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;

    use super::EventTable;
    use crate::Error;

    fn table() -> EventTable {
        EventTable::new(
            vec!["A".into(), "B".into()],
            arr2(&[[3., 30.], [1., 10.], [2., 20.]]),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_column_names_are_rejected() {
        let result = EventTable::new(vec!["A".into(), "A".into()], arr2(&[[1., 2.]]));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn tables_sort_by_the_requested_column() {
        let sorted = table().sorted_by("A").unwrap();
        assert_eq!(sorted.column("A").unwrap().to_vec(), vec![1., 2., 3.]);
        assert_eq!(sorted.column("B").unwrap().to_vec(), vec![10., 20., 30.]);
    }

    #[test]
    fn columns_are_inserted_into_empty_tables() {
        let mut table = EventTable::default();
        table.insert_column("A", &[1., 2.]).unwrap();
        table.insert_column("B", &[3., 4.]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.select_columns(&["B", "A"]).unwrap(), arr2(&[[3., 1.], [4., 2.]]));
    }

    #[test]
    fn inserted_columns_must_match_the_event_count() {
        let mut table = table();
        assert!(table.insert_column("C", &[1.]).is_err());
    }

    #[test]
    fn events_expose_values_by_name() {
        let table = table();
        let b_values = table
            .events()
            .filter_map(|event| event.get("B"))
            .collect::<Vec<_>>();
        assert_eq!(b_values, vec![30., 10., 20.]);
    }
}
