//! The spillover model: pairwise linear bleedthrough coefficients between channels.
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use itertools::Itertools;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Fraction of the signal in `source` which is observed in `target`.
///
/// The model is not symmetric: `(A, B)` and `(B, A)` are distinct entries.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpilloverModel {
    coefficients: BTreeMap<(String, String), f64>,
}

/// One row of the persisted form of a [`SpilloverModel`]
#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    from_channel: String,
    to_channel: String,
    coefficient: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    spillover: Vec<Entry>,
}

impl SpilloverModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the coefficient for `source` into `target`, replacing any previous value.
    pub fn insert(&mut self, source: &str, target: &str, coefficient: f64) {
        self.coefficients
            .insert((source.to_owned(), target.to_owned()), coefficient);
    }

    #[must_use]
    pub fn with(mut self, source: &str, target: &str, coefficient: f64) -> Self {
        self.insert(source, target, coefficient);
        self
    }

    pub fn get(&self, source: &str, target: &str) -> Option<f64> {
        self.coefficients
            .get(&(source.to_owned(), target.to_owned()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.coefficients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Iterate over `(source, target, coefficient)` in sorted order of the pair
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.coefficients
            .iter()
            .map(|((source, target), &coefficient)| (source.as_str(), target.as_str(), coefficient))
    }

    /// Every channel named by a coefficient, sorted
    pub fn channels(&self) -> BTreeSet<&str> {
        self.coefficients
            .keys()
            .flat_map(|(source, target)| [source.as_str(), target.as_str()])
            .collect()
    }

    /// Check the model's structural invariants.
    ///
    /// Every coefficient must be finite, no channel may spill into itself, and whenever `(A, B)`
    /// is present `(B, A)` must be present too.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] listing every violation found.
    pub fn validate(&self) -> Result<()> {
        let mut problems = vec![];
        for (source, target, coefficient) in self.iter() {
            if source == target {
                problems.push(format!("channel {source} spills into itself"));
            }
            if !coefficient.is_finite() {
                problems.push(format!(
                    "coefficient from {source} to {target} is {coefficient}"
                ));
            }
            if self.get(target, source).is_none() {
                problems.push(format!(
                    "{source} -> {target} is present but {target} -> {source} is not"
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "invalid spillover matrix: {}",
                problems.join("; ")
            )))
        }
    }

    /// The spillover matrix over the model's channels.
    ///
    /// Rows and columns follow the returned channel order. The diagonal is one and `S[i][j]` is the
    /// coefficient from channel `i` into channel `j`, zero where the model has no entry.
    pub fn matrix(&self) -> (Vec<String>, Array2<f64>) {
        let channels = self
            .channels()
            .into_iter()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        let matrix = Array2::from_shape_fn((channels.len(), channels.len()), |(ii, jj)| {
            if ii == jj {
                1.
            } else {
                self.get(&channels[ii], &channels[jj]).unwrap_or(0.)
            }
        });
        (channels, matrix)
    }

    fn entries(&self) -> Vec<Entry> {
        self.iter()
            .map(|(source, target, coefficient)| Entry {
                from_channel: source.to_owned(),
                to_channel: target.to_owned(),
                coefficient,
            })
            .collect()
    }

    fn from_entries(entries: impl IntoIterator<Item = Entry>) -> Result<Self> {
        let mut model = Self::new();
        for entry in entries {
            let duplicate = model
                .coefficients
                .insert((entry.from_channel, entry.to_channel), entry.coefficient)
                .is_some();
            if duplicate {
                return Err(Error::configuration(
                    "spillover table lists a channel pair more than once",
                ));
            }
        }
        Ok(model)
    }

    /// Write the model as a CSV table with a `from_channel,to_channel,coefficient` header
    ///
    /// # Errors
    /// Returns [`Error::Csv`] if writing fails.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        for entry in self.entries() {
            wtr.serialize(entry)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Read a model written by [`SpilloverModel::write_csv`]
    ///
    /// # Errors
    /// Returns [`Error::Csv`] for malformed rows and [`Error::Configuration`] for repeated pairs.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let entries = rdr.deserialize().collect::<std::result::Result<Vec<Entry>, _>>()?;
        Self::from_entries(entries)
    }

    /// Render the model as a TOML document of `[[spillover]]` entries
    ///
    /// # Errors
    /// Returns [`Error::TomlSer`] if serialisation fails.
    pub fn to_toml(&self) -> Result<String> {
        let document = Document {
            spillover: self.entries(),
        };
        Ok(toml::to_string(&document)?)
    }

    /// Parse a document produced by [`SpilloverModel::to_toml`]
    ///
    /// # Errors
    /// Returns [`Error::TomlDe`] for malformed documents and [`Error::Configuration`] for repeated
    /// pairs.
    pub fn from_toml(document: &str) -> Result<Self> {
        let document: Document = toml::from_str(document)?;
        Self::from_entries(document.spillover)
    }

    /// Save the model, as TOML if `path` has a `toml` extension and as CSV otherwise
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if is_toml(path) {
            fs::write(path, self.to_toml()?)?;
        } else {
            self.write_csv(BufWriter::new(File::create(path)?))?;
        }
        log::info!("saved {} spillover coefficients to {}", self.len(), path.display());
        Ok(())
    }

    /// Load a model saved by [`SpilloverModel::save`]
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        if is_toml(path) {
            Self::from_toml(&fs::read_to_string(path)?)
        } else {
            Self::read_csv(BufReader::new(File::open(path)?))
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

impl std::fmt::Display for SpilloverModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (channels, matrix) = self.matrix();
        writeln!(f, "from \\ to\t{}", channels.iter().join("\t"))?;
        for (channel, row) in channels.iter().zip(matrix.outer_iter()) {
            writeln!(f, "{channel}\t{}", row.iter().map(|v| format!("{v:.6}")).join("\t"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;
    use proptest::prelude::*;

    use super::SpilloverModel;
    use crate::Error;

    fn model() -> SpilloverModel {
        SpilloverModel::new()
            .with("FITC-A", "PE-A", 0.25)
            .with("PE-A", "FITC-A", 0.01)
            .with("PE-A", "APC-A", 0.1)
            .with("APC-A", "PE-A", 0.0)
    }

    #[test]
    fn matrices_have_unit_diagonal_and_directed_entries() {
        let (channels, matrix) = model().matrix();

        assert_eq!(channels, ["APC-A", "FITC-A", "PE-A"]);
        // Row is the source, column the target
        assert_eq!(matrix, arr2(&[[1., 0., 0.], [0., 1., 0.25], [0.1, 0.01, 1.]]));
    }

    #[test]
    fn pairs_without_their_reverse_are_invalid() {
        assert!(model().validate().is_ok());

        let model = model().with("FITC-A", "APC-A", 0.3);
        match model.validate() {
            Err(Error::Configuration(message)) => assert!(message.contains("APC-A -> FITC-A")),
            other => panic!("expected a configuration error, got {other:?}"),
        }
    }

    #[test]
    fn self_spillover_and_non_finite_coefficients_are_invalid() {
        let model = SpilloverModel::new().with("A", "A", 0.5);
        assert!(model.validate().is_err());
        let model = SpilloverModel::new()
            .with("A", "B", f64::NAN)
            .with("B", "A", 0.);
        assert!(model.validate().is_err());
    }

    #[test]
    fn csv_tables_with_repeated_pairs_are_rejected() {
        let table = "from_channel,to_channel,coefficient\nA,B,0.1\nA,B,0.2\n";
        assert!(matches!(
            SpilloverModel::read_csv(table.as_bytes()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn empty_toml_documents_give_empty_models() {
        assert!(SpilloverModel::from_toml("").unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn persisted_models_keep_every_bit(
            coefficients in proptest::collection::vec(-1e3f64..1e3, 6)
        ) {
            let channels = ["B1-A", "V1-A", "Y2-A"];
            let mut model = SpilloverModel::new();
            let pairs = channels
                .iter()
                .flat_map(|a| channels.iter().map(move |b| (a, b)))
                .filter(|(a, b)| a != b);
            for ((source, target), coefficient) in pairs.zip(&coefficients) {
                model.insert(source, target, *coefficient);
            }

            let mut buffer = vec![];
            model.write_csv(&mut buffer).unwrap();
            prop_assert_eq!(&SpilloverModel::read_csv(buffer.as_slice()).unwrap(), &model);

            let document = model.to_toml().unwrap();
            prop_assert_eq!(&SpilloverModel::from_toml(&document).unwrap(), &model);
        }
    }
}
