use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::controls::Controls;
use crate::sample::ChannelNaming;
use crate::Result;

/// Configuration of a bleedthrough estimation, read from a TOML file:
///
/// ```toml
/// channel_naming = "PnN"
///
/// [controls]
/// "FITC-A" = "controls/fitc.fcs"
/// "PE-A" = "controls/pe.fcs"
///
/// [autofluorescence]
/// blank = "controls/blank.fcs"
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Keyword used to name channels in every file
    #[serde(default)]
    pub channel_naming: ChannelNaming,
    /// Single-color control for each channel to correct
    pub controls: Controls,
    #[serde(default)]
    pub autofluorescence: Option<AutofluorescenceConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct AutofluorescenceConfig {
    /// Unstained control tube
    pub blank: PathBuf,
}

impl Config {
    /// Parse a configuration document. Paths are left as written.
    ///
    /// # Errors
    /// Returns [`crate::Error::TomlDe`] if the document is malformed.
    pub fn from_toml(document: &str) -> Result<Self> {
        Ok(toml::from_str(document)?)
    }

    /// Read a configuration file, resolving relative paths against the directory holding it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let document = fs::read_to_string(path)?;
        let config = Self::from_toml(&document)?;
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        log::debug!("read configuration from {}", path.display());
        Ok(config.relative_to(base))
    }

    #[must_use]
    fn relative_to(self, base: &Path) -> Self {
        Self {
            channel_naming: self.channel_naming,
            controls: self.controls.relative_to(base),
            autofluorescence: self.autofluorescence.map(|af| AutofluorescenceConfig {
                blank: base.join(af.blank),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempdir::TempDir;

    use super::Config;
    use crate::sample::ChannelNaming;

    #[test]
    fn channel_naming_defaults_to_pnn() {
        let config = Config::from_toml(
            r#"
            [controls]
            "FITC-A" = "fitc.fcs"
            "PE-A" = "pe.fcs"
            "#,
        )
        .unwrap();

        assert_eq!(config.channel_naming, ChannelNaming::PnN);
        assert_eq!(config.controls.len(), 2);
        assert!(config.autofluorescence.is_none());
    }

    #[test]
    fn paths_resolve_against_the_configuration_file() {
        let dir = TempDir::new("paths_resolve_against_the_configuration_file").unwrap();
        let path = dir.path().join("bleedthrough.toml");
        std::fs::write(
            &path,
            r#"
            channel_naming = "PnS"

            [controls]
            "GFP" = "controls/gfp.fcs"
            "mCherry" = "/abs/mcherry.fcs"

            [autofluorescence]
            blank = "controls/blank.fcs"
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.channel_naming, ChannelNaming::PnS);
        assert_eq!(
            config.controls.get("GFP"),
            Some(dir.path().join("controls/gfp.fcs").as_path())
        );
        assert_eq!(
            config.controls.get("mCherry"),
            Some(Path::new("/abs/mcherry.fcs"))
        );
        assert_eq!(
            config.autofluorescence.unwrap().blank,
            dir.path().join("controls/blank.fcs")
        );
    }
}
