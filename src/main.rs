use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use bleedthrough::config::Config;
use bleedthrough::fcs::FcsReader;
use bleedthrough::sample::ChannelNaming;
use bleedthrough::{autofluorescence, Error, Experiment, Result, SpilloverModel};

#[derive(Parser)]
#[command(
    name = "bleedthrough",
    version,
    about = "Linear bleedthrough compensation for flow cytometry"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Estimate a spillover model from single-color controls
    Estimate {
        /// TOML file naming the control for each channel
        #[arg(short, long)]
        config: PathBuf,
        /// FCS file the controls must match
        #[arg(short, long)]
        experiment: PathBuf,
        /// Where to save the model (`.csv` or `.toml`)
        #[arg(short, long, default_value = "spillover.csv")]
        output: PathBuf,
    },
    /// Compensate an experiment with a previously estimated model
    Apply {
        /// Model saved by `estimate`
        #[arg(short, long)]
        model: PathBuf,
        /// FCS file to compensate
        #[arg(short, long)]
        experiment: PathBuf,
        /// Where to write the compensated events (`.fcs` or `.csv`)
        #[arg(short, long)]
        output: PathBuf,
        /// Configuration used for the estimate, for channel naming and autofluorescence
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print a saved model as a matrix
    Show {
        model: PathBuf,
    },
}

fn load_experiment(path: &Path, naming: ChannelNaming) -> Result<Experiment> {
    if !path.is_file() {
        return Err(Error::Configuration(format!(
            "can't find experiment {}",
            path.display()
        )));
    }
    let experiment = Experiment::from_fcs(path, naming)?;
    log::info!(
        "loaded {} events in {} channels from {}",
        experiment.len(),
        experiment.channels().len(),
        path.display()
    );
    Ok(experiment)
}

/// Subtract autofluorescence when the configuration names a blank control
fn remove_autofluorescence(experiment: Experiment, config: &Config) -> Result<Experiment> {
    let Some(af) = &config.autofluorescence else {
        return Ok(experiment);
    };
    let channels = config.controls.channels();
    let baselines = autofluorescence::estimate(&experiment, &af.blank, &channels, &FcsReader)?;
    autofluorescence::apply(&experiment, &baselines)
}

fn estimate(config: &Path, experiment: &Path, output: &Path) -> Result<()> {
    let config = Config::from_file(config)?;
    let experiment = load_experiment(experiment, config.channel_naming)?;
    let experiment = remove_autofluorescence(experiment, &config)?;

    let model = bleedthrough::estimate(
        &experiment,
        &config.controls,
        &FcsReader,
        Some(&experiment),
    )?;
    print!("{model}");
    model.save(output)
}

fn apply(model: &Path, experiment: &Path, output: &Path, config: Option<&Path>) -> Result<()> {
    let model = SpilloverModel::load(model)?;
    let config = config.map(Config::from_file).transpose()?;
    let naming = config
        .as_ref()
        .map_or_else(ChannelNaming::default, |config| config.channel_naming);

    let mut experiment = load_experiment(experiment, naming)?;
    if let Some(config) = &config {
        experiment = remove_autofluorescence(experiment, config)?;
    }

    let corrected = bleedthrough::apply(&experiment, &model)?;

    let is_csv = output
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if is_csv {
        corrected.write_csv(BufWriter::new(File::create(output)?))?;
    } else {
        corrected.write_fcs(output)?;
    }
    log::info!("wrote {} compensated events to {}", corrected.len(), output.display());
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Estimate {
            config,
            experiment,
            output,
        } => estimate(&config, &experiment, &output),
        Command::Apply {
            model,
            experiment,
            output,
            config,
        } => apply(&model, &experiment, &output, config.as_deref()),
        Command::Show { model } => {
            print!("{}", SpilloverModel::load(&model)?);
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
