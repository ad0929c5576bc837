#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
// #![warn(clippy::cargo)]

extern crate blas_src;

pub mod autofluorescence;
pub mod config;
pub mod controls;
pub mod correction;
mod error;
pub mod estimate;
pub mod experiment;
pub mod fcs;
pub mod math;
pub mod polyfit;
pub mod sample;
pub mod spillover;

pub use controls::Controls;
pub use correction::apply;
pub use error::Error;
pub use estimate::estimate;
pub use experiment::Experiment;
pub use spillover::SpilloverModel;

pub type Result<T> = ::std::result::Result<T, Error>;
