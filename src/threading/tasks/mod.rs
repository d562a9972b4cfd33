//! Tasks shipped with the crate.

mod dae;
mod sample;

pub use dae::{DaeMonitor, DaeTask};
pub use sample::{SampleReport, SampleTask};
