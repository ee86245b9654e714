//! Incremental structured modelling of linear power system problems.
//!
//! Blocks generate their variables, constraints and objective lazily,
//! in that order. Physical data can be changed afterwards through the
//! subset and range setters, which patch the generated rows in place and
//! publish a [`modification::Modification`] record to the observers of
//! a [`modification::Notifier`].

pub mod block;
pub mod composite;
pub mod config;
pub mod constraint;
pub mod error;
pub mod function;
pub mod group;
mod log;
pub mod modification;
pub mod mps;
pub mod network;
pub mod output;
pub mod state;
pub mod topology;
pub mod unit;
pub mod utils;
pub mod variable;

pub use block::Block;
pub use composite::UcBlock;
pub use error::{ModelError, ModelResult};
pub use modification::{ChannelName, ModParam, Outcome};
pub use network::{DcNetworkBlock, NetworkBlock};
pub use topology::{DcNetworkData, LineType, NetworkData};
pub use unit::UnitBlock;

use std::path::Path;

/// Reads a unit commitment block from `input_args.path`, generates it
/// and writes the MPS model and the CSV summaries to the output
/// directory.
pub fn run(input_args: &InputArgs) -> ModelResult<()> {
    let group = group::read_group(&input_args.path)?;
    let mut block = UcBlock::deserialize(&group)?;
    if let Some(config_path) = &input_args.config {
        block.set_config(config::read_block_config(config_path)?);
    }
    block.generate_all()?;

    let out_dir = Path::new(&input_args.output);
    let path = |name: &str| out_dir.join(name).to_string_lossy().into_owned();
    mps::write_mps_file(&block, "uc", &path("model.mps"))?;
    output::write_constraint_summary(&block, &path("constraints.csv"))?;
    output::write_variable_values(&block, &path("variables.csv"))?;
    Ok(())
}

pub struct InputArgs {
    pub path: String,
    pub output: String,
    pub config: Option<String>,
}

impl InputArgs {
    pub fn build(args: &[String]) -> Result<Self, &'static str> {
        if args.len() < 3 {
            return Err("Not enough arguments [INPUT] [OUTPUT_DIR] (CONFIG)");
        }

        let path = args[1].clone();
        let output = args[2].clone();
        let config = args.get(3).cloned();

        Ok(Self {
            path,
            output,
            config,
        })
    }
}
