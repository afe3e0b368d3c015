use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::engine::ConsistencyModel;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Every node writes its own key, then reads the others' keys back.
    Demo(DemoArgs),
    /// Concurrent writers contend on a few shared keys.
    Contend(ContendArgs),
    /// Split the cluster mid-run and report which operations survive.
    Partition(PartitionArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Consistency model to run the cluster under.
    #[arg(long, value_enum, default_value = "ap")]
    pub model: ModelArg,

    /// Number of simulated nodes.
    #[arg(long, default_value_t = 5)]
    pub nodes: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ContendArgs {
    /// Consistency model to run the cluster under.
    #[arg(long, value_enum, default_value = "ap")]
    pub model: ModelArg,

    /// Number of simulated nodes.
    #[arg(long, default_value_t = 8)]
    pub nodes: usize,

    /// Number of shared keys the writers fight over.
    #[arg(long, default_value_t = 3)]
    pub keys: usize,

    /// Write rounds per node.
    #[arg(long, default_value_t = 10)]
    pub rounds: usize,
}

#[derive(Args, Debug, Clone)]
pub struct PartitionArgs {
    /// Consistency model to run the cluster under.
    #[arg(long, value_enum, default_value = "cp")]
    pub model: ModelArg,

    /// Number of simulated nodes; a minority of them gets cut off mid-run.
    #[arg(long, default_value_t = 6)]
    pub nodes: usize,
}

/// CLI spelling of the consistency models.
#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ModelArg {
    Ap,
    Cp,
    Ca,
}

impl From<ModelArg> for ConsistencyModel {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Ap => ConsistencyModel::Ap,
            ModelArg::Cp => ConsistencyModel::Cp,
            ModelArg::Ca => ConsistencyModel::Ca,
        }
    }
}
