use crate::evaluate::EvaluateArgs;
use crate::train::TrainArgs;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about = "Resumable fine-tuning for sequence-pair classification", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Train a classifier, with optional periodic checkpointing
    Train(TrainArgs),

    /// Evaluate a saved checkpoint (accuracy / F1)
    Evaluate(EvaluateArgs),
}
