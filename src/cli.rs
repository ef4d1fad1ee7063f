use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// More log output (-v info, -vv debug)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Embed every note that is not indexed yet
    Index {
        /// JSON array of notes ({id, title, content})
        #[clap(short, long)]
        notes: PathBuf,
    },

    /// Find notes similar to a query
    Search {
        query: String,

        /// JSON array of notes ({id, title, content})
        #[clap(short, long)]
        notes: PathBuf,

        /// Only score notes already in the index
        #[clap(short, long, default_value = "false")]
        precomputed: bool,

        /// Minimum similarity for precomputed search
        #[clap(short, long, requires = "precomputed")]
        threshold: Option<f32>,

        /// Result cap for on-demand search
        #[clap(short, long, default_value = "10")]
        max_results: usize,
    },

    /// Forget the vector of a note
    Remove { id: u64 },

    /// Check whether a note is indexed
    Has { id: u64 },

    /// Print cache and index statistics
    Stats {},

    /// Wipe the embedding cache and the note index
    Clear {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}
