//! Flow definition CLI commands

use clap::Subcommand;

#[derive(Subcommand)]
pub enum FlowCommands {
    /// List the registered flow definitions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Validate every flow definition and the selector ownership between them
    Validate {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the transition table of one flow definition
    Describe {
        /// Definition id (see `flowchain flows list`)
        definition: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}
