//! State store CLI commands

use clap::Subcommand;

#[derive(Subcommand)]
pub enum StoreCommands {
    /// List flow instances
    Instances {
        /// Only instances of this resource
        #[arg(short, long)]
        resource: Option<u64>,

        /// Only instances with this status (running, finished, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Store file (default: from configuration)
        #[arg(long)]
        store: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the transition log of one flow
    Transitions {
        /// Flow ID (UUID)
        flow_id: String,

        /// Store file (default: from configuration)
        #[arg(long)]
        store: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// List event chains and their progress
    Chains {
        /// Only chains that have not finished draining
        #[arg(short, long)]
        incomplete: bool,

        /// Store file (default: from configuration)
        #[arg(long)]
        store: Option<String>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}
