//! Process entry arguments. `StageConfig` itself is loaded from the
//! environment (spec §6); the only flag this binary needs at the command
//! line is one to dump the resolved configuration before doing anything
//! with it.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "stage-server", about = "Runs one Stellar staged streaming-pipeline stage")]
pub struct Args {
    /// Print the resolved configuration and exit without starting the stage.
    #[arg(long, env = "STAGE_PRINT_CONFIG")]
    pub print_config: bool,
}
