use std::path::PathBuf;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(version = "1.0", about = "Apply or revert network reconfiguration batches on cluster nodes")]
pub struct Opts {
    #[arg(long, help = "Settings file, defaults to /var/lib/nw-reconfig/config/nw-reconfig-config.json")]
    pub config: Option<PathBuf>,
    #[arg(short, long)]
    pub verbosity: Option<String>,
    #[arg(long, help = "Also write daily rolling log files into this folder")]
    pub log_dir: Option<PathBuf>,
    #[arg(long, help = "Identifier of this request, backups are keyed by it. Defaults to a new uuid")]
    pub operation_id: Option<String>,
    #[command(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Subcommand, Debug)]
pub enum SubCommand {
    #[command(about = "Run a batch, reverting it when the payload carries a uuid")]
    Run(ExecuteCmd),
    #[command(about = "Apply a batch")]
    Apply(ExecuteCmd),
    #[command(about = "Revert a previously applied batch")]
    Revert(ExecuteCmd),
    #[command(about = "Validate a batch payload without touching any node")]
    Validate(PayloadArgs),
    #[command(about = "Print the consolidated per node work of a batch")]
    ShowWork(PayloadArgs),
}

impl SubCommand {
    pub fn name(&self) -> String {
        match &self {
            SubCommand::Run(_) => "run".into(),
            SubCommand::Apply(_) => "apply".into(),
            SubCommand::Revert(_) => "revert".into(),
            SubCommand::Validate(_) => "validate".into(),
            SubCommand::ShowWork(_) => "show work".into(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ExecuteCmd {
    #[command(flatten)]
    pub payload: PayloadArgs,
    #[arg(long, help = "Write the annotated payload to this file instead of stdout")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PayloadArgs {
    #[arg(long, help = "JSON batch payload")]
    pub payload: PathBuf,
}
