use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::Parser;
use clap_complete::Shell;

use crate::common::config::CONFIG_ENV;
use crate::common::timeutils::ArgDuration;
use crate::store::records::ImageStatus;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to the TOML configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = CONFIG_ENV,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub config: Option<PathBuf>,

    /// Enables more detailed log output
    #[arg(
        long,
        env = "SPOTRUNNER_DEBUG",
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::SPOTRUNNER_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Commands for the webhook server
    Server(ServerOpts),
    /// Run the reconcilers
    Reconcile(ReconcileOpts),
    /// Display the system status
    Status,
    /// Machine profile management
    Profile(ProfileOpts),
    /// Image state management
    Image(ImageOpts),
    /// Generate shell completion script
    GenerateCompletion(GenerateCompletionOpts),
}

// Server CLI options

#[derive(Parser)]
pub struct ServerOpts {
    #[clap(subcommand)]
    pub subcmd: ServerCommand,
}

#[derive(Parser)]
pub enum ServerCommand {
    /// Start the webhook server
    Start(ServerStartOpts),
}

#[derive(Parser)]
pub struct ServerStartOpts {
    /// Address to listen on [default: from the configuration]
    #[arg(long)]
    pub listen: Option<String>,

    /// How often the reconcilers run inside the server [default: from the configuration]
    #[arg(long, conflicts_with("no_reconcile"))]
    pub reconcile_interval: Option<ArgDuration>,

    /// Do not run the reconcilers inside the server
    #[arg(long)]
    pub no_reconcile: bool,
}

// Reconcile CLI options

#[derive(Parser)]
pub struct ReconcileOpts {
    #[clap(subcommand)]
    pub subcmd: ReconcileCommand,
}

#[derive(Parser)]
pub enum ReconcileCommand {
    /// Reconcile job records with running instances
    Jobs(ReconcileJobsOpts),
    /// Resolve image records stuck in the `building` state
    Images,
}

#[derive(Parser)]
pub struct ReconcileJobsOpts {
    /// Keep running and reconcile with the given period instead of running once
    #[arg(long)]
    pub interval: Option<ArgDuration>,
}

// Profile CLI options

#[derive(Parser)]
pub struct ProfileOpts {
    #[clap(subcommand)]
    pub subcmd: ProfileCommand,
}

#[derive(Parser)]
pub enum ProfileCommand {
    /// Validate and store a profile document
    Deploy(ProfileDeployOpts),
    /// Display deployed profiles
    List,
}

#[derive(Parser)]
pub struct ProfileDeployOpts {
    /// Path to a JSON profile document
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub file: PathBuf,

    /// Name of the profile [default: the `name` field of the document or the file stem]
    #[arg(long)]
    pub name: Option<String>,
}

// Image CLI options

#[derive(Parser)]
pub struct ImageOpts {
    #[clap(subcommand)]
    pub subcmd: ImageCommand,
}

#[derive(Parser)]
pub enum ImageCommand {
    /// Record the outcome of an image build
    Record(ImageRecordOpts),
}

#[derive(Parser)]
pub struct ImageRecordOpts {
    /// Name of the profile
    pub profile: String,

    /// Build state
    #[arg(value_parser = parse_image_status)]
    pub status: ImageStatus,

    /// Built image, required for `ready`
    #[arg(long)]
    pub image_id: Option<String>,

    /// Identifier of the build
    #[arg(long)]
    pub build_id: Option<String>,

    /// Reason of a failed build
    #[arg(long)]
    pub error: Option<String>,

    /// When the build reached the state (RFC 3339) [default: now]
    #[arg(long)]
    pub timestamp: Option<DateTime<Utc>>,
}

fn parse_image_status(value: &str) -> anyhow::Result<ImageStatus> {
    Ok(value.parse()?)
}

#[derive(Parser)]
pub struct GenerateCompletionOpts {
    /// Shell flavour for which the completion script should be generated
    #[arg(value_enum)]
    pub shell: Shell,
}
