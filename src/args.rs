use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Run the full repack pipeline on the target table.
    New,
    /// Drop the retired table and the change log left by a finished repack.
    Clean,
}

// -h is the host flag, so the automatic help short flag is disabled;
// --help still works.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, disable_help_flag = true)]
pub struct Args {
    /// Database host
    #[arg(short = 'h', long, default_value = "127.0.0.1:5432")]
    pub host: String,

    /// Database username
    #[arg(short, long)]
    pub user: String,

    /// Database password
    #[arg(short, long, default_value = "")]
    pub password: String,

    /// Database name
    #[arg(short, long)]
    pub database: String,

    /// Table to repack
    #[arg(short, long)]
    pub table: String,

    /// Action to perform
    #[arg(short = 'a', long, value_enum, ignore_case = true, default_value = "new")]
    pub action: Mode,

    #[arg(long, action = clap::ArgAction::HelpLong)]
    help: Option<bool>,
}

pub fn get_args() -> Result<Args, clap::Error> {
    Args::try_parse()
}
