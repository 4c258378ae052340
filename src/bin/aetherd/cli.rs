use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};

#[derive(Debug, Parser)]
#[command(name = "aetherd", author, version = aether::core::version(), about = "Aether GPU placement daemon")]
pub struct Aetherd {
    /// The configuration file to use
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the HTTP listen host
    #[arg(long, value_name = "HOST")]
    pub host: Option<String>,

    /// Override the HTTP listen port
    #[arg(long, value_name = "PORT")]
    pub port: Option<u16>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}
