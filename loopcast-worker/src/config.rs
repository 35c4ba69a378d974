use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "loopcast",
    about = "Keeps a looping video under a live radio stream and switches it with every track."
)]
pub struct AppConfig {
    // Path to the broadcast configuration
    #[structopt(parse(from_os_str))]
    pub broadcast_path: PathBuf,

    /// Port for metrics, status and track change intake
    #[structopt(long, default_value = "9090")]
    pub http_port: u16,

    /// Start the broadcast right away instead of waiting for a start command
    #[structopt(long)]
    pub autostart: bool,
}
