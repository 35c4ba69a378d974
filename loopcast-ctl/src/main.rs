use color_eyre::eyre::eyre;
use color_eyre::Result;
use log::{debug, info};
use loopcast_core::control::{
    Command, ControlChannel, ControlCommand, FileControlChannel, RunStatus, StatusSnapshot,
};
use loopcast_core::models::SessionState;
use pretty_env_logger::env_logger;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use structopt::StructOpt;

const STATUS_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, StructOpt)]
#[structopt(
    name = "loopcast-ctl",
    about = "Starts, stops and inspects a loopcast engine through its control directory."
)]
struct Opt {
    /// Directory shared with the engine
    #[structopt(long, parse(from_os_str), default_value = "/tmp/loopcast/control")]
    control_dir: PathBuf,

    #[structopt(subcommand)]
    action: Action,
}

#[derive(Debug, StructOpt)]
enum Action {
    /// Start the broadcast
    Start(WaitOpt),
    /// Stop the broadcast and every encoder
    Stop(WaitOpt),
    /// Stop and start again, also clears a failed broadcast
    Restart(WaitOpt),
    /// Print the last status the engine published
    Status,
}

#[derive(Debug, StructOpt)]
struct WaitOpt {
    /// Wait until the engine status reflects the request
    #[structopt(long)]
    wait: bool,

    /// Seconds to wait before giving up
    #[structopt(long, default_value = "30")]
    timeout: u64,
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "warn"),
    );

    let opt = Opt::from_args();
    let channel = FileControlChannel::open(&opt.control_dir)?;

    match opt.action {
        Action::Status => print_status(&channel),
        Action::Start(wait) => request(&channel, Command::Start, &wait),
        Action::Stop(wait) => request(&channel, Command::Stop, &wait),
        Action::Restart(wait) => request(&channel, Command::Restart, &wait),
    }
}

fn print_status(channel: &dyn ControlChannel) -> Result<()> {
    match channel.read_status()? {
        Some(status) => print(&status),
        None => Err(eyre!("Engine has not published a status yet")),
    }
}

fn print(status: &StatusSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);
    Ok(())
}

fn request(channel: &dyn ControlChannel, command: Command, wait: &WaitOpt) -> Result<()> {
    let request = ControlCommand::now(command);
    channel.post_command(&request)?;
    info!("Requested {:?}", command);

    if !wait.wait {
        return Ok(());
    }
    let status = wait_for(
        channel,
        &request,
        Duration::from_secs(wait.timeout),
        STATUS_POLL,
    )?;
    print(&status)
}

/// Whether `status` shows the outcome of `request`.
fn reflects(request: &ControlCommand, status: &StatusSnapshot) -> bool {
    match request.command {
        Command::Stop => status.status == RunStatus::Stopped,
        Command::Start => status.running,
        // Only a track put on air after the request proves the restart happened.
        Command::Restart => status
            .current_track
            .as_ref()
            .map_or(false, |track| track.started_at >= request.requested_at),
    }
}

fn wait_for(
    channel: &dyn ControlChannel,
    request: &ControlCommand,
    limit: Duration,
    poll: Duration,
) -> Result<StatusSnapshot> {
    let give_up = Instant::now() + limit;
    loop {
        if let Some(status) = channel.read_status()? {
            if reflects(request, &status) {
                return Ok(status);
            }
            if request.command == Command::Start && status.state == SessionState::Failed {
                return Err(eyre!(
                    "Broadcast has failed, use restart to bring it back"
                ));
            }
            debug!("Engine reports {:?}, waiting", status.state);
        }
        if Instant::now() >= give_up {
            return Err(eyre!(
                "Engine did not apply {:?} within {:?}",
                request.command,
                limit
            ));
        }
        thread::sleep(poll);
    }
}
