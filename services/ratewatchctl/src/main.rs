use admin_ipc::{send_request, AdminRequest, AdminResponse, DEFAULT_SOCKET_PATH};
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "ADMIN_SOCKET", default_value = DEFAULT_SOCKET_PATH)]
    socket: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the scheduler's current phase and last known reading.
    Status,
    /// Ask the daemon to poll the publisher right away.
    Poll {
        /// Context line included in the operator notification.
        #[arg(long)]
        note: Option<String>,
    },
}

fn request_for(command: Command) -> AdminRequest {
    match command {
        Command::Status => AdminRequest::Status,
        Command::Poll { note } => AdminRequest::PollNow { note },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let req = request_for(cli.command);

    let resp = send_request(&cli.socket, &req).await?;
    println!("{}", serde_json::to_string(&resp)?);
    if let AdminResponse::Error(message) = resp {
        bail!("daemon refused request: {message}");
    }
    Ok(())
}
