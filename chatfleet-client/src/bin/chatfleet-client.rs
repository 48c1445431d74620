use std::time::Duration;

use anyhow::{Context, Result};
use chatfleet_client::{ClientOptions, ClientUpdate, Credentials, ReconnectPolicy, ResilientClient};
use chatfleet_core::config::LoggingConfig;
use chatfleet_core::logging;
use chatfleet_core::models::ChatMessage;
use chatfleet_core::protocol::{ClientFrame, DeliveryStatus, ServerFrame};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "Commands: /msg <user> <text>, /history <user>, /online, /logout, /quit";

#[derive(Parser, Debug)]
#[command(name = "chatfleet-client", about = "Terminal client for a chatfleet cluster")]
struct Args {
    /// Worker or load balancer address
    #[arg(long, env = "CHATFLEET_SERVER", default_value = "127.0.0.1:5000")]
    server: String,

    #[arg(long, short)]
    username: String,

    #[arg(long, short, env = "CHATFLEET_PASSWORD")]
    password: String,

    /// Create the account first
    #[arg(long)]
    signup: bool,

    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Disable jitter on reconnect delays
    #[arg(long)]
    no_jitter: bool,

    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Write logs to a file instead of the terminal
    #[arg(long)]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    logging::init_logging(&LoggingConfig {
        level: args.log_level.clone(),
        format: "pretty".to_string(),
        file_path: args.log_file.clone(),
    })?;

    let options = ClientOptions {
        server: args.server.clone(),
        policy: ReconnectPolicy {
            jitter: !args.no_jitter,
            ..ReconnectPolicy::default()
        },
        ..ClientOptions::default()
    };
    let mut credentials = Credentials {
        username: args.username.clone(),
        password: args.password.clone(),
        signup: args.signup,
    };

    let (mut client, pending) = ResilientClient::connect(options, &credentials)
        .await
        .with_context(|| format!("Failed to log in to {}", args.server))?;
    // Later logins use the account that now exists
    credentials.signup = false;

    println!("Logged in as {}. {HELP}", client.identity().username);
    print_pending(&pending);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(args.heartbeat_secs.max(1)));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Command::Send(frame) => {
                        if let Err(e) = client.send(frame).await {
                            println!("! not sent: {e}");
                        }
                    }
                    Command::Logout => {
                        client.logout().await?;
                        println!("Logged out");
                        return Ok(());
                    }
                    Command::Quit => break,
                    Command::Help => println!("{HELP}"),
                }
            }
            _ = heartbeat.tick() => {
                let _ = client.send(ClientFrame::Heartbeat).await;
            }
            update = client.next_update() => match update {
                ClientUpdate::Frame(frame) => print_frame(&frame),
                ClientUpdate::Maintenance { reconnect_after } => {
                    println!(
                        "* Server maintenance, reconnecting in {}s",
                        reconnect_after.as_secs()
                    );
                }
                ClientUpdate::Reconnected { pending } => {
                    println!("* Reconnected");
                    print_pending(&pending);
                }
                ClientUpdate::Evicted => {
                    println!("* Logged in from another place, session closed");
                    break;
                }
                ClientUpdate::LoginRequired => {
                    println!("* Session expired, logging in again");
                    let pending = client
                        .login(&credentials)
                        .await
                        .context("Failed to log in again")?;
                    print_pending(&pending);
                }
                ClientUpdate::GaveUp => {
                    println!("* Could not reconnect, please log in again");
                    break;
                }
            }
        }
    }

    Ok(())
}

enum Command {
    Send(ClientFrame),
    Logout,
    Quit,
    Help,
}

fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("/msg") => match (parts.next(), parts.next()) {
            (Some(to), Some(body)) if !body.trim().is_empty() => Command::Send(ClientFrame::Send {
                to: to.to_string(),
                body: body.to_string(),
            }),
            _ => Command::Help,
        },
        Some("/history") => match parts.next() {
            Some(with) => Command::Send(ClientFrame::History {
                with: with.to_string(),
                limit: None,
            }),
            None => Command::Help,
        },
        Some("/online") => Command::Send(ClientFrame::ListOnline),
        Some("/logout") => Command::Logout,
        Some("/quit") => Command::Quit,
        _ => Command::Help,
    }
}

fn print_pending(pending: &[ChatMessage]) {
    if pending.is_empty() {
        return;
    }
    println!("* {} message(s) while you were away:", pending.len());
    for message in pending {
        print_message(message);
    }
}

fn print_message(message: &ChatMessage) {
    println!(
        "[{}] {}: {}",
        message.sent_at.format("%H:%M:%S"),
        message.from,
        message.body
    );
}

fn print_frame(frame: &ServerFrame) {
    match frame {
        ServerFrame::Message(message) => print_message(message),
        ServerFrame::Sent { to, status, .. } => match status {
            DeliveryStatus::Delivered => println!("* delivered to {to}"),
            DeliveryStatus::Queued => println!("* {to} is offline, message saved"),
        },
        ServerFrame::Online { users } => println!("* online: {}", users.join(", ")),
        ServerFrame::History { with, messages } if messages.is_empty() => {
            println!("* no messages with {with}");
        }
        ServerFrame::History { with, messages } => {
            println!("* conversation with {with}:");
            for message in messages {
                print_message(message);
            }
        }
        ServerFrame::Error { message } => println!("! {message}"),
        other => tracing::debug!(frame = ?other, "Unhandled frame"),
    }
}
