//! CLI for ccsbridge
//!
//! Subcommands:
//! - `serve`: hold a relay connection open, logging inbound traffic
//! - `send`: send one message and print the relay's answer

use clap::Parser;
use tracing::{error, info};

use ccsbridge::CcsBridge;
use ccsbridge::config::load_config;
use ccsbridge::message::{NotificationPayload, OutboundMessage, Priority};
use ccsbridge::response::RetryBackoff;
use ccsbridge::transport::XmppTransport;
use ccsbridge::utils::logging;

#[derive(Parser)]
#[command(name = "ccsbridge", version, about = "FCM connection server relay bridge")]
enum Command {
    /// Connect to the relay and stay connected until Ctrl-C
    Serve,
    /// Send a single message and wait for the ack
    Send {
        /// Registration token or topic (`/topics/news`)
        #[arg(long)]
        to: String,
        /// Data entries as key=value, repeatable
        #[arg(long = "data", value_parser = parse_entry)]
        data: Vec<(String, String)>,
        /// Notification title; makes this a notification message
        #[arg(long)]
        title: Option<String>,
        /// Notification body
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        high_priority: bool,
        /// Resend transient failures with exponential backoff
        #[arg(long)]
        retry: bool,
        /// Ask the relay to validate without delivering
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_entry(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

#[tokio::main]
async fn main() {
    let command = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init_from_settings(&settings.logging);

    let bridge = CcsBridge::new(XmppTransport::new(), settings);
    if let Err(e) = bridge.open().await {
        error!("Could not open relay connection: {e}");
        std::process::exit(1);
    }

    let outcome = match command {
        Command::Serve => {
            info!("Connected, waiting for traffic. Press Ctrl-C to stop.");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Shutdown signal received. Closing connection.");
            Ok(())
        }
        Command::Send {
            to,
            data,
            title,
            body,
            high_priority,
            retry,
            dry_run,
        } => send(&bridge, to, data, title, body, high_priority, retry, dry_run).await,
    };

    bridge.close().await;
    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
async fn send(
    bridge: &CcsBridge<XmppTransport>,
    to: String,
    data: Vec<(String, String)>,
    title: Option<String>,
    body: Option<String>,
    high_priority: bool,
    retry: bool,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let builder = if title.is_some() || body.is_some() {
        let mut payload = NotificationPayload::new();
        if let Some(title) = title {
            payload = payload.title(title);
        }
        if let Some(body) = body {
            payload = payload.body(body);
        }
        OutboundMessage::notification_builder(payload)
    } else {
        OutboundMessage::data_builder()
    };
    let priority = if high_priority {
        Priority::High
    } else {
        Priority::Normal
    };
    let message = data
        .into_iter()
        .fold(builder, |builder, (k, v)| builder.data_entry(k, v))
        .to(to)
        .priority(priority)
        .dry_run(dry_run)
        .build()?;

    let response = if retry {
        bridge
            .send_with_retry(message, RetryBackoff::default())
            .await?
    } else {
        bridge.send_message(message).await?
    };
    println!("acked {} from {}", response.message_id, response.from);
    Ok(())
}
