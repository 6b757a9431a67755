// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Shadowlink Contributors

// Shadowlink - Command Line Interface
// Talks to the daemon's REST API to drive the proxy client

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;

use shadowlink_common::{
    format_host_port, link, ProxyKind, ProxyProfile, ServiceRequest, ServiceResult, Settings,
};

use config::CliConfig;

#[derive(Parser)]
#[command(name = "shadowlink")]
#[command(about = "Control the Shadowlink proxy client daemon")]
#[command(version)]
struct Cli {
    /// Daemon base URL (overrides the config file)
    #[arg(long, global = true)]
    daemon_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon health and the client connection state
    Status,

    /// Start the proxy client from a share link
    Start {
        /// An ss:// or ssr:// share link
        link: String,

        /// Local HTTP proxy port
        #[arg(long, default_value = "1095")]
        http_port: u16,

        /// Local HTTPS proxy port
        #[arg(long, default_value = "1096")]
        https_port: u16,

        /// Connection timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop the proxy client
    Stop,

    /// Scan text for share links (reads the clipboard when no text is given)
    Parse {
        /// Text to scan
        text: Option<String>,
    },

    /// Generate a share link and QR code for a server
    Url {
        /// Server host
        #[arg(short = 'H', long)]
        host: String,

        /// Server port
        #[arg(short = 'P', long)]
        port: u16,

        /// Encryption method
        #[arg(short = 'm', long)]
        method: String,

        /// Password
        #[arg(short = 'p', long, default_value = "")]
        password: String,

        /// Display remark
        #[arg(short = 'r', long, default_value = "")]
        remark: String,

        /// Link flavor to emit
        #[arg(long, value_enum, default_value_t = LinkFlavor::Ss)]
        flavor: LinkFlavor,

        /// Print the QR code data URL as well
        #[arg(long)]
        qr: bool,
    },

    /// Follow the daemon's client event stream
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum LinkFlavor {
    Ss,
    Ssr,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let base_url = resolve_base_url(cli.daemon_url)?;

    match cli.command {
        Commands::Status => show_status(&base_url).await,
        Commands::Start {
            link,
            http_port,
            https_port,
            timeout,
        } => start_client(&base_url, &link, http_port, https_port, timeout).await,
        Commands::Stop => stop_client(&base_url).await,
        Commands::Parse { text } => parse_links(&base_url, text).await,
        Commands::Url {
            host,
            port,
            method,
            password,
            remark,
            flavor,
            qr,
        } => {
            let profile = ProxyProfile {
                id: None,
                remark,
                server_host: host,
                server_port: port,
                password,
                encrypt_method: method,
                protocol: None,
                protocol_param: None,
                obfs: None,
                obfs_param: None,
                kind: match flavor {
                    LinkFlavor::Ss => ProxyKind::Ss,
                    LinkFlavor::Ssr => ProxyKind::Ssr,
                },
                timeout: 60,
                plugin: None,
            };
            generate_url(&base_url, profile, qr).await
        }
        Commands::Watch => watch_events(&base_url).await,
    }
}

fn resolve_base_url(override_url: Option<String>) -> Result<String> {
    let url = match override_url {
        Some(url) => url,
        None => CliConfig::load()?.daemon_url,
    };
    Ok(url.trim_end_matches('/').to_string())
}

/// Send one service request to the daemon and decode its envelope.
async fn dispatch(base_url: &str, request: &ServiceRequest) -> Result<ServiceResult> {
    let client = Client::new();
    let response = client
        .post(format!("{base_url}/api/service"))
        .json(request)
        .send()
        .await
        .context("Failed to reach the daemon; is it running?")?;

    if !response.status().is_success() {
        bail!("Daemon returned HTTP {}", response.status());
    }

    response
        .json::<ServiceResult>()
        .await
        .context("Failed to decode the daemon response")
}

async fn show_status(base_url: &str) -> Result<()> {
    let client = Client::new();
    let health: Value = client
        .get(format!("{base_url}/api/health"))
        .send()
        .await
        .context("Failed to reach the daemon; is it running?")?
        .json()
        .await
        .context("Failed to decode the health response")?;
    let status: Value = client
        .get(format!("{base_url}/api/status"))
        .send()
        .await?
        .json()
        .await
        .context("Failed to decode the status response")?;

    let version = health["version"].as_str().unwrap_or("?");
    let state = status["state"].as_str().unwrap_or("unknown");
    let state_label = match state {
        "connected" => state.green().bold(),
        "connecting" | "disconnecting" => state.yellow(),
        _ => state.red(),
    };

    println!();
    println!("Daemon:  {} (v{version})", "running".green().bold());
    println!("Client:  {state_label}");
    if let Some(active) = status["active"].as_object() {
        let remark = active
            .get("remark")
            .and_then(Value::as_str)
            .unwrap_or("?");
        println!("Server:  {remark}");
        println!(
            "Ports:   HTTP {}  HTTPS {}",
            active.get("httpPort").cloned().unwrap_or(Value::Null),
            active.get("httpsPort").cloned().unwrap_or(Value::Null)
        );
    }
    println!();
    Ok(())
}

async fn start_client(
    base_url: &str,
    link: &str,
    http_port: u16,
    https_port: u16,
    timeout: Option<u64>,
) -> Result<()> {
    let mut profiles = link::parse(link);
    if profiles.is_empty() {
        bail!("no usable share link found in the given text");
    }
    let mut profile = profiles.remove(0);
    if let Some(timeout) = timeout {
        profile.timeout = timeout;
    }
    let remark = profile.display_remark().to_string();

    println!(
        "{}",
        format!("Starting proxy client for '{remark}'").green().bold()
    );

    let settings = Settings {
        http_port,
        https_port,
        ..Settings::default()
    };
    let result = dispatch(base_url, &ServiceRequest::StartClient { profile, settings }).await?;

    match result.code {
        ServiceResult::OK => {
            println!("{}", "✓ Connected".green().bold());
            println!(
                "{}",
                format!("HTTP proxy on 127.0.0.1:{http_port}, HTTPS on 127.0.0.1:{https_port}")
                    .dimmed()
            );
            Ok(())
        }
        ServiceResult::PORT_IN_USE => bail!("a local proxy port is already in use"),
        _ => bail!("daemon reported: {}", result.result),
    }
}

async fn stop_client(base_url: &str) -> Result<()> {
    println!("{}", "Stopping proxy client...".yellow());

    let result = dispatch(base_url, &ServiceRequest::StopClient).await?;
    if !result.is_ok() {
        bail!("daemon reported: {}", result.result);
    }

    println!("{}", "✓ Stopped".green().bold());
    Ok(())
}

async fn parse_links(base_url: &str, text: Option<String>) -> Result<()> {
    let from_clipboard = text.as_deref().map_or(true, str::is_empty);
    let result = dispatch(base_url, &ServiceRequest::ParseClipboardText { text }).await?;
    if !result.is_ok() {
        bail!("daemon reported: {}", result.result);
    }

    let profiles: Vec<ProxyProfile> =
        serde_json::from_value(result.result).context("Failed to decode parsed profiles")?;
    if profiles.is_empty() {
        let source = if from_clipboard { "the clipboard" } else { "the given text" };
        println!("{}", format!("No share links found in {source}").yellow());
        return Ok(());
    }

    print_profiles_table(&profiles);
    Ok(())
}

fn print_profiles_table(profiles: &[ProxyProfile]) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Remark").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Type").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Server").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Method").add_attribute(Attribute::Bold).fg(Color::Cyan),
        Cell::new("Obfs").add_attribute(Attribute::Bold).fg(Color::Cyan),
    ]);

    for profile in profiles {
        let server = format_host_port(&profile.server_host, profile.server_port);
        let obfs = profile.obfs.as_deref().unwrap_or("-");
        table.add_row(vec![
            Cell::new(profile.display_remark()).fg(Color::Green),
            Cell::new(profile.kind.as_str()),
            Cell::new(server),
            Cell::new(&profile.encrypt_method),
            Cell::new(obfs).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!("{} profile(s) found", profiles.len().to_string().cyan());
    println!();
}

async fn generate_url(base_url: &str, profile: ProxyProfile, qr: bool) -> Result<()> {
    let result = dispatch(base_url, &ServiceRequest::GenerateUrlFromConfig { profile }).await?;
    if !result.is_ok() {
        bail!("daemon reported: {}", result.result);
    }

    let url = result.result["url"].as_str().unwrap_or_default();
    println!("{url}");
    if qr {
        let data_url = result.result["dataUrl"].as_str().unwrap_or_default();
        println!();
        println!("{}", data_url.dimmed());
    }
    Ok(())
}

async fn watch_events(base_url: &str) -> Result<()> {
    let client = Client::new();
    let response = client
        .get(format!("{base_url}/api/events"))
        .send()
        .await
        .context("Failed to connect to the event stream; is the daemon running?")?;

    if !response.status().is_success() {
        bail!("Daemon returned HTTP {} for the event stream", response.status());
    }

    println!("{}", "Watching client events (Ctrl+C to stop)...".dimmed());

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading from the event stream")?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end().to_string();
            buffer.drain(..=pos);

            // SSE comments and blank keep-alive lines carry no payload
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(rest) = line.strip_prefix("data:") {
                let payload = rest.trim();
                if payload.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(payload) {
                    Ok(event) => print_event(&event),
                    Err(_) => println!("{}", payload.dimmed()),
                }
            }
        }
    }

    Ok(())
}

fn print_event(event: &Value) {
    let kind = event["type"].as_str().unwrap_or("unknown");
    if kind == "heartbeat" {
        return;
    }

    let timestamp = event["timestamp"].as_str().unwrap_or("");
    let label = match kind {
        "connecting" => "connecting".yellow(),
        "connected" => "connected".green().bold(),
        "disconnected" => "disconnected".red(),
        "start_failed" => "start failed".red().bold(),
        other => other.normal(),
    };

    match event["error"].as_str().or_else(|| event["reason"].as_str()) {
        Some(detail) => println!("{} {label} {detail}", timestamp.dimmed()),
        None => println!("{} {label}", timestamp.dimmed()),
    }
}
