// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Bridge Contributors

// Tunnel Bridge - CLI Client
// Command-line interface for the bridge daemon

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use zeroize::Zeroizing;

use tunnel_bridge_common::{
    BridgeClient, BridgeClientConfig, BridgeStatus, CommandData, CommandRequest, CommandResult,
    ConnectRequest, EventListener, EventPayload, OutgoingEvent, PortDescriptor, PortOptions,
    ResourceKind, ResourceState, Row, SendPayload,
};

#[derive(Parser)]
#[command(name = "tunnel-bridge")]
#[command(about = "Tunnel Bridge CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Daemon URL
    #[arg(long, global = true, env = "BRIDGE_URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the SSH tunnel; unset options fall back to the daemon's environment
    Connect {
        /// SSH host
        #[arg(short = 'H', long)]
        ssh_host: Option<String>,

        /// SSH port
        #[arg(short = 'P', long)]
        ssh_port: Option<u16>,

        /// SSH username
        #[arg(short = 'u', long)]
        ssh_user: Option<String>,

        /// SSH password
        #[arg(long, env = "SSH_PASSWORD", hide_env_values = true)]
        ssh_password: Option<String>,

        /// Database host as seen from the SSH server
        #[arg(long)]
        mysql_host: Option<String>,

        /// Database port
        #[arg(long)]
        mysql_port: Option<u16>,

        /// Database user
        #[arg(long)]
        mysql_user: Option<String>,

        /// Database password
        #[arg(long, env = "MYSQL_PASSWORD", hide_env_values = true)]
        mysql_password: Option<String>,

        /// Database name
        #[arg(short = 'd', long)]
        database: Option<String>,
    },

    /// Close the SSH tunnel
    Disconnect,

    /// List tables of the tunnelled database
    Tables,

    /// Run a SQL statement (at most 100 rows are returned)
    Query {
        sql: String,

        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show the first 100 rows of a table
    Contents {
        table: String,

        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// List serial ports
    Ports,

    /// Open a serial port (closes any open one first)
    Open {
        path: String,

        #[arg(short, long, default_value_t = 9600)]
        baud: u32,

        #[arg(long, default_value_t = 8)]
        data_bits: u8,

        #[arg(long, default_value_t = 1)]
        stop_bits: u8,

        #[arg(long, value_enum, default_value_t = ParityArg::None)]
        parity: ParityArg,

        #[arg(long, value_enum, default_value_t = FlowControlArg::None)]
        flow_control: FlowControlArg,
    },

    /// Write to the open serial port
    Send {
        /// Text (a newline is appended when missing) or hex bytes with --hex
        data: String,

        /// Interpret DATA as hex bytes, e.g. "01 02 ff"
        #[arg(short = 'x', long)]
        hex: bool,
    },

    /// Close the serial port
    Close,

    /// Show tunnel and serial port state
    Status,

    /// Stream events from the daemon
    Watch {
        /// Only show events from this resource
        #[arg(long, value_enum)]
        source: Option<SourceArg>,

        /// Include heartbeats
        #[arg(long)]
        heartbeats: bool,
    },

    /// Check that the daemon is reachable
    Health,
}

#[derive(Clone, Copy, ValueEnum)]
enum ParityArg {
    None,
    Odd,
    Even,
}

#[derive(Clone, Copy, ValueEnum)]
enum FlowControlArg {
    None,
    Software,
    Hardware,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    Tunnel,
    Serial,
}

impl From<ParityArg> for tunnel_bridge_common::Parity {
    fn from(arg: ParityArg) -> Self {
        match arg {
            ParityArg::None => Self::None,
            ParityArg::Odd => Self::Odd,
            ParityArg::Even => Self::Even,
        }
    }
}

impl From<FlowControlArg> for tunnel_bridge_common::FlowControl {
    fn from(arg: FlowControlArg) -> Self {
        match arg {
            FlowControlArg::None => Self::None,
            FlowControlArg::Software => Self::Software,
            FlowControlArg::Hardware => Self::Hardware,
        }
    }
}

impl From<SourceArg> for ResourceKind {
    fn from(arg: SourceArg) -> Self {
        match arg {
            SourceArg::Tunnel => ResourceKind::Tunnel,
            SourceArg::Serial => ResourceKind::Serial,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let config = match cli.url {
        Some(url) => BridgeClientConfig::with_base_url(url),
        None => BridgeClientConfig::from_env(),
    };
    let client = BridgeClient::new(config)?;

    match cli.command {
        Commands::Connect {
            ssh_host,
            ssh_port,
            ssh_user,
            ssh_password,
            mysql_host,
            mysql_port,
            mysql_user,
            mysql_password,
            database,
        } => {
            let request = ConnectRequest {
                ssh_host,
                ssh_port,
                ssh_username: ssh_user,
                ssh_password: ssh_password.map(Zeroizing::new),
                mysql_host,
                mysql_port,
                mysql_user,
                mysql_password: mysql_password.map(Zeroizing::new),
                mysql_database: database,
            };
            println!("{}", "Connecting...".dimmed());
            let result = run(&client, CommandRequest::Connect(request)).await?;
            print_message(&result, "Tunnel ready");
        }
        Commands::Disconnect => {
            let result = run(&client, CommandRequest::Disconnect).await?;
            print_message(&result, "Tunnel closed");
        }
        Commands::Tables => {
            let result = run(&client, CommandRequest::ListTables).await?;
            if let Some(CommandData::Tables(tables)) = result.data {
                print_tables(&tables);
            }
        }
        Commands::Query { sql, json } => {
            let result = run(&client, CommandRequest::Query { sql }).await?;
            if let Some(CommandData::Rows(rows)) = result.data {
                print_rows(&rows, json)?;
            }
        }
        Commands::Contents { table, json } => {
            let result = run(&client, CommandRequest::TableContents { table }).await?;
            if let Some(CommandData::Rows(rows)) = result.data {
                print_rows(&rows, json)?;
            }
        }
        Commands::Ports => {
            let result = run(&client, CommandRequest::ListPorts).await?;
            if let Some(CommandData::Ports(ports)) = result.data {
                print_ports(&ports);
            }
        }
        Commands::Open {
            path,
            baud,
            data_bits,
            stop_bits,
            parity,
            flow_control,
        } => {
            let options = PortOptions {
                baud_rate: baud,
                data_bits,
                stop_bits,
                parity: parity.into(),
                flow_control: flow_control.into(),
            };
            let result = run(&client, CommandRequest::OpenPort { path, options }).await?;
            print_message(&result, "Port open");
        }
        Commands::Send { data, hex } => {
            let payload = if hex {
                SendPayload::Bytes(parse_hex(&data)?)
            } else {
                SendPayload::Text(data)
            };
            let result = run(&client, CommandRequest::Send { payload }).await?;
            print_message(&result, "Sent");
        }
        Commands::Close => {
            let result = run(&client, CommandRequest::ClosePort).await?;
            print_message(&result, "Port closed");
        }
        Commands::Status => {
            let result = run(&client, CommandRequest::Status).await?;
            if let Some(CommandData::Status(status)) = result.data {
                print_status(&status);
            }
        }
        Commands::Watch { source, heartbeats } => {
            watch_events(client, source.map(Into::into), heartbeats).await?;
        }
        Commands::Health => {
            if client.health().await? {
                println!("{}", "✓ Daemon is running".green().bold());
            } else {
                anyhow::bail!("Daemon responded but is not healthy");
            }
        }
    }

    Ok(())
}

/// Send a command; a failed result becomes an error with the daemon's message
async fn run(client: &BridgeClient, request: CommandRequest) -> Result<CommandResult> {
    let result = client.command(&request).await?;
    if !result.success {
        let message = result
            .message
            .unwrap_or_else(|| "command failed".to_string());
        match result.error_kind {
            Some(kind) => anyhow::bail!("{} ({:?})", message, kind),
            None => anyhow::bail!("{}", message),
        }
    }
    Ok(result)
}

fn print_message(result: &CommandResult, fallback: &str) {
    let message = result.message.as_deref().unwrap_or(fallback);
    println!("{}", format!("✓ {}", message).green().bold());
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| {
            Cell::new(name)
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan)
        })
        .collect()
}

fn print_tables(tables: &[String]) {
    if tables.is_empty() {
        println!("{}", "No tables found.".yellow());
        return;
    }
    for table in tables {
        println!("  {}", table.green());
    }
    println!();
    println!("{} table(s)", tables.len().to_string().cyan());
}

fn print_rows(rows: &[Row], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("{}", "No rows.".yellow());
        return Ok(());
    }

    let columns: Vec<&str> = rows[0].keys().map(String::as_str).collect();
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&columns));

    for row in rows {
        table.add_row(
            columns
                .iter()
                .map(|column| match row.get(*column) {
                    Some(serde_json::Value::Null) | None => Cell::new("NULL").fg(Color::DarkGrey),
                    Some(serde_json::Value::String(s)) => Cell::new(s),
                    Some(other) => Cell::new(other.to_string()),
                })
                .collect::<Vec<_>>(),
        );
    }

    println!("{}", table);
    println!("{} row(s)", rows.len().to_string().cyan());
    Ok(())
}

fn print_ports(ports: &[PortDescriptor]) {
    if ports.is_empty() {
        println!("{}", "No serial ports found.".yellow());
        return;
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Path", "Type", "Manufacturer", "Product", "VID:PID"]));

    for port in ports {
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{:04x}:{:04x}", vid, pid),
            _ => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(&port.path).fg(Color::Green),
            Cell::new(&port.port_type),
            Cell::new(port.manufacturer.as_deref().unwrap_or("-")),
            Cell::new(port.product.as_deref().unwrap_or("-")),
            Cell::new(ids).fg(Color::DarkGrey),
        ]);
    }

    println!("{}", table);
}

fn state_cell(state: ResourceState) -> Cell {
    let color = match state {
        ResourceState::Ready => Color::Green,
        ResourceState::Connecting | ResourceState::Closing => Color::Yellow,
        ResourceState::Idle => Color::DarkGrey,
    };
    Cell::new(state.to_string()).fg(color)
}

fn print_status(status: &BridgeStatus) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Resource", "State", "Target"]));
    table.add_row(vec![
        Cell::new("tunnel"),
        state_cell(status.tunnel),
        Cell::new(status.ssh_endpoint.as_deref().unwrap_or("-")),
    ]);
    table.add_row(vec![
        Cell::new("serial"),
        state_cell(status.serial),
        Cell::new(status.serial_path.as_deref().unwrap_or("-")),
    ]);
    println!("{}", table);
}

async fn watch_events(
    client: BridgeClient,
    source_filter: Option<ResourceKind>,
    heartbeats: bool,
) -> Result<()> {
    if !client.health().await.context("Daemon is not reachable")? {
        anyhow::bail!("Daemon is not healthy");
    }

    println!(
        "{}",
        "Connected to event stream. Press Ctrl+C to stop.".dimmed()
    );

    let mut rx = EventListener::new(client).listen();
    while let Some(event) = rx.recv().await {
        let source = match &event {
            OutgoingEvent::Data { source, .. }
            | OutgoingEvent::Error { source, .. }
            | OutgoingEvent::Closed { source } => Some(*source),
            OutgoingEvent::Heartbeat { .. } => None,
        };
        if let (Some(wanted), Some(source)) = (source_filter, source) {
            if wanted != source {
                continue;
            }
        }

        match event {
            OutgoingEvent::Data { source, payload } => {
                println!("{} {}", format!("[{}]", source).cyan(), describe_payload(&payload));
            }
            OutgoingEvent::Error { source, message } => {
                eprintln!("{}", format!("[{}] error: {}", source, message).red());
            }
            OutgoingEvent::Closed { source } => {
                println!("{}", format!("[{}] closed", source).yellow());
            }
            OutgoingEvent::Heartbeat { timestamp } => {
                if heartbeats {
                    println!("{}", format!("heartbeat {}", timestamp.to_rfc3339()).dimmed());
                }
            }
        }
    }

    Ok(())
}

/// Printable form of an event payload; binary data is shown as hex
fn describe_payload(payload: &EventPayload) -> String {
    match payload {
        EventPayload::Text(text) => text.clone(),
        EventPayload::Tables(tables) => format!("tables: {}", tables.join(", ")),
        EventPayload::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) if !text.chars().any(|c| c.is_control() && c != '\n' && c != '\r') => {
                text.trim_end().to_string()
            }
            _ => format!("{} (base64 {})", to_hex(bytes), STANDARD.encode(bytes)),
        },
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse "01 02 ff", "0102ff" or "0x01,0x02" into bytes
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .split(|c: char| c.is_whitespace() || c == ',' || c == ':')
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();

    if digits.is_empty() {
        anyhow::bail!("No hex bytes given");
    }
    if !digits.is_ascii() {
        anyhow::bail!("Hex input contains non-hex characters: {}", input);
    }
    if digits.len() % 2 != 0 {
        anyhow::bail!("Hex input has an odd number of digits: {}", input);
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("01 02 ff").unwrap(), vec![0x01, 0x02, 0xff]);
        assert_eq!(parse_hex("0102FF").unwrap(), vec![0x01, 0x02, 0xff]);
        assert_eq!(parse_hex("0x01,0x02").unwrap(), vec![0x01, 0x02]);
        assert!(parse_hex("").is_err());
        assert!(parse_hex("123").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_describe_payload() {
        assert_eq!(
            describe_payload(&EventPayload::Bytes(b"OK\r\n".to_vec())),
            "OK"
        );
        assert_eq!(
            describe_payload(&EventPayload::Bytes(vec![0x01, 0xff])),
            "01 ff (base64 Af8=)"
        );
        assert_eq!(
            describe_payload(&EventPayload::Tables(vec!["a".into(), "b".into()])),
            "tables: a, b"
        );
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["tunnel-bridge", "send", "--hex", "01 02"]).unwrap();
        match cli.command {
            Commands::Send { data, hex } => {
                assert!(hex);
                assert_eq!(data, "01 02");
            }
            _ => panic!("expected send"),
        }

        let cli = Cli::try_parse_from([
            "tunnel-bridge",
            "open",
            "/dev/ttyUSB0",
            "--baud",
            "115200",
            "--parity",
            "even",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Open { baud: 115200, .. }));
    }
}
