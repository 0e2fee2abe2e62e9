//! Interactive terminal client
//!
//! Prints every telemetry update and server notice, and reads commands from
//! stdin: `speed up`, `slow down`, `turn left`, `turn right`, `users`, `ping`,
//! `refresh`, `status`, `quit`.
//!
//! Usage: cargo run -p roverlink-client -- [ROLE] [OPTIONS]

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use roverlink_client::thread_util::spawn_named;
use roverlink_client::{Client, ClientConfig, CommandError, LogLevel, Notice};
use roverlink_protocol::{Request, Role, WireFormat};
use roverlink_telemetry_log::LogFormat;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "roverlink", version)]
#[command(about = "Vehicle telemetry and control client")]
struct Args {
    /// Role to connect as (admin or observer). Asked for when omitted.
    role: Option<Role>,

    /// JSON config file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service host
    #[arg(long)]
    host: Option<String>,

    /// Service port
    #[arg(short, long)]
    port: Option<u16>,

    /// Admin token. Asked for when the admin role has none.
    #[arg(short, long)]
    token: Option<String>,

    /// Wire format (structured or tokenized)
    #[arg(short, long)]
    format: Option<WireFormat>,

    /// Don't poll for fresh data
    #[arg(long)]
    no_poll: bool,

    /// Seconds between data requests
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Directory for the daily telemetry log
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Telemetry log format (csv or jsonl)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Console log level (off, error, warn, info, debug). RUST_LOG overrides.
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Append diagnostic logs to this file instead of stderr
    #[arg(long)]
    diag_file: Option<PathBuf>,

    /// Write the effective config (without the token) to this file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(token) = &self.token {
            config.token = Some(token.clone());
        }
        if let Some(format) = self.format {
            config.wire_format = format;
        }
        if self.no_poll {
            config.poll_enabled = false;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval_secs = secs;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir.clone_from(dir);
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
    }
}

fn open_diag_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn init_logging(level: LogLevel, diag: Option<File>) {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level.as_level_filter())
        .parse_default_env()
        .format_timestamp_millis();
    if let Some(file) = diag {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("reading from stdin")?;
    Ok(answer.trim().to_string())
}

fn ask_role() -> Result<Role> {
    loop {
        let answer = prompt("Role [admin/observer]: ")?;
        if answer.is_empty() {
            return Ok(Role::Observer);
        }
        match answer.parse() {
            Ok(role) => return Ok(role),
            Err(e) => println!("{e}"),
        }
    }
}

fn print_help() {
    println!("Commands: speed up | slow down | turn left | turn right");
    println!("Requests: users | ping | refresh");
    println!("Other:    status | help | quit");
}

fn report(result: Result<(), CommandError>) {
    match result {
        // Already shown through the notice printer
        Ok(()) | Err(CommandError::Unauthorized { .. }) => {}
        Err(e) => println!("! {e}"),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    args.apply(&mut config);
    let diag = match &args.diag_file {
        Some(path) => Some(
            open_diag_file(path)
                .with_context(|| format!("opening diagnostic log {}", path.display()))?,
        ),
        None => None,
    };
    init_logging(config.log_level, diag);

    if let Some(path) = &args.save_config {
        let mut saved = config.clone();
        saved.token = None;
        saved.normalize();
        saved.save(path)?;
        println!("Config written to {}", path.display());
        return Ok(());
    }

    if args.role.is_none() && args.config.is_none() {
        config.role = ask_role()?;
    }
    if config.role == Role::Admin && config.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
        config.token = Some(prompt("Admin token: ")?);
    }
    config.normalize();
    config.validate().context("invalid configuration")?;

    let (client, handles) = Client::connect(&config)
        .with_context(|| format!("connecting to {}:{}", config.host, config.port))?;
    info!("Connected as {}", client.role());
    print_help();

    let states = handles.states;
    let state_printer = spawn_named("roverlink-state", move || {
        for state in states {
            println!("[telemetry] {}", state.summary());
        }
    })?;
    let notices = handles.notices;
    let notice_printer = spawn_named("roverlink-notice", move || {
        for notice in notices {
            match notice {
                Notice::Status(text) => println!("[status] {text}"),
                Notice::Info(text) => println!("[info] {text}"),
            }
        }
    })?;

    for line in io::stdin().lock().lines() {
        let line = line.context("reading from stdin")?;
        let input = line.trim();
        match input.to_ascii_lowercase().as_str() {
            "" => {}
            "quit" | "exit" => break,
            "help" => print_help(),
            "status" => println!("{} [{}]", client.display().summary(), client.state()),
            "users" => report(client.request(Request::ListUsers)),
            "ping" => report(client.request(Request::Ping)),
            "refresh" => report(client.request(Request::GetData)),
            _ => report(client.trigger(input).map(|_| ())),
        }
        if client.state().is_terminal() {
            println!("Connection {}", client.state());
            break;
        }
    }

    client.close();
    // Printers end once every sender is gone
    drop(client);
    let _ = state_printer.join();
    let _ = notice_printer.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diag_file_appends() {
        let dir = std::env::temp_dir().join(format!("roverlink-diag-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let path = dir.join("nested").join("client.log");

        writeln!(open_diag_file(&path).unwrap(), "first").unwrap();
        writeln!(open_diag_file(&path).unwrap(), "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "roverlink",
            "admin",
            "--port",
            "6000",
            "-f",
            "tokenized",
            "--no-poll",
            "--save-config",
            "out.json",
        ]);
        let mut config = ClientConfig::default();
        args.apply(&mut config);
        assert_eq!(config.role, Role::Admin);
        assert_eq!(config.port, 6000);
        assert_eq!(config.wire_format, WireFormat::Tokenized);
        assert!(!config.poll_enabled);
        assert_eq!(args.save_config.as_deref(), Some(Path::new("out.json")));
        assert!(args.diag_file.is_none());
    }
}
