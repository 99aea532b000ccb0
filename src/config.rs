use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

/// Per-container IAM credential broker for Docker hosts.
#[derive(Parser, Debug, Clone)]
#[command(name = "iam-broker", version)]
pub struct Config {
    /// Address on which the HTTP server should listen
    #[arg(long, default_value = ":8080")]
    pub listen_addr: String,

    /// Read timeout of the HTTP server
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Write timeout of the HTTP server
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub write_timeout: Duration,

    /// Address of the upstream EC2 metadata API
    #[arg(long, default_value = "http://169.254.169.254:80")]
    pub meta_data_api: reqwest::Url,

    /// Number of workers consuming the Docker events channel
    #[arg(long, default_value_t = 4)]
    pub event_handlers: usize,

    /// Frequency of the Docker container sync; 0 syncs once at startup
    #[arg(long, default_value = "0s", value_parser = parse_duration)]
    pub docker_sync_period: Duration,

    /// Frequency of the IAM credential refresh sweep
    #[arg(long, default_value = "1m", value_parser = parse_duration)]
    pub credential_refresh_period: Duration,

    /// Enable debug-level logging
    #[arg(long)]
    pub verbose: bool,

    /// Respond 403 to non-metadata requests instead of proxying upstream
    #[arg(long)]
    pub disable_upstream: bool,
}

impl Config {
    /// The listen address as a socket address; a bare `:port` binds all
    /// interfaces.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        if let Some(port) = self.listen_addr.strip_prefix(':') {
            format!("0.0.0.0:{}", port).parse()
        } else {
            self.listen_addr.parse()
        }
    }
}

/// Parse Go-style duration values: `30s`, `5m`, `1h`, or a combination like
/// `1h30m`. A bare number is seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {}", value))?;
        digits.clear();
        let unit = match c {
            's' => Duration::from_secs(1),
            'm' => Duration::from_secs(60),
            'h' => Duration::from_secs(3600),
            _ => return Err(format!("unknown duration unit '{}' in {}", c, value)),
        };
        total += unit * amount as u32;
    }
    if !digits.is_empty() {
        return Err(format!("missing unit in duration: {}", value));
    }
    Ok(total)
}
