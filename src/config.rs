// clap to parse command-line arguments for the ports to open and the shape of every proxy instance.
/* ProxyConfig is the immutable per-instance configuration handed to a listener.
    The CLI (--port, --status, --ssh-upstream, ...) only exists to build one; every
    port opened by the manager gets its own copy with the port filled in.
 */
use clap::Parser;
use std::time::Duration;

use crate::error::BindError;
use crate::upstream::Upstream;

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_STATUS: &str = "@RustyManager";
pub const DEFAULT_BACKLOG: u32 = 128;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_PRECONSUME: usize = 1024;
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one proxy instance needs. Never mutated while its listener runs;
/// changing a field means stopping and starting the instance again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Port to listen on (1-65535).
    pub port: u16,
    /// Banner echoed into both fabricated status lines.
    pub status: String,
    /// Upstream used when the sniffed payload is empty or looks like SSH.
    pub ssh_upstream: Upstream,
    /// Upstream used for everything else (OpenVPN by default).
    pub alt_upstream: Upstream,
    pub backlog: u32,
    /// Try a single IPv6 socket accepting IPv4 clients before splitting into two sockets.
    pub dual_stack: bool,
    pub buffer_size: usize,
    /// Bytes read and thrown away between the 101 and 200 lines.
    pub preconsume: usize,
    pub sniff_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            status: DEFAULT_STATUS.to_string(),
            ssh_upstream: Upstream::new("127.0.0.1", 22),
            alt_upstream: Upstream::new("127.0.0.1", 1194),
            backlog: DEFAULT_BACKLOG,
            dual_stack: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            preconsume: DEFAULT_PRECONSUME,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
            start_timeout: DEFAULT_START_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// Rejects settings a listener could never run with.
    pub fn validate(&self) -> Result<(), BindError> {
        if self.port == 0 {
            return Err(BindError::InvalidConfig {
                port: self.port,
                reason: "port must be between 1 and 65535",
            });
        }
        if self.buffer_size == 0 {
            return Err(BindError::InvalidConfig {
                port: self.port,
                reason: "buffer size must be greater than zero",
            });
        }
        if self.backlog == 0 {
            return Err(BindError::InvalidConfig {
                port: self.port,
                reason: "backlog must be greater than zero",
            });
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(about = "Tunnels SSH/OpenVPN traffic behind fake HTTP upgrade responses")]
pub struct Cli {
    /// Port to open; repeat to open several (e.g., --port 80 --port 8080)
    #[arg(long = "port", required = true, value_parser = clap::value_parser!(u16).range(1..))]
    pub ports: Vec<u16>,

    /// Banner text placed after the status code of both responses
    #[arg(long, default_value = DEFAULT_STATUS)]
    pub status: String,

    /// Upstream for SSH (and for clients that send nothing)
    #[arg(long, default_value = "127.0.0.1:22")]
    pub ssh_upstream: Upstream,

    /// Upstream for any other payload
    #[arg(long, default_value = "127.0.0.1:1194")]
    pub alt_upstream: Upstream,

    /// Listen backlog for each bound socket
    #[arg(long, default_value_t = DEFAULT_BACKLOG)]
    pub backlog: u32,

    /// Bind IPv6 and IPv4 separately instead of trying one dual-stack socket first
    #[arg(long)]
    pub no_dual_stack: bool,

    /// Size of each relay read, and of the sniff window
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Bytes discarded after the 101 response
    #[arg(long, default_value_t = DEFAULT_PRECONSUME)]
    pub preconsume: usize,

    /// How long to wait for the first payload bytes
    #[arg(long, default_value = "1s", value_name = "DURATION")]
    pub sniff_timeout: humantime::Duration,

    /// How long to wait for a port to report it is listening
    #[arg(long, default_value = "5s", value_name = "DURATION")]
    pub start_timeout: humantime::Duration,

    /// How long to wait for a port to shut down
    #[arg(long, default_value = "5s", value_name = "DURATION")]
    pub stop_timeout: humantime::Duration,
}

impl Cli {
    /// Template config; the port is filled in per instance by the manager.
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            port: DEFAULT_PORT,
            status: self.status.clone(),
            ssh_upstream: self.ssh_upstream.clone(),
            alt_upstream: self.alt_upstream.clone(),
            backlog: self.backlog,
            dual_stack: !self.no_dual_stack,
            buffer_size: self.buffer_size,
            preconsume: self.preconsume,
            sniff_timeout: self.sniff_timeout.into(),
            start_timeout: self.start_timeout.into(),
            stop_timeout: self.stop_timeout.into(),
        }
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}

// ./target/release/wsproxy --port 80 --port 8080
// RUST_LOG=debug ./target/release/wsproxy --port 8080 --alt-upstream 127.0.0.1:1194 --sniff-timeout 500ms

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_maps_onto_proxy_config() {
        let cli = Cli::parse_from([
            "wsproxy",
            "--port",
            "80",
            "--port",
            "8080",
            "--status",
            "OK",
            "--alt-upstream",
            "10.0.0.2:1195",
            "--no-dual-stack",
            "--sniff-timeout",
            "250ms",
        ]);
        assert_eq!(cli.ports, vec![80, 8080]);

        let config = cli.proxy_config();
        assert_eq!(config.status, "OK");
        assert_eq!(config.ssh_upstream, Upstream::new("127.0.0.1", 22));
        assert_eq!(config.alt_upstream, Upstream::new("10.0.0.2", 1195));
        assert!(!config.dual_stack);
        assert_eq!(config.sniff_timeout, Duration::from_millis(250));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.preconsume, DEFAULT_PRECONSUME);
    }

    #[test]
    fn cli_rejects_port_zero() {
        assert!(Cli::try_parse_from(["wsproxy", "--port", "0"]).is_err());
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.with_port(0).validate().is_err());
        assert!(ProxyConfig {
            buffer_size: 0,
            ..config.clone()
        }
        .validate()
        .is_err());
        assert!(ProxyConfig {
            backlog: 0,
            ..config
        }
        .validate()
        .is_err());
    }

    #[test]
    fn with_port_keeps_everything_else() {
        let config = ProxyConfig {
            status: "banner".to_string(),
            ..ProxyConfig::default()
        };
        let derived = config.with_port(443);
        assert_eq!(derived.port, 443);
        assert_eq!(derived.status, "banner");
        assert_eq!(derived.alt_upstream, config.alt_upstream);
    }
}
