use std::path::PathBuf;
use std::time::Duration;

/// Default TCP port the capture service listens on.
pub const DEFAULT_SERVICE_PORT: u16 = 5001;

/// Default TCP port of the container discovery service.
pub const DEFAULT_DISCOVERY_PORT: u16 = 5000;

/// Maximum amount of time to wait for the container discovery service to
/// respond.
pub const DISCOVERY_DEADLINE: Duration = Duration::from_secs(20);

/// Maximum amount of time a (graceful) websocket closing procedure may take.
pub const CLOSING_DEADLINE: Duration = Duration::from_secs(10);

/// Location of the packet capture program.
pub const CAPTURE_PROGRAM: &str = "/usr/bin/dumpcap";

/// Prefix used by the capture program on stderr lines that carry an actual
/// error message (as opposed to mere chatter).
pub const STDERR_CAPTURE_PREFIX: &str = "dumpcap: ";

/// Request header telling the discovery service frontend to enable its
/// capture UI when proxied through us.
pub const CAPTURE_ENABLE_HEADER: &str = "Enable-Monolith";

/// Maximum octets of a websocket close frame reason: 125 octets of control
/// frame payload minus the 2-octet status code.
pub const CLOSE_REASON_MAX: usize = 123;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port to expose the capture service on.
    pub port: u16,
    /// Host name or address of the discovery service.
    pub discovery_host: String,
    /// Port of the discovery service.
    pub discovery_port: u16,
    /// Reverse proxy unmatched paths to the discovery service.
    pub proxy_discovery: bool,
    /// Log frontend HTTP/WS requests.
    pub log_requests: bool,
    /// Log frontend HTTP/WS request headers (implies request logging).
    pub log_headers: bool,
    /// Packet capture program to spawn inside target network namespaces.
    pub capture_program: PathBuf,
    /// Root of the proc filesystem; tests point this at fixtures.
    pub proc_root: PathBuf,
}

impl Config {
    /// Base URL of the discovery service.
    pub fn discovery_url(&self) -> String {
        format!("http://{}:{}", self.discovery_host, self.discovery_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERVICE_PORT,
            discovery_host: "127.0.0.1".into(),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            proxy_discovery: false,
            log_requests: false,
            log_headers: false,
            capture_program: PathBuf::from(CAPTURE_PROGRAM),
            proc_root: PathBuf::from("/proc"),
        }
    }
}
