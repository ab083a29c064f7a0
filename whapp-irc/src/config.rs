use std::time::Duration;

use clap::Parser;

/// IRC gateway for WhatsApp-Web-style chat sessions.
#[derive(Parser, Debug, Clone)]
#[command(name = "whapp-irc", version, about)]
pub struct ServerConfig {
    /// IRC listener address.
    #[arg(long, default_value = "127.0.0.1:6060")]
    pub listen_addr: String,

    /// Server name used in IRC messages.
    #[arg(long, default_value = "whapp-irc")]
    pub server_name: String,

    /// SQLite database for user records. Records are kept in memory if unset.
    #[arg(long)]
    pub db_path: Option<String>,

    /// Directory QR codes and relayed media are written to.
    #[arg(long, default_value = "./files")]
    pub files_dir: String,

    /// Public base URL of the files directory.
    #[arg(long, default_value = "http://127.0.0.1:3000/files")]
    pub files_url: String,

    /// Serve the files directory over HTTP on this address.
    #[arg(long)]
    pub files_addr: Option<String>,

    /// Base URL of the browser-automation sidecar.
    #[arg(long, default_value = "http://127.0.0.1:3001")]
    pub platform_url: String,

    /// Seconds to wait for CAP END before finishing negotiation.
    #[arg(long, default_value = "5")]
    pub cap_timeout_secs: u64,

    /// Messages resolved concurrently by the live relay.
    #[arg(long, default_value = "50")]
    pub relay_window: usize,

    /// Milliseconds between login-state and new-message polls.
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6060".to_string(),
            server_name: "whapp-irc".to_string(),
            db_path: None,
            files_dir: "./files".to_string(),
            files_url: "http://127.0.0.1:3000/files".to_string(),
            files_addr: None,
            platform_url: "http://127.0.0.1:3001".to_string(),
            cap_timeout_secs: 5,
            relay_window: 50,
            poll_interval_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn cap_timeout(&self) -> Duration {
        Duration::from_secs(self.cap_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
