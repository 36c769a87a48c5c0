use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Command-line surface of the proxy. Every option also reads an
/// `XHASH_*` environment variable so container deployments can skip
/// flags entirely.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "xhash-stratum-proxy",
    version,
    about = "Parallax XHash stratum-to-getwork proxy"
)]
pub struct Options {
    /// Node HTTP JSON-RPC URL
    #[arg(long, env = "XHASH_RPC_URL", default_value = "http://127.0.0.1:8545")]
    pub rpc_url: String,

    /// Stratum listen host
    #[arg(long, env = "XHASH_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Stratum listen port
    #[arg(long, env = "XHASH_PORT", default_value_t = 4444)]
    pub port: u16,

    /// Work poll interval in seconds
    #[arg(long, env = "XHASH_POLL", default_value_t = 0.5)]
    pub poll: f64,

    /// Logging level
    #[arg(
        long,
        env = "XHASH_LOG_LEVEL",
        value_enum,
        ignore_case = true,
        default_value = "info"
    )]
    pub log_level: LogLevel,

    /// Status/metrics HTTP listen address; empty disables the listener
    #[arg(long, env = "XHASH_STATUS_LISTEN", default_value = "127.0.0.1:9100")]
    pub status_listen: String,
}

impl Options {
    /// Poll interval as a `Duration`, guarding against nonsense values.
    pub fn poll_interval(&self) -> Duration {
        if self.poll.is_finite() && self.poll > 0.0 {
            Duration::from_secs_f64(self.poll)
        } else {
            Duration::from_secs_f64(0.5)
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = Options::try_parse_from(["xhash-stratum-proxy"]).unwrap();
        assert_eq!(opts.rpc_url, "http://127.0.0.1:8545");
        assert_eq!(opts.host, "0.0.0.0");
        assert_eq!(opts.port, 4444);
        assert_eq!(opts.poll, 0.5);
        assert_eq!(opts.log_level, LogLevel::Info);
        assert_eq!(opts.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_flag_overrides() {
        let opts = Options::try_parse_from([
            "xhash-stratum-proxy",
            "--rpc-url",
            "http://10.0.0.7:8545",
            "--port",
            "14444",
            "--poll",
            "2",
            "--log-level",
            "DEBUG",
        ])
        .unwrap();
        assert_eq!(opts.rpc_url, "http://10.0.0.7:8545");
        assert_eq!(opts.port, 14444);
        assert_eq!(opts.poll_interval(), Duration::from_secs(2));
        assert_eq!(opts.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_bogus_poll_falls_back() {
        let opts = Options::try_parse_from(["xhash-stratum-proxy", "--poll", "0"]).unwrap();
        assert_eq!(opts.poll_interval(), Duration::from_millis(500));

        let opts = Options::try_parse_from(["xhash-stratum-proxy", "--poll", "nan"]).unwrap();
        assert_eq!(opts.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        assert!(Options::try_parse_from(["xhash-stratum-proxy", "--log-level", "verbose"])
            .is_err());
    }
}
