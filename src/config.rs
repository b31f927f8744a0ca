use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;

/// knobs shared by the swarm and every session it spawns.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// sessions kept alive at the same time.
    pub max_peers: usize,
    /// requests one session keeps in flight.
    pub pipeline_limit: usize,
    pub request_timeout: Duration,
    /// covers the tcp connect and the handshake exchange, each.
    pub connect_timeout: Duration,
    /// how often one address is tried before it is given up on.
    pub max_connect_attempts: u32,
    pub keepalive_interval: Duration,
    pub output_dir: PathBuf,
    /// port reported to the tracker.
    pub port: u16,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_peers: 30,
            pipeline_limit: 5,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_connect_attempts: 3,
            keepalive_interval: Duration::from_secs(90),
            output_dir: PathBuf::from("."),
            port: 8860,
        }
    }
}

impl From<&Cli> for SwarmConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            max_peers: cli.max_peers as usize,
            pipeline_limit: cli.pipeline as usize,
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            max_connect_attempts: cli.connect_attempts,
            keepalive_interval: Duration::from_secs(cli.keepalive_secs),
            output_dir: cli.output.clone(),
            port: cli.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use clap::Parser;

    #[rstest]
    fn test_cli_defaults_match_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("file.torrent");
        std::fs::write(&source, b"d4:infodee").unwrap();

        let cli = Cli::try_parse_from(["crux-swarm", source.to_str().unwrap()]).unwrap();
        let config = SwarmConfig::from(&cli);
        let default = SwarmConfig::default();

        assert_eq!(config.max_peers, default.max_peers);
        assert_eq!(config.pipeline_limit, default.pipeline_limit);
        assert_eq!(config.request_timeout, default.request_timeout);
        assert_eq!(config.connect_timeout, default.connect_timeout);
        assert_eq!(config.max_connect_attempts, default.max_connect_attempts);
        assert_eq!(config.keepalive_interval, default.keepalive_interval);
        assert_eq!(config.port, default.port);
    }

    #[rstest]
    fn test_zero_pipeline_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("file.torrent");
        std::fs::write(&source, b"d4:infodee").unwrap();

        let parsed = Cli::try_parse_from([
            "crux-swarm",
            source.to_str().unwrap(),
            "--pipeline",
            "0",
        ]);
        assert!(parsed.is_err());
    }
}
