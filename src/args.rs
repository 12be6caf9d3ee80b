use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("{secs} seconds - {e}"))
}

fn parse_message_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>().map_err(|e| format!("{e}"))? {
        0 => Err("must be at least one byte".to_owned()),
        n => Ok(n),
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Parameter set to run from, only read by rank 0
    #[arg(long, short)]
    pub config: Option<PathBuf>,
    /// This process's rank within the ingest group
    #[arg(long, default_value_t = 0)]
    pub rank: usize,
    /// Comms addresses of every rank, in rank order. Omit for a single rank
    #[arg(long, value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,
    /// Port to serve prometheus metrics on
    #[arg(long, default_value_t = 8083)]
    pub metrics_port: u16,
    /// Seconds to wait for peers to come up
    #[arg(long, default_value = "30", value_parser = parse_secs)]
    pub timeout: Duration,
    /// Largest single message the comms layer will send, in bytes
    #[arg(long, default_value_t = crate::comms::DEFAULT_MAX_MESSAGE_SIZE, value_parser = parse_message_size)]
    pub max_message_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["vis_ingest"]).unwrap();
        assert_eq!(cli.timeout, Duration::from_secs(30));
        assert_eq!(cli.max_message_size, crate::comms::DEFAULT_MAX_MESSAGE_SIZE);
        assert!(cli.peers.is_empty());
    }

    #[test]
    fn test_peers_and_timeout() {
        let cli = Cli::try_parse_from([
            "vis_ingest",
            "--rank=1",
            "--peers=127.0.0.1:4000,127.0.0.1:4001",
            "--timeout=2.5",
        ])
        .unwrap();
        assert_eq!(cli.peers.len(), 2);
        assert_eq!(cli.timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_rejects_unusable_numbers() {
        for bad in [
            "--timeout=-1",
            "--timeout=NaN",
            "--timeout=inf",
            "--timeout=soon",
            "--max-message-size=0",
        ] {
            assert!(Cli::try_parse_from(["vis_ingest", bad]).is_err(), "{bad}");
        }
    }
}
