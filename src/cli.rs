use crate::client::{ConnectOptions, StartPosition, TlsOptions};
use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server connection options shared by every utility
#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Server URL(s), comma separated (loopback:// runs against an in-process broker)
    #[clap(short = 's', long = "server", default_value = crate::defaults::SERVER, help_heading = "Connection")]
    pub servers: String,

    /// Cluster ID, informational: it names the loopback broker and appears in logs, core NATS has none
    #[clap(short = 'c', long = "cluster", default_value = crate::defaults::CLUSTER_ID, help_heading = "Connection")]
    pub cluster_id: String,

    /// User credentials file
    #[clap(long, help_heading = "Connection")]
    pub creds: Option<PathBuf>,

    /// Directory holding trusted CA certificates (*.pem)
    #[clap(long = "cd", help_heading = "Connection")]
    pub cert_dir: Option<PathBuf>,

    /// Client certificate file
    #[clap(long = "cf", requires = "client_key", help_heading = "Connection")]
    pub client_cert: Option<PathBuf>,

    /// Client private key file
    #[clap(long = "ck", requires = "client_cert", help_heading = "Connection")]
    pub client_key: Option<PathBuf>,

    /// User name
    #[clap(short = 'u', long = "user", help_heading = "Connection")]
    pub user: Option<String>,

    /// Password
    #[clap(long = "pw", requires = "user", help_heading = "Connection")]
    pub password: Option<String>,
}

impl ConnectArgs {
    /// Build and validate connect options
    ///
    /// Certificate directories are expanded to the `*.pem` files they
    /// contain, in file-name order.
    pub fn to_options(&self) -> Result<ConnectOptions> {
        let mut options = ConnectOptions::new(&self.servers, self.cluster_id.clone());
        options.creds_file = self.creds.clone();
        options.user_password = self
            .user
            .clone()
            .map(|user| (user, self.password.clone().unwrap_or_default()));

        let root_certificates = match &self.cert_dir {
            Some(dir) => pem_files(dir)?,
            None => Vec::new(),
        };
        let client_certificate = self.client_cert.clone().zip(self.client_key.clone());
        if !root_certificates.is_empty() || client_certificate.is_some() {
            options.tls = Some(TlsOptions {
                root_certificates,
                client_certificate,
            });
        }

        options.validate()?;
        Ok(options)
    }
}

fn pem_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read certificate directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |ext| ext == "pem") {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(anyhow!("No *.pem files found in {}", dir.display()));
    }
    files.sort();
    Ok(files)
}

/// Logging verbosity and destination
#[derive(Args, Debug, Clone, Default)]
pub struct LogArgs {
    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long = "verbose", action = ArgAction::Count, help_heading = "Logging")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, conflicts_with = "verbose", help_heading = "Logging")]
    pub quiet: bool,

    /// Also write logs to this file
    #[clap(long, help_heading = "Logging")]
    pub log_file: Option<PathBuf>,
}

/// Streaming pub/sub throughput benchmark
#[derive(Parser, Debug)]
#[clap(name = "stan-bench", version, about, long_about = None)]
pub struct BenchArgs {
    /// Subject to publish and subscribe on
    pub subject: String,

    #[clap(flatten)]
    pub connect: ConnectArgs,

    /// Client ID prefix; workers are named <id>-pub-N and <id>-sub-N
    #[clap(long = "id", default_value = crate::defaults::CLIENT_ID, help_heading = "Core Options")]
    pub client_id: String,

    /// Number of concurrent publishers
    #[clap(long = "np", default_value_t = crate::defaults::NUM_PUBS, help_heading = "Core Options")]
    pub num_pubs: usize,

    /// Number of concurrent subscribers
    #[clap(long = "ns", default_value_t = crate::defaults::NUM_SUBS, help_heading = "Core Options")]
    pub num_subs: usize,

    /// Total number of messages to publish, split across publishers
    #[clap(short = 'n', long = "count", default_value_t = crate::defaults::NUM_MSGS, help_heading = "Core Options")]
    pub num_msgs: u64,

    /// Size of each message payload in bytes
    #[clap(long = "ms", default_value_t = crate::defaults::MESSAGE_SIZE, help_heading = "Core Options")]
    pub message_size: usize,

    /// Publish synchronously, waiting for each acknowledgment
    #[clap(long, default_value_t = false, help_heading = "Publishing")]
    pub sync: bool,

    /// Maximum number of unacknowledged async publishes per publisher
    #[clap(long = "mpa", default_value_t = crate::defaults::MAX_PUB_ACKS_INFLIGHT, help_heading = "Publishing")]
    pub max_pub_acks_inflight: usize,

    /// How long to wait for an outstanding acknowledgment (e.g. 500ms, 5s)
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::ACK_WAIT, help_heading = "Publishing")]
    pub ack_wait: Duration,

    /// Subscribers only receive new messages instead of all stored ones
    #[clap(long = "io", default_value_t = false, help_heading = "Subscribing")]
    pub ignore_old: bool,

    /// Queue group shared by all subscribers
    #[clap(long = "qgroup", help_heading = "Subscribing")]
    pub queue_group: Option<String>,

    /// Write per-worker samples to this CSV file
    #[clap(long, help_heading = "Output")]
    pub csv: Option<PathBuf>,

    /// Write the run summary to this JSON file
    #[clap(long, help_heading = "Output")]
    pub json: Option<PathBuf>,

    #[clap(flatten)]
    pub log: LogArgs,
}

/// Publish one message to a subject
#[derive(Parser, Debug)]
#[clap(name = "stan-pub", version, about, long_about = None)]
pub struct PubArgs {
    /// Subject to publish on
    pub subject: String,

    /// Message payload
    pub message: String,

    #[clap(flatten)]
    pub connect: ConnectArgs,

    /// Client ID
    #[clap(long = "id", default_value = "stan-pub")]
    pub client_id: String,

    /// Publish asynchronously and wait for the acknowledgment separately
    #[clap(short = 'a', long = "async", default_value_t = false)]
    pub async_publish: bool,

    /// How long to wait for the acknowledgment
    #[clap(long, value_parser = parse_duration, default_value = crate::defaults::ACK_WAIT)]
    pub ack_wait: Duration,

    #[clap(flatten)]
    pub log: LogArgs,
}

/// Subscribe to a subject and print every message
#[derive(Parser, Debug)]
#[clap(name = "stan-sub", version, about, long_about = None)]
pub struct SubArgs {
    /// Subject to subscribe to
    pub subject: String,

    #[clap(flatten)]
    pub connect: ConnectArgs,

    /// Client ID
    #[clap(long = "id", default_value = "stan-sub")]
    pub client_id: String,

    /// Queue group name
    #[clap(long = "qgroup")]
    pub queue_group: Option<String>,

    /// Start at this sequence number
    #[clap(long = "seq", conflicts_with_all = ["all", "last", "since"])]
    pub start_seq: Option<u64>,

    /// Deliver all stored messages
    #[clap(long, conflicts_with_all = ["last", "since"])]
    pub all: bool,

    /// Start with the last stored message
    #[clap(long, conflicts_with = "since")]
    pub last: bool,

    /// Deliver messages stored within this duration (e.g. 30s, 10m, 1h)
    #[clap(long, value_parser = parse_duration)]
    pub since: Option<Duration>,

    /// Prefix each printed message with its timestamp
    #[clap(short = 't', long = "timestamps", default_value_t = false)]
    pub timestamps: bool,

    #[clap(flatten)]
    pub log: LogArgs,
}

impl SubArgs {
    pub fn start_position(&self) -> StartPosition {
        if let Some(seq) = self.start_seq {
            StartPosition::Sequence(seq)
        } else if self.last {
            StartPosition::LastReceived
        } else if self.all {
            StartPosition::AllAvailable
        } else if let Some(delta) = self.since {
            StartPosition::TimeDelta(delta)
        } else {
            StartPosition::NewOnly
        }
    }
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1_000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn test_bench_defaults() {
        let args = BenchArgs::try_parse_from(["stan-bench", "foo"]).unwrap();
        assert_eq!(args.subject, "foo");
        assert_eq!(args.num_pubs, 10);
        assert_eq!(args.num_subs, 0);
        assert_eq!(args.num_msgs, 100_000);
        assert_eq!(args.message_size, 128);
        assert_eq!(args.max_pub_acks_inflight, 512);
        assert_eq!(args.ack_wait, Duration::from_secs(5));
        assert_eq!(args.client_id, "benchmark");
        assert_eq!(args.connect.cluster_id, "test-cluster");
        assert!(!args.sync);
        assert!(!args.ignore_old);
        assert_eq!(args.log.verbose, 0);
    }

    #[test]
    fn test_bench_flags() {
        let args = BenchArgs::try_parse_from([
            "stan-bench", "-s", "loopback://", "-c", "prod", "--np", "3", "--ns", "2", "-n",
            "1000", "--ms", "0", "--sync", "--io", "--qgroup", "workers", "--mpa", "16",
            "--ack-wait", "250ms", "-vv", "bar",
        ])
        .unwrap();
        assert_eq!(args.connect.servers, "loopback://");
        assert_eq!(args.connect.cluster_id, "prod");
        assert_eq!(args.connect.to_options().unwrap().cluster_id, "prod");
        assert_eq!((args.num_pubs, args.num_subs, args.num_msgs), (3, 2, 1000));
        assert_eq!(args.message_size, 0);
        assert!(args.sync && args.ignore_old);
        assert_eq!(args.queue_group.as_deref(), Some("workers"));
        assert_eq!(args.max_pub_acks_inflight, 16);
        assert_eq!(args.ack_wait, Duration::from_millis(250));
        assert_eq!(args.log.verbose, 2);
    }

    #[test]
    fn test_missing_subject_is_usage_error() {
        assert!(BenchArgs::try_parse_from(["stan-bench"]).is_err());
        assert!(PubArgs::try_parse_from(["stan-pub", "foo"]).is_err());
    }

    #[test]
    fn test_client_cert_requires_key() {
        assert!(BenchArgs::try_parse_from(["stan-bench", "--cf", "cert.pem", "foo"]).is_err());
        assert!(BenchArgs::try_parse_from([
            "stan-bench", "--cf", "cert.pem", "--ck", "key.pem", "foo"
        ])
        .is_ok());
    }

    #[test]
    fn test_tls_url_without_certificates_rejected() {
        let args = BenchArgs::try_parse_from(["stan-bench", "-s", "tls://demo:4443", "foo"]).unwrap();
        assert!(args.connect.to_options().is_err());

        let args = BenchArgs::try_parse_from([
            "stan-bench", "-s", "tls://demo:4443", "--cf", "c.pem", "--ck", "k.pem", "foo",
        ])
        .unwrap();
        let options = args.connect.to_options().unwrap();
        let tls = options.tls.unwrap();
        assert_eq!(
            tls.client_certificate,
            Some((PathBuf::from("c.pem"), PathBuf::from("k.pem")))
        );
    }

    #[test]
    fn test_cert_dir_collects_pem_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.pem"), "b").unwrap();
        std::fs::write(dir.path().join("a.pem"), "a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let files = pem_files(dir.path()).unwrap();
        assert_eq!(files, vec![dir.path().join("a.pem"), dir.path().join("b.pem")]);

        let empty = tempfile::tempdir().unwrap();
        assert!(pem_files(empty.path()).is_err());
    }

    #[test]
    fn test_user_password() {
        let args =
            BenchArgs::try_parse_from(["stan-bench", "-u", "derek", "--pw", "s3cret", "foo"]).unwrap();
        let options = args.connect.to_options().unwrap();
        assert_eq!(
            options.user_password,
            Some(("derek".to_string(), "s3cret".to_string()))
        );
    }

    #[test]
    fn test_sub_start_position() {
        let parse = |extra: &[&str]| {
            let mut argv = vec!["stan-sub"];
            argv.extend_from_slice(extra);
            argv.push("foo");
            SubArgs::try_parse_from(argv).unwrap().start_position()
        };
        assert_eq!(parse(&[]), StartPosition::NewOnly);
        assert_eq!(parse(&["--all"]), StartPosition::AllAvailable);
        assert_eq!(parse(&["--last"]), StartPosition::LastReceived);
        assert_eq!(parse(&["--seq", "42"]), StartPosition::Sequence(42));
        assert_eq!(
            parse(&["--since", "30s"]),
            StartPosition::TimeDelta(Duration::from_secs(30))
        );
        assert!(SubArgs::try_parse_from(["stan-sub", "--seq", "1", "--all", "foo"]).is_err());
    }
}
