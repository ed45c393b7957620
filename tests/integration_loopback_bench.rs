use anyhow::Result;
use clap::Parser;
use stan_bench::{
    cli::BenchArgs, connector_for, BenchmarkConfig, BenchmarkRunner, Connector, Report,
    ResultsManager, RunSummary,
};
use std::time::Duration;

fn bench_args(extra: &[&str]) -> BenchArgs {
    let mut argv = vec!["stan-bench", "-s", "loopback://"];
    argv.extend_from_slice(extra);
    argv.push("bench.subject");
    BenchArgs::parse_from(argv)
}

/// Full run from parsed arguments through the loopback backend to the report
/// and both file exports.
#[tokio::test]
async fn loopback_bench_end_to_end() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let csv = dir.path().join("samples.csv");
    let json = dir.path().join("summary.json");
    let csv_arg = csv.to_string_lossy().to_string();
    let json_arg = json.to_string_lossy().to_string();

    let args = bench_args(&[
        "--np", "4", "--ns", "2", "-n", "1000", "--ms", "64", "--mpa", "32", "--csv", &csv_arg,
        "--json", &json_arg,
    ]);
    let config = BenchmarkConfig::from_args(&args)?;
    let connector = connector_for(args.connect.to_options()?)?;
    let backend = connector.name();
    let runner = BenchmarkRunner::new(config, connector);

    let outcome = tokio::time::timeout(Duration::from_secs(30), runner.run()).await??;
    assert!(outcome.is_success(), "failures: {:?}", outcome.failures);

    assert_eq!(outcome.publishers.count(), 4);
    assert_eq!(outcome.publishers.total_messages(), 1000);
    assert_eq!(outcome.publishers.total_bytes(), 64_000);
    assert_eq!(outcome.subscribers.count(), 2);
    // Every plain subscriber sees every message.
    assert_eq!(outcome.subscribers.total_messages(), 2000);
    assert_eq!(outcome.subscribers.total_bytes(), 128_000);

    let text = Report::from_outcome(&outcome).to_string();
    assert!(text.starts_with("STAN (Publishers/Subscribers) throughput is "));
    assert!(text.contains("(3,000 msgs in "));
    assert!(text.contains("Publisher Stats (4)"));
    assert!(text.contains("Subscriber Stats (2)"));

    let written = ResultsManager::new(Some(&csv), Some(&json)).finalize(
        &outcome,
        runner.config(),
        backend,
    )?;
    assert_eq!(written.len(), 2);

    let csv_text = std::fs::read_to_string(&csv)?;
    let lines: Vec<&str> = csv_text.lines().collect();
    assert_eq!(lines[0], format!("#RunID, {}", outcome.run_id));
    assert_eq!(lines.len(), 2 + 6);
    assert_eq!(lines.iter().filter(|l| l.starts_with("pub,")).count(), 4);
    assert_eq!(lines.iter().filter(|l| l.starts_with("sub,")).count(), 2);

    let summary: RunSummary = serde_json::from_str(&std::fs::read_to_string(&json)?)?;
    assert_eq!(summary.metadata.run_id, outcome.run_id);
    assert_eq!(summary.metadata.backend, "loopback");
    assert_eq!(summary.combined_messages, 3000);
    assert_eq!(summary.publishers.samples.len(), 4);
    assert!(summary.failures.is_empty());
    Ok(())
}

/// Subscribers that ignore old messages still see the whole run, because
/// publishers only start once every subscription is registered.
#[tokio::test]
async fn loopback_bench_new_only_subscribers() -> Result<()> {
    let args = bench_args(&["--np", "2", "--ns", "3", "-n", "200", "--io", "--sync"]);
    let config = BenchmarkConfig::from_args(&args)?;
    let runner = BenchmarkRunner::new(config, connector_for(args.connect.to_options()?)?);

    let outcome = tokio::time::timeout(Duration::from_secs(30), runner.run()).await??;
    assert!(outcome.is_success());
    assert_eq!(outcome.subscribers.total_messages(), 600);
    for sample in outcome.subscribers.samples() {
        assert_eq!(sample.msg_count(), 200);
        assert_eq!(sample.job_msg_count(), 200);
    }
    Ok(())
}

/// Zero-byte payloads are allowed and produce zero byte throughput.
#[tokio::test]
async fn loopback_bench_empty_payloads() -> Result<()> {
    let args = bench_args(&["--np", "1", "-n", "50", "--ms", "0"]);
    let config = BenchmarkConfig::from_args(&args)?;
    let runner = BenchmarkRunner::new(config, connector_for(args.connect.to_options()?)?);

    let outcome = runner.run().await?;
    assert!(outcome.is_success());
    assert_eq!(outcome.publishers.total_messages(), 50);
    assert_eq!(outcome.publishers.total_bytes(), 0);
    Ok(())
}
