use chrono::{TimeZone, Utc};
use stan_bench::{Aggregator, Report, Role, Sample, StatsError};
use std::time::Duration;

/// Three publishers, each sending 1000 messages of 128 bytes in one second.
#[test]
fn three_publisher_scenario() {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let end = start + chrono::Duration::seconds(1);

    let mut publishers = Aggregator::new(Role::Publisher);
    for i in 0..3 {
        publishers.add_sample(
            Sample::new(start, end, 1000, 128_000).with_client(format!("benchmark-pub-{}", i), 1000),
        );
    }
    let subscribers = Aggregator::new(Role::Subscriber);

    assert_eq!(publishers.total_messages(), 3000);
    assert_eq!(publishers.total_bytes(), 384_000);
    assert_eq!(publishers.combined_rate(), Ok(3000.0));

    let stats = publishers.rate_statistics().unwrap();
    assert_eq!(stats.min, 1000.0);
    assert_eq!(stats.max, 1000.0);
    assert_eq!(stats.average, 1000.0);
    assert_eq!(stats.stddev, 0.0);

    let report = Report::new(&publishers, &subscribers, Duration::from_secs(1));
    assert_eq!(report.combined_messages(), 3000);
    assert_eq!(report.combined_rate(), Ok(3000.0));

    let expected = "\
STAN (Publishers/Subscribers) throughput is 3,000 msgs/sec (3,000 msgs in 1.00s)
Publisher Stats (3) 3,000 msgs/sec | 3,000 msgs in 1.00s | 375.00 KiB/sec
  [1] 1,000 msgs/sec | 1,000 msgs in 1.00s | 125.00 KiB/sec
  [2] 1,000 msgs/sec | 1,000 msgs in 1.00s | 125.00 KiB/sec
  [3] 1,000 msgs/sec | 1,000 msgs in 1.00s | 125.00 KiB/sec
  min 1,000 | avg 1,000 | max 1,000 | stddev 0 msgs
";
    assert_eq!(report.to_string(), expected);
}

/// Rates {10, 20, 30} reduce to the population statistics.
#[test]
fn spread_of_rates() {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap();
    let end = start + chrono::Duration::seconds(1);

    let mut subscribers = Aggregator::new(Role::Subscriber);
    for msgs in [10, 20, 30] {
        subscribers.add_sample(Sample::new(start, end, msgs, msgs * 100));
    }
    let publishers = Aggregator::new(Role::Publisher);

    let text = Report::new(&publishers, &subscribers, Duration::from_secs(1)).to_string();
    assert!(text.contains("Subscriber Stats (3) 60 msgs/sec | 60 msgs in 1.00s"));
    assert!(text.contains("  min 10 | avg 20 | max 30 | stddev 8 msgs"));
    assert!(!text.contains("Publisher Stats"));

    let stddev = subscribers.stddev_rate().unwrap();
    assert!((stddev - 8.1650).abs() < 1e-4);
}

#[test]
fn empty_roles_fail_explicitly() {
    let publishers = Aggregator::new(Role::Publisher);
    assert_eq!(publishers.min_rate(), Err(StatsError::EmptyAggregator));
    assert_eq!(publishers.stddev_rate(), Err(StatsError::EmptyAggregator));
    assert_eq!(
        publishers.combined_duration().err(),
        Some(StatsError::EmptyAggregator)
    );
}
