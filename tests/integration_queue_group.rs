use anyhow::Result;
use stan_bench::{BenchmarkConfig, BenchmarkRunner, LoopbackBroker};
use std::sync::Arc;
use std::time::Duration;

fn queue_config(num_pubs: usize, num_subs: usize, num_msgs: u64) -> BenchmarkConfig {
    BenchmarkConfig {
        subject: "jobs".to_string(),
        num_pubs,
        num_subs,
        num_msgs,
        message_size: 32,
        sync: false,
        ignore_old: true,
        max_pub_acks_inflight: 64,
        ack_wait: Duration::from_secs(5),
        queue_group: Some("workers".to_string()),
        client_id: "qbench".to_string(),
    }
}

/// Two queue-group members share 100 messages. Only one of them observes the
/// group total; the other must be released by the sentinel instead of
/// waiting forever.
#[tokio::test]
async fn queue_group_two_members_complete() -> Result<()> {
    let broker = Arc::new(LoopbackBroker::new("test-cluster"));
    let runner = BenchmarkRunner::new(queue_config(1, 2, 100), broker.clone());

    let outcome = tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .expect("queue group members deadlocked")?;

    assert!(outcome.is_success(), "failures: {:?}", outcome.failures);
    assert_eq!(outcome.subscribers.count(), 2);
    // Sentinels are not counted as payload.
    assert_eq!(outcome.subscribers.total_messages(), 100);
    assert_eq!(outcome.subscribers.total_bytes(), 3200);
    assert_eq!(outcome.publishers.total_messages(), 100);
    assert_eq!(broker.subscriber_count("jobs"), 0);
    Ok(())
}

/// With more members than a single sentinel can wake, every departing
/// member hands the sentinel on until the group is empty.
#[tokio::test]
async fn queue_group_many_members_complete() -> Result<()> {
    let broker = Arc::new(LoopbackBroker::new("test-cluster"));
    let runner = BenchmarkRunner::new(queue_config(3, 5, 1000), broker);

    let outcome = tokio::time::timeout(Duration::from_secs(10), runner.run())
        .await
        .expect("queue group members deadlocked")?;

    assert!(outcome.is_success(), "failures: {:?}", outcome.failures);
    assert_eq!(outcome.subscribers.count(), 5);
    assert_eq!(outcome.subscribers.total_messages(), 1000);
    Ok(())
}
