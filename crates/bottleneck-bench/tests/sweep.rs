//! Sweep orchestration against the in-memory testbed.

mod common;

use std::path::Path;
use std::time::Duration;

use bottleneck_bench::sweep::{Dimension, SweepConfig, SweepOrchestrator, SUMMARY_CSV, SUMMARY_TXT};
use bottleneck_bench::{RunOrchestrator, SweepError, TopologyKind};
use tokio::sync::watch;

use common::{flow_rtt_ms, FakeTestbed};

fn small_sweep(results: &Path) -> SweepConfig {
    SweepConfig {
        topology: TopologyKind::Dumbbell,
        duration: Duration::from_secs(3),
        hosts: 4,
        results_dir: results.to_path_buf(),
        bandwidths: vec![5.0, 10.0, 20.0],
        losses: vec![0.0, 5.0],
        ..SweepConfig::default()
    }
}

fn read_summary(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().iter().map(String::from).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(String::from).collect())
        .collect();
    (header, rows)
}

#[tokio::test(start_paused = true)]
async fn failed_point_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let config = small_sweep(&tmp.path().join("results"));
    let testbed = FakeTestbed {
        fail_bandwidths: vec![10.0],
        ..FakeTestbed::default()
    };
    let (_tx, rx) = watch::channel(false);
    let mut sweep = SweepOrchestrator::new(RunOrchestrator::new(testbed, rx), config);

    let result = sweep.run_dimension(Dimension::Bandwidth).await.unwrap();

    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.skipped, 1);
    assert_eq!(
        result.summary_path,
        tmp.path().join("results/bw_vary").join(SUMMARY_CSV)
    );

    let (header, rows) = read_summary(&result.summary_path);
    assert_eq!(
        header,
        [
            "bandwidth_mbps",
            "delay",
            "loss_pct",
            "bottleneck1_throughput_mbps",
            "total_throughput_mbps",
            "avg_rtt_ms"
        ]
    );
    let bws: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(bws, ["5", "20"]);
    assert_eq!(rows[1][1], "2ms");
    assert_eq!(rows[1][3], "20");
    assert_eq!(rows[1][4], "20");
    let avg: f64 = rows[0][5].parse().unwrap();
    assert_eq!(avg, (flow_rtt_ms(0) + flow_rtt_ms(1)) / 2.0);

    assert!(tmp
        .path()
        .join("results/bw_vary/bw20_delay2ms_loss2/switches.csv")
        .exists());
}

#[tokio::test(start_paused = true)]
async fn point_without_rtt_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let config = small_sweep(&tmp.path().join("results"));
    let testbed = FakeTestbed {
        failing_hosts: vec!["h0".into(), "h1".into()],
        ..FakeTestbed::default()
    };
    let (_tx, rx) = watch::channel(false);
    let mut sweep = SweepOrchestrator::new(RunOrchestrator::new(testbed, rx), config);

    let result = sweep.run_dimension(Dimension::Loss).await.unwrap();

    assert!(result.rows.is_empty());
    assert_eq!(result.skipped, 2);
    let (header, rows) = read_summary(&result.summary_path);
    assert_eq!(header.len(), 6);
    assert!(rows.is_empty());
}

#[tokio::test(start_paused = true)]
async fn rerun_does_not_reuse_previous_results() {
    let tmp = tempfile::tempdir().unwrap();
    let config = SweepConfig {
        bandwidths: vec![10.0],
        ..small_sweep(&tmp.path().join("results"))
    };
    let (_tx, rx) = watch::channel(false);
    let mut sweep = SweepOrchestrator::new(RunOrchestrator::new(FakeTestbed::default(), rx), config.clone());
    let first = sweep.run_dimension(Dimension::Bandwidth).await.unwrap();
    assert_eq!(first.rows.len(), 1);

    // same point again, every sender fails this time
    let testbed = FakeTestbed {
        failing_hosts: vec!["h0".into(), "h1".into()],
        ..FakeTestbed::default()
    };
    let (_tx, rx) = watch::channel(false);
    let mut sweep = SweepOrchestrator::new(RunOrchestrator::new(testbed, rx), config);
    let second = sweep.run_dimension(Dimension::Bandwidth).await.unwrap();

    assert!(second.rows.is_empty());
    assert_eq!(second.skipped, 1);
    let (_, rows) = read_summary(&second.summary_path);
    assert!(rows.is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_all_writes_combined_table() {
    let tmp = tempfile::tempdir().unwrap();
    let results = tmp.path().join("results");
    let config = small_sweep(&results);
    let (_tx, rx) = watch::channel(false);
    let mut sweep = SweepOrchestrator::new(RunOrchestrator::new(FakeTestbed::default(), rx), config);

    let all = sweep
        .run_all(&[Dimension::Loss, Dimension::Bandwidth])
        .await
        .unwrap();

    assert_eq!(all.len(), 2);
    assert_eq!(all[0].rows.len(), 2);
    assert_eq!(all[1].rows.len(), 3);
    let table = std::fs::read_to_string(results.join(SUMMARY_TXT)).unwrap();
    let loss = table.find("Varying Loss").unwrap();
    let bw = table.find("Varying Bandwidth").unwrap();
    assert!(loss < bw);
    assert!(results.join("loss_vary").join(SUMMARY_CSV).exists());

    let runs = sweep.into_runs();
    assert_eq!(runs.testbed().teardowns(), 5);
}

#[tokio::test(start_paused = true)]
async fn interruption_aborts_the_sweep() {
    let tmp = tempfile::tempdir().unwrap();
    let config = small_sweep(&tmp.path().join("results"));
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let mut sweep = SweepOrchestrator::new(RunOrchestrator::new(FakeTestbed::default(), rx), config);

    let err = sweep.run_all(&Dimension::ALL).await.unwrap_err();

    assert!(matches!(err, SweepError::Interrupted));
    assert!(!tmp.path().join("results/bw_vary").join(SUMMARY_CSV).exists());
    assert!(!tmp.path().join("results").join(SUMMARY_TXT).exists());
}
