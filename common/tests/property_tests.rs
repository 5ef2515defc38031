// Property-based tests for the common library

use chrono::{TimeZone, Utc};
use common::config::Settings;
use common::datacenter::{dedup, DataCenterConfig};
use common::job::{create_job_from_task, job_hash, split_command};
use common::lock::lock_ttl;
use common::models::{ConfigUnit, ConfigValue, JobKind, RunMode, Shell, Task, TaskTemplate};
use common::store::MemoryStore;
use proptest::prelude::*;
use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn cycle_task(timer: &str, kind: JobKind) -> Task {
    let mut task = Task::new(
        "t",
        TaskTemplate {
            shell: Shell {
                cmd: vec!["true".to_string()],
            },
            ..Default::default()
        },
    );
    task.run_mode = RunMode::Cycle;
    task.timer = timer.to_string();
    task.kind = kind;
    task
}

proptest! {
    /// The job hash depends only on the (task, node) pair.
    #[test]
    fn property_hash_is_deterministic(task in "[a-z0-9-]{1,16}", node in "[a-z0-9-]{1,16}") {
        let hash = job_hash(&task, &node);
        prop_assert_eq!(hash.len(), 64);
        prop_assert_eq!(&hash, &job_hash(&task, &node));
        prop_assert!(hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')));
    }

    /// Two nodes never share the hash of the same task.
    #[test]
    fn property_hash_separates_nodes(task in "[a-z]{1,8}", a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
        prop_assume!(a != b);
        prop_assert_ne!(job_hash(&task, &a), job_hash(&task, &b));
    }

    /// An empty average takes the sample as is, later samples are halved in.
    #[test]
    fn property_avg_time_update(samples in prop::collection::vec(0i64..100_000, 1..20)) {
        let mut job = create_job_from_task(&cycle_task("@every 10s", JobKind::Common), "n1").unwrap();
        let mut expected = 0i64;
        for sample in &samples {
            job.update_avg_time(*sample);
            expected = if expected == 0 { *sample } else { (expected + sample) / 2 };
            prop_assert_eq!(job.avg_time, expected);
        }
        let max = *samples.iter().max().unwrap();
        prop_assert!(job.avg_time <= max);
    }

    /// Lock TTLs stay within [2, max] for common/alone cycle jobs and
    /// within [1, max] for interval jobs.
    #[test]
    fn property_lock_ttl_bounds(
        every in 1u32..7200,
        avg_ms in 0i64..10_000_000,
        max_ttl in 2i64..1200,
        interval in any::<bool>(),
        offset in 0i64..86_400,
    ) {
        let kind = if interval { JobKind::Interval } else { JobKind::Alone };
        let mut job = create_job_from_task(&cycle_task(&format!("@every {}s", every), kind), "n1").unwrap();
        job.avg_time = avg_ms;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(offset);

        let ttl = lock_ttl(&job, now, max_ttl);
        prop_assert!(ttl <= max_ttl);
        if interval {
            prop_assert!(ttl >= 1);
        } else {
            prop_assert!(ttl >= 2);
        }
    }

    /// Whitespace splitting never yields empty arguments and keeps order.
    #[test]
    fn property_split_command(words in prop::collection::vec("[a-zA-Z0-9_./=-]{1,8}", 1..8), gap in "[ \t]{1,3}") {
        let line = words.join(&gap);
        let (program, args) = split_command(&line).unwrap();
        prop_assert_eq!(&program, &words[0]);
        prop_assert_eq!(args, words[1..].to_vec());
    }

    /// Deduplication keeps the first occurrence of each value in order.
    #[test]
    fn property_dedup_preserves_first_occurrence(values in prop::collection::vec("[a-c]{1,2}", 0..20)) {
        let deduped = dedup(values.clone());
        let unique: HashSet<&String> = values.iter().collect();
        prop_assert_eq!(deduped.len(), unique.len());
        let mut seen = HashSet::new();
        let expected: Vec<String> = values.into_iter().filter(|v| seen.insert(v.clone())).collect();
        prop_assert_eq!(deduped, expected);
    }
}

/// Array config values accumulate without duplicates, across any split of
/// the inputs.
#[test]
fn property_config_merge_is_a_set_union() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    proptest!(|(
        first in prop::collection::vec("[a-d]", 1..6),
        second in prop::collection::vec("[a-d]", 1..6),
    )| {
        let merged = runtime.block_on(async {
            let dc = DataCenterConfig::new(Arc::new(MemoryStore::new()), "/fleet/config/global").unwrap();
            dc.put_config(ConfigUnit::array("HOSTS", first.clone())).await.unwrap();
            dc.put_config(ConfigUnit::array("HOSTS", second.clone())).await.unwrap();
            dc.get_config("HOSTS").unwrap().value
        });
        let mut all = first.clone();
        all.extend(second.clone());
        prop_assert_eq!(merged, ConfigValue::Array(dedup(all)));
    });
}

/// Values written to `default.toml` override the built-in defaults.
#[test]
fn property_config_file_overrides_defaults() {
    proptest!(|(
        capacity in 1usize..10_000,
        requeue in 1u64..60_000,
        node in "[a-z][a-z0-9-]{0,10}",
    )| {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            format!(
                "[node]\nid = \"{}\"\n\n[scheduler]\nqueue_capacity = {}\nnext_timeout_ms = 5000\nrequeue_delay_ms = {}\nmaster_lease_ttl_seconds = 10\n",
                node, capacity, requeue
            ),
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        prop_assert_eq!(&settings.node.id, &node);
        prop_assert_eq!(settings.scheduler.queue_capacity, capacity);
        prop_assert_eq!(settings.scheduler.requeue_delay_ms, requeue);
        prop_assert!(settings.validate().is_ok());
    });
}
