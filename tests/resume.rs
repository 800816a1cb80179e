mod common;

use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use common::{config, shop, CountingConverter, ScriptedSource, Step};
use harvest::checkpoint::{scan_dir, CheckpointStore};
use harvest::dedup::ProcessedSet;
use harvest::interrupt::InterruptController;
use harvest::record::keys;
use harvest::{Fingerprint, Orchestrator, RunOutcome};

fn stream() -> Vec<harvest::Record> {
    // 30 shops, every fifth one seen twice.
    let mut records = Vec::new();
    for i in 0..30 {
        records.push(shop(i));
        if i % 5 == 0 {
            records.push(shop(i));
        }
    }
    records
}

fn shop_no(record: &harvest::Record) -> usize {
    record.text(keys::PLACE_ID).unwrap()[1..].parse().unwrap()
}

fn orchestrator(cfg: harvest::HarvestConfig) -> Orchestrator {
    let interrupts = InterruptController::new(&cfg.interrupt);
    Orchestrator::new(cfg, interrupts).with_converter(Box::new(CountingConverter::default()))
}

fn checkpointed(dir: &std::path::Path, run: &str) -> (Vec<Fingerprint>, HashSet<Fingerprint>) {
    let store = CheckpointStore::open(&dir.join("checkpoints"), run, ProcessedSet::new()).unwrap();
    let all: Vec<Fingerprint> = store
        .latest_snapshot()
        .unwrap()
        .into_iter()
        .map(|r| r.fingerprint.unwrap())
        .collect();
    let unique = scan_dir(store.dir()).unwrap().fingerprints;
    (all, unique)
}

#[tokio::test(start_paused = true)]
async fn restart_matches_single_run() {
    let once = tempfile::tempdir().unwrap();
    let summary = orchestrator(config(once.path(), "shops"))
        .run(&mut ScriptedSource::records(stream()))
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.accepted, 30);
    assert_eq!(summary.duplicates, 6);

    // Same stream, cut short after 12 new records, then replayed from the start.
    let twice = tempfile::tempdir().unwrap();
    let mut first = config(twice.path(), "shops");
    first.max_records = Some(12);
    let partial = orchestrator(first)
        .run(&mut ScriptedSource::records(stream()))
        .await
        .unwrap();
    assert_eq!(partial.accepted, 12);

    let resumed = orchestrator(config(twice.path(), "shops"))
        .run(&mut ScriptedSource::records(stream()))
        .await
        .unwrap();
    assert_eq!(resumed.resumed, 12);
    assert_eq!(resumed.accepted, 18);

    let (all_once, unique_once) = checkpointed(once.path(), "shops");
    let (all_twice, unique_twice) = checkpointed(twice.path(), "shops");
    assert_eq!(all_once.len(), 30);
    assert_eq!(all_twice.len(), 30);
    assert_eq!(unique_once, unique_twice);
    assert_eq!(all_once, all_twice);
}

#[tokio::test(start_paused = true)]
async fn lost_batch_is_recollected_on_restart() {
    let once = tempfile::tempdir().unwrap();
    orchestrator(config(once.path(), "shops"))
        .run(&mut ScriptedSource::records(stream()))
        .await
        .unwrap();

    // First run: shops 0..9 reach a checkpoint, then the run directory goes
    // away and the batch holding shops 10..14 is dropped.
    let twice = tempfile::tempdir().unwrap();
    let run_dir = twice.path().join("checkpoints").join("shops");
    let moved = twice.path().join("shops.moved");
    let (head, tail): (Vec<_>, Vec<_>) = stream().into_iter().partition(|r| shop_no(r) < 10);
    let (from, to) = (run_dir.clone(), moved.clone());
    let mut steps: Vec<Step> = head.into_iter().map(Step::Yield).collect();
    steps.push(Step::Pause(Duration::from_secs(1)));
    steps.push(Step::Then(Box::new(move || fs::rename(&from, &to).unwrap())));
    steps.extend(tail.into_iter().filter(|r| shop_no(r) < 15).map(Step::Yield));
    let crashed = orchestrator(config(twice.path(), "shops"))
        .run(&mut ScriptedSource::new(steps))
        .await
        .unwrap();
    assert_eq!(crashed.accepted, 15);
    assert_eq!(crashed.worker.records, 10);
    assert_eq!(crashed.worker.dropped_records, 5);
    fs::rename(&moved, &run_dir).unwrap();

    let (persisted, _) = checkpointed(twice.path(), "shops");
    assert_eq!(persisted.len(), 10);

    let resumed = orchestrator(config(twice.path(), "shops"))
        .run(&mut ScriptedSource::records(stream()))
        .await
        .unwrap();
    assert_eq!(resumed.resumed, 10);
    assert_eq!(resumed.accepted, 20);

    let (all_once, unique_once) = checkpointed(once.path(), "shops");
    let (all_twice, unique_twice) = checkpointed(twice.path(), "shops");
    let lost: HashSet<Fingerprint> = (10..15).map(|i| Fingerprint::new(format!("id:p{i}"))).collect();
    assert!(lost.is_subset(&unique_twice));
    assert!(persisted.iter().all(|fp| !lost.contains(fp)));
    assert_eq!(all_twice.len(), unique_twice.len());
    assert_eq!(unique_once, unique_twice);
    assert_eq!(all_once, all_twice);
}

#[tokio::test(start_paused = true)]
async fn torn_tail_does_not_block_resume() {
    let dir = tempfile::tempdir().unwrap();
    orchestrator(config(dir.path(), "shops"))
        .run(&mut ScriptedSource::records((0..5).map(shop)))
        .await
        .unwrap();

    let run_dir = dir.path().join("checkpoints").join("shops");
    let (_, path) = harvest::checkpoint::checkpoint_files(&run_dir).unwrap().pop().unwrap();
    let mut text = std::fs::read_to_string(&path).unwrap();
    text.push_str("{\"_id\":\"id:p99\",\"na");
    std::fs::write(&path, text).unwrap();

    let summary = orchestrator(config(dir.path(), "shops"))
        .run(&mut ScriptedSource::records((0..7).map(shop)))
        .await
        .unwrap();
    assert_eq!(summary.resumed, 5);
    assert_eq!(summary.corrupt_lines, 1);
    assert_eq!(summary.accepted, 2);
}
