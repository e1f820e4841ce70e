//! 中断と再開の結合テスト

mod common;

use std::path::Path;
use std::sync::atomic::AtomicBool;

use common::{GaussianPairs, POTENTIAL, config, setup};
use hdnnp::checkpoint;
use hdnnp::report::{LogReport, Observation};
use hdnnp::{Config, MultiStageOrchestrator, RunSummary, SingleProcess, StopReason, construct_datasets};

fn train(config: &Config, interrupted: bool, resume: Option<&Path>) -> RunSummary {
    let comm = SingleProcess::new(true);
    let flag = AtomicBool::new(interrupted);
    let plan = construct_datasets(
        config,
        &hdnnp::JsonlSource::new(&config.dataset.root),
        &GaussianPairs::new(8),
        &comm,
    )
    .unwrap();
    let mut orchestrator = MultiStageOrchestrator::new(config, &comm, &flag);
    if let Some(dir) = resume {
        orchestrator = orchestrator.with_resume(dir).unwrap();
    }
    orchestrator.run(plan).unwrap()
}

/// 経過時間を除いた比較用のキー
fn comparable(o: &Observation) -> (String, u64, u64, u64, Vec<(String, u64)>) {
    (
        o.tag.clone(),
        o.epoch,
        o.iteration,
        o.lr.to_bits(),
        o.metrics.iter().map(|(k, v)| (k.clone(), v.to_bits())).collect(),
    )
}

#[test]
fn test_resume_matches_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let tags = r#"["A", "B"]"#;

    let straight_out = dir.path().join("straight");
    let straight = train(&config(&s.data, &straight_out, tags, POTENTIAL, 5, 10), false, None);
    assert!(!straight.interrupted);

    // 最初のエポックの終わりで中断
    let config = config(&s.data, &s.out, tags, POTENTIAL, 5, 10);
    let stopped = train(&config, true, None);
    assert!(stopped.interrupted);
    assert!(stopped.model_path.is_none());
    assert_eq!(stopped.stages.len(), 1);
    assert_eq!(stopped.stages[0].reason, StopReason::Interrupted);
    assert_eq!(stopped.stages[0].epochs, 1);
    assert!(!s.out.join("MasterNNP.bin").exists());

    let stage_dir = s.out.join("A");
    let snapshot = checkpoint::read(&stage_dir, "A").unwrap();
    assert_eq!(snapshot.state.epoch, 1);
    assert_eq!(snapshot.state.finished, None);
    assert_eq!(snapshot.result.observation.len(), 1);

    // 写しだけ次のエポックまで進んだ状態でも、スナップショットの結果から再開する
    let mut ahead = snapshot.result.clone();
    let mut extra = ahead.observation[0].clone();
    extra.epoch = 2;
    ahead.observation.push(extra);
    ahead.save(checkpoint::interim_result_path(&stage_dir)).unwrap();

    let resumed = train(&config, false, Some(&stage_dir));
    assert!(!resumed.interrupted);
    assert_eq!(resumed.stages.len(), 2);
    assert!(resumed.stages.iter().all(|s| s.reason == StopReason::MaxEpochReached));

    let expected: Vec<_> = straight.result.observation.iter().map(comparable).collect();
    let actual: Vec<_> = resumed.result.observation.iter().map(comparable).collect();
    assert_eq!(expected, actual);
    assert_eq!(straight.master_digest, resumed.master_digest);
    assert_eq!(
        std::fs::read(straight_out.join("MasterNNP.bin")).unwrap(),
        std::fs::read(s.out.join("MasterNNP.bin")).unwrap()
    );

    // 再開したタグのログは途切れずに 5 行
    let logged = LogReport::in_dir(&stage_dir).read_all().unwrap();
    assert_eq!(logged.iter().map(|o| o.epoch).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_resume_finished_stage_moves_to_next_tag() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let config = config(&s.data, &s.out, r#"["A", "B"]"#, r#"{ name = "zeroth" }"#, 2, 10);

    let full = train(&config, false, None);
    assert_eq!(full.result.observation.len(), 4);

    // A は完了済みのスナップショットを持つので、そのまま B に進む
    let resumed = train(&config, false, Some(&s.out.join("A")));
    assert_eq!(resumed.stages.len(), 2);
    assert_eq!(resumed.stages[0].tag, "A");
    assert_eq!(resumed.stages[0].reason, StopReason::MaxEpochReached);
    assert_eq!(resumed.stages[0].epochs, 2);
    assert_eq!(resumed.result.observation.len(), 4);
}

#[test]
fn test_resume_without_snapshot_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let config = config(&s.data, &s.out, r#"["A"]"#, r#"{ name = "zeroth" }"#, 2, 10);
    std::fs::create_dir_all(s.out.join("A")).unwrap();

    let comm = SingleProcess::new(true);
    let flag = AtomicBool::new(false);
    let plan = construct_datasets(
        &config,
        &hdnnp::JsonlSource::new(&s.data),
        &GaussianPairs::new(8),
        &comm,
    )
    .unwrap();
    let err = MultiStageOrchestrator::new(&config, &comm, &flag)
        .with_resume(&s.out.join("A"))
        .unwrap()
        .run(plan)
        .unwrap_err();
    assert!(matches!(err, hdnnp::Error::CorruptCheckpoint { .. }), "{err}");
}
