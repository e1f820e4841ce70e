//! 複数ランクでの結合テスト

mod common;

use std::sync::atomic::AtomicBool;

use common::{GaussianPairs, POTENTIAL, config, setup};
use hdnnp::{Communicator, LocalGroup, MultiStageOrchestrator, StopReason, construct_datasets};

#[test]
fn test_two_ranks_agree_on_master() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let config = config(&s.data, &s.out, r#"["A", "B"]"#, POTENTIAL, 3, 10);
    let flag = AtomicBool::new(false);
    let source = hdnnp::JsonlSource::new(&s.data);
    let generator = GaussianPairs::new(8);

    let results = LocalGroup::run(2, true, |comm| {
        let plan = construct_datasets(&config, &source, &generator, &comm)?;
        MultiStageOrchestrator::new(&config, &comm, &flag).run(plan)
    });
    assert_eq!(results.len(), 2);
    let summaries: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    assert_eq!(summaries[0].master_digest, summaries[1].master_digest);
    for summary in &summaries {
        assert_eq!(summary.stages.len(), 2);
        assert!(summary.stages.iter().all(|s| s.reason == StopReason::MaxEpochReached));
        assert_eq!(summary.result.observation.len(), 6);
    }
    // 指標はランク平均なので全ランクで一致する
    for (a, b) in summaries[0].result.observation.iter().zip(&summaries[1].result.observation) {
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.iteration, b.iteration);
    }
    assert!(s.out.join("MasterNNP.bin").is_file());
}

#[test]
fn test_interrupt_on_one_rank_stops_all() {
    let dir = tempfile::tempdir().unwrap();
    let s = setup(dir.path());
    let config = config(&s.data, &s.out, r#"["A", "B"]"#, r#"{ name = "zeroth" }"#, 3, 10);
    let source = hdnnp::JsonlSource::new(&s.data);
    let generator = GaussianPairs::new(8);
    let raised = AtomicBool::new(true);
    let quiet = AtomicBool::new(false);

    let results = LocalGroup::run(2, true, |comm| {
        let flag = if comm.rank() == 1 { &raised } else { &quiet };
        let plan = construct_datasets(&config, &source, &generator, &comm)?;
        MultiStageOrchestrator::new(&config, &comm, flag).run(plan)
    });
    for result in results {
        let summary = result.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.stages.len(), 1);
        assert_eq!(summary.stages[0].reason, StopReason::Interrupted);
        assert_eq!(summary.stages[0].epochs, 1);
    }
    assert!(!s.out.join("MasterNNP.bin").exists());
    assert!(hdnnp::checkpoint::exists(&s.out.join("A")));
}
