//! タグ順の多段学習
//!
//! マスターパラメータと Adam を全タグで引き継ぎ、最後のタグが終わった
//! ときだけ最終モデルと結果を書き出す。

use crate::comm::{Communicator, agree};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::master::{MODEL_CLASS, MasterParameterStore};
use crate::optimizer::Adam;
use crate::report::ResultRecord;
use crate::source::DatasetPlan;
use crate::trainer::{StageContext, StageEntry, StageOutcome, StopReason, TrainingLoopController};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// 累積結果のファイル名
pub const RESULT_FILE: &str = "result.json";

/// 最終モデルのファイル名 (`MasterNNP.bin`)
pub fn model_file_name() -> String {
    format!("{MODEL_CLASS}.bin")
}

/// 実行全体の結果
#[derive(Debug)]
pub struct RunSummary {
    pub result: ResultRecord,
    pub stages: Vec<StageOutcome>,
    pub skipped_tags: Vec<String>,
    /// 書き出した最終モデル (中断時は None)
    pub model_path: Option<PathBuf>,
    pub interrupted: bool,
    /// 最終的なマスターパラメータのダイジェスト
    pub master_digest: u64,
}

pub struct MultiStageOrchestrator<'a> {
    config: &'a Config,
    comm: &'a dyn Communicator,
    interrupted: &'a AtomicBool,
    out_dir: PathBuf,
    resume_tag: Option<String>,
}

impl<'a> MultiStageOrchestrator<'a> {
    pub fn new(config: &'a Config, comm: &'a dyn Communicator, interrupted: &'a AtomicBool) -> Self {
        Self {
            config,
            comm,
            interrupted,
            out_dir: config.training.out_dir.clone(),
            resume_tag: None,
        }
    }

    /// `<out>/<tag>` から再開する。出力先は `resume_dir` の親になる
    pub fn with_resume(mut self, resume_dir: &Path) -> Result<Self> {
        let tag = resume_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "resume directory {} does not name a tag",
                    resume_dir.display()
                ))
            })?;
        self.resume_tag = Some(tag.to_string());
        self.out_dir = match resume_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok(self)
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// 全タグを順に学習する
    pub fn run(&self, plan: DatasetPlan) -> Result<RunSummary> {
        let comm = self.comm;
        let config = self.config;

        let resume_index = match &self.resume_tag {
            Some(tag) => Some(
                plan.datasets
                    .iter()
                    .position(|d| d.tag() == tag)
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "resume tag \"{tag}\" is not in the dataset list"
                        ))
                    })?,
            ),
            None => None,
        };

        let mut master = MasterParameterStore::new(
            &plan.elements,
            plan.n_input,
            &config.model.layers,
            config.training.seed,
        )?;
        master.synchronize(comm)?;
        let mut optimizer = Adam::new(&master, config.training.init_lr);
        let mut result = ResultRecord::default();

        if comm.is_root() {
            log::info!(
                "Master model: elements {:?}, {} inputs, {} parameters",
                plan.elements,
                plan.n_input,
                master.param_count()
            );
        }

        let ctx = StageContext {
            config,
            comm,
            interrupted: self.interrupted,
            out_dir: &self.out_dir,
        };
        let mut stages: Vec<StageOutcome> = Vec::new();
        let mut interrupted = false;
        for (i, dataset) in plan.datasets.iter().enumerate() {
            let entry = match resume_index {
                Some(r) if i < r => {
                    if comm.is_root() {
                        log::info!("Skip dataset tagged \"{}\" (already trained)", dataset.tag());
                    }
                    continue;
                }
                Some(r) if i == r => StageEntry::Resume,
                _ => StageEntry::Fresh,
            };
            if !stages.is_empty()
                && comm.any("stage.interrupt", self.interrupted.load(Ordering::SeqCst))?
            {
                interrupted = true;
                break;
            }

            let mut controller = TrainingLoopController::new(ctx, dataset, &master, entry)?;
            let outcome = controller.run(&mut master, &mut optimizer, &mut result)?;
            let stop = outcome.reason == StopReason::Interrupted;
            stages.push(outcome);
            if stop {
                interrupted = true;
                break;
            }
        }

        let model_path = if interrupted {
            if comm.is_root() {
                log::warn!("Training was interrupted, the final model is not written");
            }
            None
        } else {
            let model_path = self.out_dir.join(model_file_name());
            let written = if comm.is_root() {
                master
                    .save(&model_path)
                    .and_then(|()| result.save(self.out_dir.join(RESULT_FILE)))
            } else {
                Ok(())
            };
            agree(comm, "final.save", written, || {
                Error::Io(std::io::Error::other("rank 0 failed to write the final model"))
            })?;
            if comm.is_root() {
                log::info!("Saved {}", model_path.display());
            }
            Some(model_path)
        };

        Ok(RunSummary {
            result,
            stages,
            skipped_tags: plan.skipped,
            model_path,
            interrupted,
            master_digest: master.digest(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SingleProcess;

    fn config() -> Config {
        Config::from_toml_str(
            r#"
[dataset]
root = "data"

[model]
layers = [{ nodes = 1, activation = "identity" }]
loss_function = { name = "zeroth" }

[training]
out_dir = "out"
batch_size = 2
epoch = 1
patience = 1
init_lr = 1.0e-3
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_with_resume_uses_parent_as_out_dir() {
        let config = config();
        let comm = SingleProcess::new(false);
        let flag = AtomicBool::new(false);
        let orch = MultiStageOrchestrator::new(&config, &comm, &flag);
        assert_eq!(orch.out_dir(), Path::new("out"));

        let orch = orch.with_resume(Path::new("runs/x/B")).unwrap();
        assert_eq!(orch.out_dir(), Path::new("runs/x"));
        assert_eq!(orch.resume_tag.as_deref(), Some("B"));

        let orch = MultiStageOrchestrator::new(&config, &comm, &flag)
            .with_resume(Path::new("A"))
            .unwrap();
        assert_eq!(orch.out_dir(), Path::new("."));
    }

    #[test]
    fn test_unknown_resume_tag_is_invalid() {
        let config = config();
        let comm = SingleProcess::new(false);
        let flag = AtomicBool::new(false);
        let plan = DatasetPlan {
            datasets: Vec::new(),
            skipped: Vec::new(),
            elements: vec!["H".into()],
            n_input: 2,
        };
        let err = MultiStageOrchestrator::new(&config, &comm, &flag)
            .with_resume(Path::new("out/Z"))
            .unwrap()
            .run(plan)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_model_file_name() {
        assert_eq!(model_file_name(), "MasterNNP.bin");
    }
}
