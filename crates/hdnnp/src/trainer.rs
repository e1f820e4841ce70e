//! 1タグ分の学習ループ
//!
//! 状態遷移:
//! `Initializing → Running → {EarlyStopped | MaxEpochReached | Interrupted} → Checkpointed → Done`
//! (再開時は `Resuming` から入る)
//!
//! 全ランクが同じ制御フローをたどる。集団通信をランクごとに異なる条件で
//! 呼ばないよう、シャード長とバッチ数は全ランクで揃えてある。

use crate::checkpoint::{self, FORMAT_VERSION, TrainerSnapshot};
use crate::comm::{Communicator, agree};
use crate::config::Config;
use crate::dataset::{Shard, TaggedDataset, stream_rng};
use crate::error::{Error, Result};
use crate::loss::LossFunction;
use crate::master::MasterParameterStore;
use crate::model::CompositeStructureModel;
use crate::optimizer::{Adam, Optimizer, Regularization};
use crate::report::{LogReport, Observation, PrintReport, ResultRecord};
use crate::structure::Sample;
use crate::tape::Tape;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// 学習指標の接頭辞
pub const MAIN_PREFIX: &str = "main/";
/// 検証指標の接頭辞
pub const VALIDATION_PREFIX: &str = "validation/main/";

/// 学習ループの状態
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StagePhase {
    Initializing,
    Resuming,
    Running,
    EarlyStopped,
    MaxEpochReached,
    Interrupted,
    Checkpointed,
    Done,
}

/// 学習を終えた理由
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    EarlyStopped,
    MaxEpochReached,
    Interrupted,
}

impl StopReason {
    fn phase(self) -> StagePhase {
        match self {
            StopReason::EarlyStopped => StagePhase::EarlyStopped,
            StopReason::MaxEpochReached => StagePhase::MaxEpochReached,
            StopReason::Interrupted => StagePhase::Interrupted,
        }
    }

    fn from_phase(phase: StagePhase) -> Option<Self> {
        match phase {
            StagePhase::EarlyStopped => Some(StopReason::EarlyStopped),
            StagePhase::MaxEpochReached => Some(StopReason::MaxEpochReached),
            StagePhase::Interrupted => Some(StopReason::Interrupted),
            _ => None,
        }
    }
}

/// 早期終了 ("min" モード)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub monitor: String,
    pub patience: u64,
    pub best: Option<f64>,
    /// 改善しなかった連続回数
    pub count: u64,
}

impl EarlyStopping {
    pub fn new(monitor: &str, patience: u64) -> Self {
        Self {
            monitor: monitor.to_string(),
            patience,
            best: None,
            count: 0,
        }
    }

    /// 監視指標を1回評価する。指標がなければ警告だけで数えない
    pub fn observe(&mut self, metrics: &BTreeMap<String, f64>) {
        let Some(&current) = metrics.get(&self.monitor) else {
            log::warn!(
                "{} is not found in the observation, early stopping is not counted",
                self.monitor
            );
            return;
        };
        match self.best {
            Some(best) if current >= best => self.count += 1,
            _ => {
                self.best = Some(current);
                self.count = 0;
            }
        }
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.patience
    }
}

/// 学習率の指数減衰 (下限付き)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LrSchedule {
    pub decay: f64,
    pub final_lr: f64,
}

impl LrSchedule {
    pub fn next(&self, lr: f64) -> f64 {
        (lr * (1.0 - self.decay)).max(self.final_lr)
    }
}

/// チェックポイントに保存する学習状態
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    pub epoch: u64,
    pub iteration: u64,
    pub stopper: EarlyStopping,
    /// このタグの学習に費やした秒数
    pub elapsed_time: f64,
    pub lr: f64,
    /// 終了済みなら理由 (中断は含めない)
    pub finished: Option<StopReason>,
    /// 前回の報告以降の学習指標の合計
    #[serde(default)]
    pub pending: BTreeMap<String, f64>,
    #[serde(default)]
    pub pending_iterations: u64,
}

impl TrainingState {
    pub fn new(stopper: EarlyStopping, lr: f64) -> Self {
        Self {
            epoch: 0,
            iteration: 0,
            stopper,
            elapsed_time: 0.0,
            lr,
            finished: None,
            pending: BTreeMap::new(),
            pending_iterations: 0,
        }
    }
}

/// 学習ループを開始する方法
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageEntry {
    Fresh,
    /// `<out>/<tag>` のチェックポイントから再開する
    Resume,
}

/// 全タグで共有する実行環境
#[derive(Clone, Copy)]
pub struct StageContext<'a> {
    pub config: &'a Config,
    pub comm: &'a dyn Communicator,
    pub interrupted: &'a AtomicBool,
    pub out_dir: &'a Path,
}

/// 1タグ分の結果
#[derive(Clone, Debug, PartialEq)]
pub struct StageOutcome {
    pub tag: String,
    pub reason: StopReason,
    pub epochs: u64,
    pub checkpoints_written: usize,
}

/// 1タグ分の学習ループ
pub struct TrainingLoopController<'a> {
    ctx: StageContext<'a>,
    tag: String,
    stage_dir: PathBuf,
    train: Shard,
    test: Shard,
    batch_size: usize,
    model: CompositeStructureModel,
    loss: LossFunction,
    regularization: Regularization,
    schedule: LrSchedule,
    state: TrainingState,
    phase: StagePhase,
    entry: StageEntry,
    log: LogReport,
    print: PrintReport,
    last_metrics: BTreeMap<String, f64>,
    checkpoints_written: usize,
}

impl<'a> TrainingLoopController<'a> {
    /// シャードとモデルを用意する (Initializing)
    pub fn new(
        ctx: StageContext<'a>,
        dataset: &TaggedDataset,
        master: &MasterParameterStore,
        entry: StageEntry,
    ) -> Result<Self> {
        let config = ctx.config;
        let comm = ctx.comm;
        let tag = dataset.tag().to_string();
        let batch_size = config.per_worker_batch_size(comm.size())?;

        let (train, test) = dataset.holdout(config.training.train_test_ratio)?;
        if train.is_empty() {
            return Err(Error::dataset(&tag, "no training samples after holdout"));
        }
        let train = train.scatter(comm.rank(), comm.size());
        let test = test.scatter(comm.rank(), comm.size());

        let loss = config.model.loss_function.clone();
        if dataset.descriptor_order() < loss.descriptor_order() {
            return Err(Error::dataset(
                &tag,
                format!(
                    "{} loss requires {:?} descriptors, dataset provides {:?}",
                    loss.name(),
                    loss.descriptor_order(),
                    dataset.descriptor_order()
                ),
            ));
        }
        let model = CompositeStructureModel::new(dataset.composition(), master)?;

        let mut metric_keys: Vec<String> = loss
            .metric_keys()
            .iter()
            .map(|k| format!("{MAIN_PREFIX}{k}"))
            .collect();
        if !test.is_empty() {
            metric_keys.extend(
                loss.metric_keys()
                    .iter()
                    .map(|k| format!("{VALIDATION_PREFIX}{k}")),
            );
        }

        let t = &config.training;
        let stage_dir = ctx.out_dir.join(&tag);
        let stopper = EarlyStopping::new(&t.metrics, t.patience);
        Ok(Self {
            ctx,
            log: LogReport::in_dir(&stage_dir),
            print: PrintReport::new(&metric_keys),
            stage_dir,
            tag,
            train,
            test,
            batch_size,
            model,
            loss,
            regularization: Regularization {
                l1: t.l1_norm,
                l2: t.l2_norm,
            },
            schedule: LrSchedule {
                decay: t.lr_decay,
                final_lr: t.final_lr,
            },
            state: TrainingState::new(stopper, t.init_lr),
            phase: StagePhase::Initializing,
            entry,
            last_metrics: BTreeMap::new(),
            checkpoints_written: 0,
        })
    }

    pub fn phase(&self) -> StagePhase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// 終了状態になるまで学習する
    pub fn run(
        &mut self,
        master: &mut MasterParameterStore,
        optimizer: &mut Adam,
        result: &mut ResultRecord,
    ) -> Result<StageOutcome> {
        match self.entry {
            StageEntry::Fresh => self.start_fresh(master, optimizer)?,
            StageEntry::Resume => self.resume(master, optimizer, result)?,
        }

        while self.phase == StagePhase::Running {
            self.run_epoch(master, optimizer, result)?;
        }

        let reason = StopReason::from_phase(self.phase).ok_or_else(|| {
            Error::InvalidConfig(format!("stage ended in unexpected phase {:?}", self.phase))
        })?;
        if reason != StopReason::Interrupted {
            self.state.finished = Some(reason);
        }
        self.checkpoint(master, optimizer, result)?;
        self.phase = StagePhase::Checkpointed;

        if self.ctx.comm.is_root() {
            match reason {
                StopReason::EarlyStopped => log::info!(
                    "Early stopping: {} did not improve for {} checks (tag \"{}\", epoch {})",
                    self.state.stopper.monitor,
                    self.state.stopper.patience,
                    self.tag,
                    self.state.epoch
                ),
                StopReason::MaxEpochReached => log::info!(
                    "Reached max epoch {} (tag \"{}\")",
                    self.state.epoch,
                    self.tag
                ),
                StopReason::Interrupted => log::warn!(
                    "Training interrupted at epoch {} (tag \"{}\"), checkpoint saved",
                    self.state.epoch,
                    self.tag
                ),
            }
        }
        self.phase = StagePhase::Done;

        Ok(StageOutcome {
            tag: self.tag.clone(),
            reason,
            epochs: self.state.epoch,
            checkpoints_written: self.checkpoints_written,
        })
    }

    fn start_fresh(&mut self, master: &MasterParameterStore, optimizer: &Adam) -> Result<()> {
        let comm = self.ctx.comm;
        self.model.sync_param_with(master)?;
        self.state.lr = optimizer.get_lr();

        // 以前の実行のログが残っていれば消す
        let cleared = if comm.is_root() {
            self.log.truncate_after(0)
        } else {
            Ok(())
        };
        agree(comm, "stage.start", cleared, || {
            Error::Io(std::io::Error::other("rank 0 failed to prepare the stage log"))
        })?;

        if comm.is_root() {
            log::info!(
                "Start training loop on dataset tagged \"{}\" ({} training / {} validation samples per worker)",
                self.tag,
                self.train.len(),
                self.test.len()
            );
            log::info!("{}", self.print.header());
        }
        self.phase = StagePhase::Running;
        Ok(())
    }

    /// 全ランクでチェックポイントを読み込み、成功を確認してから消費したファイルを消す
    fn resume(
        &mut self,
        master: &mut MasterParameterStore,
        optimizer: &mut Adam,
        result: &mut ResultRecord,
    ) -> Result<()> {
        self.phase = StagePhase::Resuming;
        let comm = self.ctx.comm;
        let snap_path = checkpoint::snapshot_path(&self.stage_dir);

        let restored = checkpoint::read(&self.stage_dir, &self.tag).and_then(|snapshot| {
            optimizer.restore_state(&snapshot.optimizer, &snap_path)?;
            master.restore_params(&snapshot.master, &snap_path)?;
            Ok(snapshot)
        });
        let snapshot = agree(comm, "resume.restore", restored, || {
            Error::corrupt(&snap_path, "restore failed on another rank")
        })?;
        if comm.checks_enabled() {
            master.verify_consistent(comm, "resume.master")?;
        }
        self.model.sync_param_with(master)?;
        self.state = snapshot.state;
        *result = snapshot.result;
        comm.barrier("resume.restored")?;

        let cleaned = if comm.is_root() {
            checkpoint::remove(&self.stage_dir)
                .and_then(|()| self.log.truncate_after(self.state.epoch))
        } else {
            Ok(())
        };
        agree(comm, "resume.cleanup", cleaned, || {
            Error::Io(std::io::Error::other("rank 0 failed to clean up the resumed checkpoint"))
        })?;

        self.phase = match self.state.finished {
            Some(reason) => reason.phase(),
            None => StagePhase::Running,
        };
        if comm.is_root() {
            log::info!(
                "Resume training loop from dataset tagged \"{}\" at epoch {}",
                self.tag,
                self.state.epoch
            );
            if self.phase == StagePhase::Running {
                log::info!("{}", self.print.header());
            }
        }
        Ok(())
    }

    fn run_epoch(
        &mut self,
        master: &mut MasterParameterStore,
        optimizer: &mut Adam,
        result: &mut ResultRecord,
    ) -> Result<()> {
        let comm = self.ctx.comm;
        let config = self.ctx.config;
        let t = &config.training;
        let epoch = self.state.epoch + 1;
        let started = Instant::now();

        self.train_epoch(epoch, master, optimizer)?;
        self.state.epoch = epoch;

        let elapsed = started.elapsed().as_secs_f64();
        self.state.elapsed_time += elapsed;
        result.training_time += elapsed;

        let report_epoch = epoch % t.interval == 0;
        if report_epoch {
            self.report(epoch, optimizer, result)?;
            let lr = self.schedule.next(optimizer.get_lr());
            optimizer.set_lr(lr);
            self.state.lr = lr;
        }

        if epoch >= t.epoch {
            self.phase = StagePhase::MaxEpochReached;
        } else if report_epoch {
            self.state.stopper.observe(&self.last_metrics);
            if self.state.stopper.exhausted() {
                self.phase = StagePhase::EarlyStopped;
            }
        }

        let interrupted = comm.any(
            "epoch.interrupt",
            self.ctx.interrupted.load(Ordering::SeqCst),
        )?;
        if interrupted && self.phase == StagePhase::Running {
            self.phase = StagePhase::Interrupted;
        }

        if self.phase == StagePhase::Running && epoch % t.checkpoint_interval == 0 {
            self.checkpoint(master, optimizer, result)?;
        }
        Ok(())
    }

    /// シャードを1周する
    fn train_epoch(
        &mut self,
        epoch: u64,
        master: &mut MasterParameterStore,
        optimizer: &mut Adam,
    ) -> Result<()> {
        let comm = self.ctx.comm;
        let config = self.ctx.config;
        self.train.shuffle_for_epoch(&mut stream_rng(
            config.training.seed,
            &self.tag,
            "train",
            epoch,
            comm.rank(),
        ));

        let progress = if comm.is_root() && config.training.progress {
            let bar = ProgressBar::new(self.train.num_batches(self.batch_size) as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        progress.set_message(format!("{} epoch {epoch}", self.tag));

        let Self {
            train,
            model,
            loss,
            regularization,
            state,
            batch_size,
            ..
        } = self;
        for batch in train.batches(*batch_size) {
            let metrics = train_step(model, loss, regularization, &batch, master, optimizer, comm)?;
            for (key, value) in metrics {
                *state.pending.entry(key).or_insert(0.0) += value;
            }
            state.pending_iterations += 1;
            state.iteration += 1;
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(())
    }

    /// 検証・観測値の記録・ログ出力
    fn report(&mut self, epoch: u64, optimizer: &Adam, result: &mut ResultRecord) -> Result<()> {
        let comm = self.ctx.comm;

        let pending = std::mem::take(&mut self.state.pending);
        let count = std::mem::take(&mut self.state.pending_iterations).max(1) as f64;
        let mut main: BTreeMap<String, f64> =
            pending.into_iter().map(|(k, v)| (k, v / count)).collect();
        allreduce_metrics(comm, "report.main", &mut main)?;

        let mut metrics: BTreeMap<String, f64> = main
            .into_iter()
            .map(|(k, v)| (format!("{MAIN_PREFIX}{k}"), v))
            .collect();
        if !self.test.is_empty() {
            let mut validation = self.evaluate()?;
            allreduce_metrics(comm, "report.validation", &mut validation)?;
            metrics.extend(
                validation
                    .into_iter()
                    .map(|(k, v)| (format!("{VALIDATION_PREFIX}{k}"), v)),
            );
        }

        let observation = Observation {
            tag: self.tag.clone(),
            epoch,
            iteration: self.state.iteration,
            elapsed_time: self.state.elapsed_time,
            lr: optimizer.get_lr(),
            metrics: metrics.clone(),
        };
        let logged = if comm.is_root() {
            log::info!("{}", self.print.row(&observation));
            self.log.append(&observation)
        } else {
            Ok(())
        };
        agree(comm, "report.log", logged, || {
            Error::Io(std::io::Error::other("rank 0 failed to write the training log"))
        })?;

        result.observation.push(observation);
        self.last_metrics = metrics;
        Ok(())
    }

    /// 検証シャードの指標 (バッチ平均、ランク平均前)
    fn evaluate(&self) -> Result<BTreeMap<String, f64>> {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut count = 0usize;
        for batch in self.test.batches(self.batch_size) {
            let mut tape = Tape::new();
            let vars = self.model.register(&mut tape);
            let predictions =
                self.model
                    .predict_batch(&mut tape, &vars, &batch, self.loss.descriptor_order())?;
            let out = self.loss.eval(&mut tape, &predictions, &batch)?;
            for (key, value) in out.metrics {
                *sums.entry(key).or_insert(0.0) += value;
            }
            count += 1;
        }
        let count = count.max(1) as f64;
        Ok(sums.into_iter().map(|(k, v)| (k, v / count)).collect())
    }

    /// ランク 0 がスナップショットを書き、全ランクで成否を共有する
    fn checkpoint(
        &mut self,
        master: &MasterParameterStore,
        optimizer: &Adam,
        result: &ResultRecord,
    ) -> Result<()> {
        let comm = self.ctx.comm;
        let written = if comm.is_root() {
            let snapshot = TrainerSnapshot {
                format_version: FORMAT_VERSION,
                tag: self.tag.clone(),
                state: self.state.clone(),
                optimizer: optimizer.state(),
                master: master.to_params(),
                result: result.clone(),
            };
            checkpoint::write(&self.stage_dir, &snapshot)
        } else {
            Ok(())
        };
        agree(comm, "checkpoint", written, || {
            Error::Io(std::io::Error::other("rank 0 failed to write the checkpoint"))
        })?;
        self.checkpoints_written += 1;
        log::debug!("checkpoint written for tag \"{}\" at epoch {}", self.tag, self.state.epoch);
        Ok(())
    }
}

/// 1バッチ分の順伝播・逆伝播・集団更新
fn train_step(
    model: &mut CompositeStructureModel,
    loss: &LossFunction,
    regularization: &Regularization,
    batch: &[&Sample],
    master: &mut MasterParameterStore,
    optimizer: &mut Adam,
    comm: &dyn Communicator,
) -> Result<BTreeMap<String, f64>> {
    model.zero_grad();
    master.zero_grad();

    let mut tape = Tape::new();
    let vars = model.register(&mut tape);
    let predictions = model.predict_batch(&mut tape, &vars, batch, loss.descriptor_order())?;
    let out = loss.eval(&mut tape, &predictions, batch)?;
    let grads = tape.backward(out.loss);

    model.accumulate_grads(&vars, &grads);
    model.reduce_grads_into(master)?;
    master.apply_gradient_step(optimizer, regularization, comm)?;
    model.sync_param_with(master)?;
    Ok(out.metrics)
}

/// キー順に並べた値をランク平均する (全ランクが同じキーを持つこと)
fn allreduce_metrics(
    comm: &dyn Communicator,
    site: &str,
    metrics: &mut BTreeMap<String, f64>,
) -> Result<()> {
    let mut values: Vec<f64> = metrics.values().copied().collect();
    comm.allreduce_mean(site, &mut values)?;
    for (slot, value) in metrics.values_mut().zip(values) {
        *slot = value;
    }
    Ok(())
}
