//! HDNNP 分散学習の CLI
//!
//! 使い方:
//!   hdnnp-train --config train.toml --workers 4
//!   hdnnp-train --resume output/B
//!
//! 再開時は開始時に出力先へ写した `config.toml` を使う。
//!
//! Ctrl-C でエポック終了時にチェックポイントを書いて終了する (終了コード 130)。
//! もう一度押すと即座に終了する。

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Parser;
use hdnnp::{
    Communicator, Config, JsonlSource, LocalGroup, MultiStageOrchestrator, PrecomputedOnly,
    RunSummary, SingleProcess, construct_datasets,
};

/// 中断時の終了コード (128 + SIGINT)
const EXIT_INTERRUPTED: u8 = 130;

/// 出力先に残す設定ファイル名
const COPIED_CONFIG: &str = "config.toml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed trainer for high-dimensional neural network potentials")]
struct Cli {
    /// 学習設定ファイル (TOML)。再開時は省略できる
    #[arg(long, short, required_unless_present = "resume")]
    config: Option<PathBuf>,

    /// 再開するタグの出力ディレクトリ (`<out_dir>/<tag>`)
    #[arg(long)]
    resume: Option<PathBuf>,

    /// ワーカー (ランク) 数
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// 集団通信の整合性チェックをリリースビルドでも有効にする
    #[arg(long)]
    check_collectives: bool,

    /// 進捗バーを表示しない
    #[arg(long)]
    no_progress: bool,

    /// debug レベルのログを出す
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .init();

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        let installed = ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                eprintln!("\nForced exit");
                std::process::exit(i32::from(EXIT_INTERRUPTED));
            }
            eprintln!("\nInterrupted, stopping after the current epoch...");
        });
        if let Err(e) = installed {
            log::warn!("failed to install Ctrl-C handler: {e}");
        }
    }

    match run(&cli, &interrupted) {
        Ok(summary) if summary.interrupted => ExitCode::from(EXIT_INTERRUPTED),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, interrupted: &AtomicBool) -> Result<RunSummary> {
    let config_path = config_path(cli)?;
    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    if cli.check_collectives {
        config.training.check_collectives = true;
    }
    if cli.no_progress {
        config.training.progress = false;
    }
    if cli.workers == 0 {
        bail!("--workers must be at least 1");
    }

    match &cli.resume {
        Some(dir) => {
            if !dir.is_dir() {
                bail!("resume directory not found: {}", dir.display());
            }
            log::info!("Resume training from {}", dir.display());
        }
        None => {
            let out_dir = &config.training.out_dir;
            fs::create_dir_all(out_dir)
                .with_context(|| format!("failed to create {}", out_dir.display()))?;
            copy_config(&config_path, out_dir)?;
        }
    }

    let source = JsonlSource::new(&config.dataset.root);
    let generator = PrecomputedOnly::default();
    let checks = config.training.check_collectives;
    let train = |comm: &dyn Communicator| -> hdnnp::Result<RunSummary> {
        let plan = construct_datasets(&config, &source, &generator, comm)?;
        let mut orchestrator = MultiStageOrchestrator::new(&config, comm, interrupted);
        if let Some(dir) = &cli.resume {
            orchestrator = orchestrator.with_resume(dir)?;
        }
        orchestrator.run(plan)
    };

    log::info!("Start training with {} worker(s)", cli.workers);
    let summary = if cli.workers == 1 {
        train(&SingleProcess::new(checks))?
    } else {
        let mut root = None;
        for result in LocalGroup::run(cli.workers, checks, |comm| train(&comm)) {
            let summary = result?;
            root.get_or_insert(summary);
        }
        root.context("no worker returned a result")?
    };

    for stage in &summary.stages {
        log::info!(
            "Tag \"{}\": {:?} after {} epoch(s), {} checkpoint(s)",
            stage.tag,
            stage.reason,
            stage.epochs,
            stage.checkpoints_written
        );
    }
    if !summary.skipped_tags.is_empty() {
        log::info!("Skipped tags: {}", summary.skipped_tags.join(", "));
    }
    log::info!(
        "Training time {:.1} s, finished at {}",
        summary.result.training_time,
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    Ok(summary)
}

/// 読み込む設定ファイル
///
/// 再開時は `<resume_dir>/../config.toml` を優先し、`--config` が
/// それと異なれば警告する。
fn config_path(cli: &Cli) -> Result<PathBuf> {
    let Some(resume_dir) = &cli.resume else {
        return cli.config.clone().context("--config is required");
    };
    let out_dir = match resume_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let copied = out_dir.join(COPIED_CONFIG);
    match (&cli.config, copied.is_file()) {
        (Some(given), true) => {
            if fs::read(given).ok() != fs::read(&copied).ok() {
                log::warn!(
                    "{} differs from {} used at the start of this run, resuming with the latter",
                    given.display(),
                    copied.display()
                );
            }
            Ok(copied)
        }
        (None, true) => Ok(copied),
        (Some(given), false) => {
            log::warn!("{} not found, resuming with {}", copied.display(), given.display());
            Ok(given.clone())
        }
        (None, false) => bail!(
            "{} not found, pass the training config with --config",
            copied.display()
        ),
    }
}

/// 再現用に設定ファイルを出力先へ残す
fn copy_config(config_path: &Path, out_dir: &Path) -> Result<()> {
    let dest = out_dir.join(COPIED_CONFIG);
    let same = match (fs::canonicalize(config_path), fs::canonicalize(&dest)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same {
        fs::copy(config_path, &dest)
            .with_context(|| format!("failed to copy config to {}", dest.display()))?;
    }
    Ok(())
}
