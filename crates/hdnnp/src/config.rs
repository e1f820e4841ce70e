//! 学習設定 (TOML)
//!
//! 読み込み時に一度だけ検証し、以降は変更しない。

use crate::error::{Error, Result};
use crate::loss::LossFunction;
use crate::network::LayerSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 全タグを対象にする指定
pub const ALL_TAGS: &str = "all";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    /// `<root>/<tag>/` にタグごとのデータを置く
    pub root: PathBuf,
    /// 学習するタグの順序。`["all"]` なら見つかった全タグをソート順で使う
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    /// 構築時シャッフル (学習/検証の分割) のシード
    #[serde(default)]
    pub seed: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// 隠れ層と出力層 (最終層は 1 ノード)
    pub layers: Vec<LayerSpec>,
    pub loss_function: LossFunction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingConfig {
    pub out_dir: PathBuf,
    #[serde(default = "default_train_test_ratio")]
    pub train_test_ratio: f64,
    /// 全ランク合計のバッチサイズ
    pub batch_size: usize,
    /// 1タグあたりの最大エポック数
    pub epoch: u64,
    /// 検証・ログ・学習率更新の間隔 (エポック)
    #[serde(default = "default_one")]
    pub interval: u64,
    pub patience: u64,
    /// 早期終了で監視する指標
    #[serde(default = "default_metrics")]
    pub metrics: String,
    pub init_lr: f64,
    #[serde(default)]
    pub final_lr: f64,
    #[serde(default)]
    pub lr_decay: f64,
    #[serde(default)]
    pub l1_norm: f64,
    #[serde(default)]
    pub l2_norm: f64,
    /// パラメータ初期化とエポックごとのシャッフルのシード
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_one")]
    pub checkpoint_interval: u64,
    /// 集団通信の呼び出し箇所とダイジェストをリリースビルドでも照合する
    #[serde(default)]
    pub check_collectives: bool,
    #[serde(default = "default_true")]
    pub progress: bool,
}

fn default_tags() -> Vec<String> {
    vec![ALL_TAGS.to_string()]
}

fn default_train_test_ratio() -> f64 {
    0.9
}

fn default_one() -> u64 {
    1
}

fn default_metrics() -> String {
    "validation/main/total".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// TOML ファイルを読み込んで検証する
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.dataset.tags.is_empty() {
            return invalid("dataset.tags must not be empty".into());
        }

        let layers = &self.model.layers;
        match layers.last() {
            None => return invalid("model.layers must not be empty".into()),
            Some(last) if last.nodes != 1 => {
                return invalid(format!("last layer must have 1 node, got {}", last.nodes));
            }
            Some(_) => {}
        }
        if let Some(i) = layers.iter().position(|l| l.nodes == 0) {
            return invalid(format!("model.layers[{i}] has no nodes"));
        }
        self.model.loss_function.validate()?;
        for message in self.model.loss_function.diagnostics() {
            log::warn!("{message}");
        }

        let t = &self.training;
        if !(t.train_test_ratio > 0.0 && t.train_test_ratio <= 1.0) {
            return invalid(format!(
                "train_test_ratio must be in (0, 1], got {}",
                t.train_test_ratio
            ));
        }
        for (name, value) in [
            ("batch_size", t.batch_size as u64),
            ("epoch", t.epoch),
            ("interval", t.interval),
            ("patience", t.patience),
            ("checkpoint_interval", t.checkpoint_interval),
        ] {
            if value == 0 {
                return invalid(format!("training.{name} must be positive"));
            }
        }
        if !(t.init_lr.is_finite() && t.init_lr > 0.0) {
            return invalid(format!("init_lr must be positive, got {}", t.init_lr));
        }
        if !(t.final_lr.is_finite() && t.final_lr >= 0.0 && t.final_lr <= t.init_lr) {
            return invalid(format!(
                "final_lr must be in [0, init_lr], got {}",
                t.final_lr
            ));
        }
        if !(0.0..1.0).contains(&t.lr_decay) {
            return invalid(format!("lr_decay must be in [0, 1), got {}", t.lr_decay));
        }
        for (name, value) in [("l1_norm", t.l1_norm), ("l2_norm", t.l2_norm)] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("{name} must be non-negative, got {value}"));
            }
        }
        if !t.metrics.starts_with("main/") && !t.metrics.starts_with("validation/main/") {
            return invalid(format!(
                "metrics must start with \"main/\" or \"validation/main/\", got {}",
                t.metrics
            ));
        }
        Ok(())
    }

    /// 1ランクあたりのバッチサイズ (余りは使わない)
    pub fn per_worker_batch_size(&self, size: usize) -> Result<usize> {
        let per_worker = self.training.batch_size / size.max(1);
        if per_worker == 0 {
            return Err(Error::InvalidConfig(format!(
                "batch_size {} is smaller than the number of workers {size}",
                self.training.batch_size
            )));
        }
        Ok(per_worker)
    }

    /// `["all"]` の指定か
    pub fn uses_all_tags(&self) -> bool {
        self.dataset.tags.iter().any(|t| t == ALL_TAGS)
    }
}
