//! 学習経過の記録
//!
//! - `Observation`: 1回の検証タイミングで得た指標
//! - `ResultRecord`: 全タグ通しての累積結果 (`interim_result.json` / `result.json`)
//! - `LogReport`: タグごとの JSON Lines ログ (`training.log`)
//! - `PrintReport`: ログ出力用の表形式の行

use crate::error::Result;
use crate::io::{read_json, write_atomic, write_json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

/// タグごとのログファイル名
pub const LOG_FILE: &str = "training.log";

/// 1エポック分の観測値
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub tag: String,
    pub epoch: u64,
    pub iteration: u64,
    /// タグ開始からの経過秒数
    pub elapsed_time: f64,
    pub lr: f64,
    /// `main/...` と `validation/main/...` の指標
    #[serde(flatten)]
    pub metrics: BTreeMap<String, f64>,
}

/// 累積結果
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// 学習に費やした合計秒数
    pub training_time: f64,
    pub observation: Vec<Observation>,
}

impl ResultRecord {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_json(path, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(read_json(path)?)
    }

    /// 指定タグの観測値
    pub fn observations_for<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a Observation> {
        self.observation.iter().filter(move |o| o.tag == tag)
    }
}

/// JSON Lines 形式の学習ログ
pub struct LogReport {
    path: PathBuf,
}

impl LogReport {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// `<stage_dir>/training.log`
    pub fn in_dir<P: AsRef<Path>>(stage_dir: P) -> Self {
        Self::new(stage_dir.as_ref().join(LOG_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, observation: &Observation) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(observation)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<Observation>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = crate::io::open_reader(&self.path)?;
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }

    /// `epoch` より後の行を捨てる (再開時に未保存のエポックを消す)
    pub fn truncate_after(&self, epoch: u64) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let kept: Vec<Observation> = self
            .read_all()?
            .into_iter()
            .filter(|o| o.epoch <= epoch)
            .collect();
        write_atomic(&self.path, |w| {
            for o in &kept {
                serde_json::to_writer(&mut *w, o).map_err(std::io::Error::other)?;
                w.write_all(b"\n")?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// 固定幅の表で観測値を出力する
pub struct PrintReport {
    columns: Vec<String>,
    widths: Vec<usize>,
}

impl PrintReport {
    const MIN_WIDTH: usize = 12;

    /// `metric_keys` は `main/` などの接頭辞付き
    pub fn new(metric_keys: &[String]) -> Self {
        let mut columns = vec!["epoch".to_string(), "iteration".to_string()];
        columns.extend(metric_keys.iter().cloned());
        columns.push("elapsed_time".to_string());
        let widths = columns
            .iter()
            .map(|c| c.len().max(Self::MIN_WIDTH))
            .collect();
        Self { columns, widths }
    }

    pub fn header(&self) -> String {
        self.columns
            .iter()
            .zip(&self.widths)
            .map(|(c, &w)| format!("{c:<w$}"))
            .collect::<Vec<_>>()
            .join("  ")
    }

    pub fn row(&self, observation: &Observation) -> String {
        let last = self.columns.len() - 1;
        self.columns
            .iter()
            .zip(&self.widths)
            .enumerate()
            .map(|(i, (c, &w))| match (i, c.as_str()) {
                (0, _) => format!("{:<w$}", observation.epoch),
                (1, _) => format!("{:<w$}", observation.iteration),
                (i, _) if i == last => format!("{:<w$.3}", observation.elapsed_time),
                (_, key) => match observation.metrics.get(key) {
                    Some(v) => format!("{v:<w$.6}"),
                    None => format!("{:<w$}", ""),
                },
            })
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    }
}
