//! タグごとのチェックポイント
//!
//! `<out>/<tag>/trainer_snapshot.json` に学習状態・Adam のモーメント・
//! マスターパラメータ・累積結果をまとめて保存する。一時ファイルからの
//! rename 一回で置き換わるので、途中で止まっても前回の内容が残る。
//! `interim_result.json` は累積結果の閲覧用の写しで、再開には使わない。

use crate::error::{Error, Result};
use crate::io::{read_json, write_json};
use crate::master::MasterParams;
use crate::optimizer::AdamState;
use crate::report::ResultRecord;
use crate::trainer::TrainingState;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_FILE: &str = "trainer_snapshot.json";
pub const INTERIM_RESULT_FILE: &str = "interim_result.json";
pub const FORMAT_VERSION: u32 = 2;

/// 学習再開に必要な状態一式
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainerSnapshot {
    pub format_version: u32,
    pub tag: String,
    pub state: TrainingState,
    pub optimizer: AdamState,
    pub master: MasterParams,
    /// `state.epoch` までの累積結果
    pub result: ResultRecord,
}

pub fn snapshot_path(stage_dir: &Path) -> PathBuf {
    stage_dir.join(SNAPSHOT_FILE)
}

pub fn interim_result_path(stage_dir: &Path) -> PathBuf {
    stage_dir.join(INTERIM_RESULT_FILE)
}

/// 写しの `interim_result.json` を書いてからスナップショットを置き換える
pub fn write(stage_dir: &Path, snapshot: &TrainerSnapshot) -> Result<()> {
    write_json(interim_result_path(stage_dir), &snapshot.result)?;
    write_json(snapshot_path(stage_dir), snapshot)?;
    Ok(())
}

/// スナップショットを読み込む。欠けている・壊れている・タグが違う場合は `CorruptCheckpoint`
///
/// 累積結果はスナップショット内のものを使う。`interim_result.json` が
/// 先のエポックまで進んでいても無視する。
pub fn read(stage_dir: &Path, expected_tag: &str) -> Result<TrainerSnapshot> {
    let snap_path = snapshot_path(stage_dir);
    let snapshot: TrainerSnapshot =
        read_json(&snap_path).map_err(|e| Error::corrupt(&snap_path, e.to_string()))?;
    if snapshot.format_version != FORMAT_VERSION {
        return Err(Error::corrupt(
            &snap_path,
            format!(
                "format version {} is not supported (expected {FORMAT_VERSION})",
                snapshot.format_version
            ),
        ));
    }
    if snapshot.tag != expected_tag {
        return Err(Error::corrupt(
            &snap_path,
            format!("snapshot belongs to tag \"{}\", expected \"{expected_tag}\"", snapshot.tag),
        ));
    }
    if let Some(o) = snapshot
        .result
        .observations_for(expected_tag)
        .find(|o| o.epoch > snapshot.state.epoch)
    {
        return Err(Error::corrupt(
            &snap_path,
            format!(
                "result has an observation for epoch {} past the snapshot epoch {}",
                o.epoch, snapshot.state.epoch
            ),
        ));
    }
    Ok(snapshot)
}

/// 再開に使ったファイルを削除する (存在しなければ何もしない)
pub fn remove(stage_dir: &Path) -> Result<()> {
    for path in [snapshot_path(stage_dir), interim_result_path(stage_dir)] {
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

pub fn exists(stage_dir: &Path) -> bool {
    snapshot_path(stage_dir).is_file()
}
