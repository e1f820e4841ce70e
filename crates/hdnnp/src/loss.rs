//! 損失関数
//!
//! 構成読み込み時に一度だけ選ぶ閉じた列挙型。各バリアントは勾配の対象となる
//! スカラー損失と、報告用の指標を返す。

use crate::error::{Error, Result};
use crate::model::Prediction;
use crate::structure::{Order, Sample};
use crate::tape::{Matrix, Tape, Var};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 回転ペナルティで分母 |T + T'| がこれ以下の要素は 0 とみなす
pub const ROTATION_EPS: f64 = 1e-12;

/// 損失関数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum LossFunction {
    /// エネルギーの二乗誤差
    Zeroth,
    /// 力の二乗誤差
    First,
    /// エネルギー・力の混合 + 力の総和ペナルティ + 回転ペナルティ
    Potential {
        /// 力の重み β ∈ [0, 1]
        mixing_beta: f64,
        /// 力の総和ペナルティ係数
        summation: f64,
        /// 回転ペナルティ係数
        rotation: f64,
    },
}

/// 1バッチの評価結果
pub struct LossOutput {
    /// 勾配の対象 (1x1)
    pub loss: Var,
    /// 報告用の指標
    pub metrics: BTreeMap<String, f64>,
}

impl LossFunction {
    /// 係数を検証して `Potential` を作る
    pub fn potential(mixing_beta: f64, summation: f64, rotation: f64) -> Result<Self> {
        let loss = LossFunction::Potential {
            mixing_beta,
            summation,
            rotation,
        };
        loss.validate()?;
        for message in loss.diagnostics() {
            log::warn!("{message}");
        }
        Ok(loss)
    }

    pub fn validate(&self) -> Result<()> {
        if let LossFunction::Potential {
            mixing_beta,
            summation,
            rotation,
        } = *self
        {
            if !(0.0..=1.0).contains(&mixing_beta) {
                return Err(Error::InvalidLossConfig(format!(
                    "mixing_beta must be in [0, 1], got {mixing_beta}"
                )));
            }
            for (name, value) in [("summation", summation), ("rotation", rotation)] {
                if !(value.is_finite() && value >= 0.0) {
                    return Err(Error::InvalidLossConfig(format!(
                        "{name} must be a non-negative finite number, got {value}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// 構成は有効だがより単純なバリアントで足りる場合の警告
    pub fn diagnostics(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let LossFunction::Potential {
            mixing_beta,
            rotation,
            ..
        } = *self
        {
            if mixing_beta == 0.0 {
                out.push("mixing_beta = 0: force error is ignored, use the zeroth loss function".into());
            }
            if rotation == 0.0 {
                out.push("rotation = 0: rotational penalty is disabled, use the first loss function".into());
            }
        }
        out
    }

    pub fn name(&self) -> &'static str {
        match self {
            LossFunction::Zeroth => "zeroth",
            LossFunction::First => "first",
            LossFunction::Potential { .. } => "potential",
        }
    }

    /// モデルに要求する予測の次数 (= 記述子に必要な次数)
    pub fn descriptor_order(&self) -> Order {
        match self {
            LossFunction::Zeroth => Order::Energy,
            LossFunction::First => Order::Force,
            LossFunction::Potential { .. } => Order::Second,
        }
    }

    /// ラベルに必要な次数
    pub fn property_order(&self) -> Order {
        match self {
            LossFunction::Zeroth => Order::Energy,
            LossFunction::First | LossFunction::Potential { .. } => Order::Force,
        }
    }

    /// 報告する指標名
    pub fn metric_keys(&self) -> &'static [&'static str] {
        match self {
            LossFunction::Zeroth => &["RMSE/energy", "total"],
            LossFunction::First => &["RMSE/force", "total"],
            LossFunction::Potential { .. } => &[
                "RMSE/energy",
                "RMSE/force",
                "AbsMean/force",
                "RMS/rot-force",
                "total",
            ],
        }
    }

    /// バッチの予測とラベルから損失を組み立てる
    pub fn eval(
        &self,
        tape: &mut Tape,
        predictions: &[Prediction],
        batch: &[&Sample],
    ) -> Result<LossOutput> {
        if predictions.len() != batch.len() || batch.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "{} predictions for a batch of {}",
                predictions.len(),
                batch.len()
            )));
        }
        let mut metrics = BTreeMap::new();

        let loss = match *self {
            LossFunction::Zeroth => {
                let loss0 = energy_mse(tape, predictions, batch);
                let rmse = tape.value(loss0).item().sqrt();
                metrics.insert("RMSE/energy".to_string(), rmse);
                metrics.insert("total".to_string(), rmse);
                loss0
            }
            LossFunction::First => {
                let loss1 = force_mse(tape, predictions, batch)?;
                let rmse = tape.value(loss1).item().sqrt();
                metrics.insert("RMSE/force".to_string(), rmse);
                metrics.insert("total".to_string(), rmse);
                loss1
            }
            LossFunction::Potential {
                mixing_beta,
                summation,
                rotation,
            } => {
                let loss0 = energy_mse(tape, predictions, batch);
                let loss1 = force_mse(tape, predictions, batch)?;
                let loss_sum = force_abs_mean(tape, predictions)?;
                let loss_rot = rotation_penalty(tape, predictions)?;

                let terms = [
                    tape.scale(loss0, 1.0 - mixing_beta),
                    tape.scale(loss1, mixing_beta),
                    tape.scale(loss_sum, summation),
                    tape.scale(loss_rot, rotation),
                ];
                let total = sum_all(tape, &terms);

                let rmse0 = tape.value(loss0).item().sqrt();
                let rmse1 = tape.value(loss1).item().sqrt();
                let abs_mean = tape.value(loss_sum).item();
                let rms_rot = tape.value(loss_rot).item().sqrt();
                metrics.insert("RMSE/energy".to_string(), rmse0);
                metrics.insert("RMSE/force".to_string(), rmse1);
                metrics.insert("AbsMean/force".to_string(), abs_mean);
                metrics.insert("RMS/rot-force".to_string(), rms_rot);
                metrics.insert(
                    "total".to_string(),
                    (1.0 - mixing_beta) * rmse0
                        + mixing_beta * rmse1
                        + summation * abs_mean
                        + rotation * rms_rot,
                );
                total
            }
        };

        Ok(LossOutput { loss, metrics })
    }
}

fn sum_all(tape: &mut Tape, terms: &[Var]) -> Var {
    let mut acc = terms[0];
    for &t in &terms[1..] {
        acc = tape.add(acc, t);
    }
    acc
}

fn energy_mse(tape: &mut Tape, predictions: &[Prediction], batch: &[&Sample]) -> Var {
    let squares: Vec<Var> = predictions
        .iter()
        .zip(batch)
        .map(|(p, s)| {
            let label = tape.leaf(Matrix::scalar(s.energy));
            let diff = tape.sub(p.energy, label);
            tape.square(diff)
        })
        .collect();
    let total = sum_all(tape, &squares);
    tape.scale(total, 1.0 / batch.len() as f64)
}

fn force_of(p: &Prediction) -> Result<Var> {
    p.force
        .ok_or_else(|| Error::InvalidConfig("force prediction was not requested".into()))
}

fn force_mse(tape: &mut Tape, predictions: &[Prediction], batch: &[&Sample]) -> Result<Var> {
    let mut sums = Vec::with_capacity(batch.len());
    let mut count = 0;
    for (p, s) in predictions.iter().zip(batch) {
        let force = force_of(p)?;
        if s.forces.len() != tape.value(force).len() {
            return Err(Error::InvalidConfig(format!(
                "force label has {} components, prediction has {}",
                s.forces.len(),
                tape.value(force).len()
            )));
        }
        count += s.forces.len();
        let label = tape.leaf(Matrix::row(s.forces.clone()));
        let diff = tape.sub(force, label);
        let sq = tape.square(diff);
        sums.push(tape.sum(sq));
    }
    let total = sum_all(tape, &sums);
    Ok(tape.scale(total, 1.0 / count.max(1) as f64))
}

/// |力成分の平均|
fn force_abs_mean(tape: &mut Tape, predictions: &[Prediction]) -> Result<Var> {
    let mut sums = Vec::with_capacity(predictions.len());
    let mut count = 0;
    for p in predictions {
        let force = force_of(p)?;
        count += tape.value(force).len();
        sums.push(tape.sum(force));
    }
    let total = sum_all(tape, &sums);
    let mean = tape.scale(total, 1.0 / count.max(1) as f64);
    Ok(tape.abs(mean))
}

/// mean(((T - T') / (T + T'))^2)。T' は2つのデカルト軸を入れ替えたもの
fn rotation_penalty(tape: &mut Tape, predictions: &[Prediction]) -> Result<Var> {
    let mut sums = Vec::with_capacity(predictions.len());
    let mut count = 0;
    for p in predictions {
        let t = p
            .second
            .ok_or_else(|| Error::InvalidConfig("second derivative was not requested".into()))?;
        let n = tape.value(t).len();
        count += n;
        let swapped = tape.select_cols(t, swap_axes(n / 9));
        let num = tape.sub(t, swapped);
        let den = tape.add(t, swapped);
        let ratio = tape.guarded_div(num, den, ROTATION_EPS);
        let sq = tape.square(ratio);
        sums.push(tape.sum(sq));
    }
    let total = sum_all(tape, &sums);
    Ok(tape.scale(total, 1.0 / count.max(1) as f64))
}

/// 列 `i*9 + α*3 + β` を `i*9 + β*3 + α` へ写す
fn swap_axes(n_atom: usize) -> Vec<usize> {
    (0..n_atom)
        .flat_map(|i| (0..3).flat_map(move |a| (0..3).map(move |b| i * 9 + b * 3 + a)))
        .collect()
}
