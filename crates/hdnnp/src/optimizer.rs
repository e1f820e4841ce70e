//! オプティマイザ
//!
//! マスターパラメータに対する Adam と、勾配に加算する L1/L2 正則化。

use crate::error::{Error, Result};
use crate::master::MasterParameterStore;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// オプティマイザ trait
pub trait Optimizer {
    /// パラメータを更新
    fn step(&mut self, store: &mut MasterParameterStore) -> Result<()>;

    /// 学習率を設定
    fn set_lr(&mut self, lr: f64);

    /// 現在の学習率を取得
    fn get_lr(&self) -> f64;
}

/// 勾配へ加算する正則化項
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Regularization {
    /// L1 (Lasso): rate * sign(w)
    pub l1: f64,
    /// L2 (weight decay): rate * w
    pub l2: f64,
}

impl Regularization {
    pub fn apply(&self, params: &[f64], grads: &mut [f64]) {
        if self.l1 > 0.0 {
            for (g, &p) in grads.iter_mut().zip(params) {
                if p > 0.0 {
                    *g += self.l1;
                } else if p < 0.0 {
                    *g -= self.l1;
                }
            }
        }
        if self.l2 > 0.0 {
            for (g, &p) in grads.iter_mut().zip(params) {
                *g += self.l2 * p;
            }
        }
    }
}

/// 1層ぶんのモーメント
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerMoments {
    pub m_weights: Vec<f64>,
    pub v_weights: Vec<f64>,
    pub m_biases: Vec<f64>,
    pub v_biases: Vec<f64>,
}

/// チェックポイントに保存する Adam の内部状態
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub t: u64,
    pub moments: Vec<LayerMoments>,
}

/// Adam オプティマイザ
pub struct Adam {
    /// 学習率
    pub lr: f64,
    /// β1（一次モーメントの減衰率）
    pub beta1: f64,
    /// β2（二次モーメントの減衰率）
    pub beta2: f64,
    /// 数値安定性のための小さな値
    pub epsilon: f64,

    /// ステップ数
    t: u64,
    /// 層ごとのモーメント (MasterParameterStore::layers の順)
    moments: Vec<LayerMoments>,
}

impl Adam {
    /// 新しいAdamオプティマイザを作成
    pub fn new(store: &MasterParameterStore, lr: f64) -> Self {
        let moments = store
            .layers()
            .map(|l| LayerMoments {
                m_weights: vec![0.0; l.weights.len()],
                v_weights: vec![0.0; l.weights.len()],
                m_biases: vec![0.0; l.biases.len()],
                v_biases: vec![0.0; l.biases.len()],
            })
            .collect();
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            moments,
        }
    }

    /// 実行済みステップ数
    pub fn steps(&self) -> u64 {
        self.t
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            lr: self.lr,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            t: self.t,
            moments: self.moments.clone(),
        }
    }

    /// 保存した状態を復元する。モーメントの形状が合わなければ何も変更しない
    pub fn restore_state(&mut self, state: &AdamState, origin: &Path) -> Result<()> {
        if state.moments.len() != self.moments.len() {
            return Err(Error::corrupt(
                origin,
                format!(
                    "optimizer has {} layers, expected {}",
                    state.moments.len(),
                    self.moments.len()
                ),
            ));
        }
        for (i, (src, dst)) in state.moments.iter().zip(&self.moments).enumerate() {
            let shapes_match = src.m_weights.len() == dst.m_weights.len()
                && src.v_weights.len() == dst.v_weights.len()
                && src.m_biases.len() == dst.m_biases.len()
                && src.v_biases.len() == dst.v_biases.len();
            if !shapes_match {
                return Err(Error::corrupt(origin, format!("optimizer layer {i}: moment shape mismatch")));
            }
        }
        self.lr = state.lr;
        self.beta1 = state.beta1;
        self.beta2 = state.beta2;
        self.epsilon = state.epsilon;
        self.t = state.t;
        self.moments = state.moments.clone();
        Ok(())
    }
}

/// Adamの更新式を適用（借用エラー回避のため独立関数として実装）
#[allow(clippy::too_many_arguments)]
fn adam_update_params(
    params: &mut [f64],
    grads: &[f64],
    m: &mut [f64],
    v: &mut [f64],
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    lr_t: f64,
) {
    for i in 0..params.len() {
        let g = grads[i];

        // モーメントの更新
        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;

        // パラメータの更新
        params[i] -= lr_t * m[i] / (v[i].sqrt() + epsilon);
    }
}

impl Optimizer for Adam {
    fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn get_lr(&self) -> f64 {
        self.lr
    }

    fn step(&mut self, store: &mut MasterParameterStore) -> Result<()> {
        if store.layers().count() != self.moments.len() {
            return Err(Error::InvalidConfig(
                "optimizer was created for a different parameter store".into(),
            ));
        }
        self.t += 1;

        // バイアス補正付き学習率
        let t = self.t as i32;
        let lr_t = self.lr * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));

        for (layer, mom) in store.layers_mut().zip(&mut self.moments) {
            adam_update_params(
                &mut layer.weights,
                &layer.weight_grads,
                &mut mom.m_weights,
                &mut mom.v_weights,
                self.beta1,
                self.beta2,
                self.epsilon,
                lr_t,
            );
            adam_update_params(
                &mut layer.biases,
                &layer.bias_grads,
                &mut mom.m_biases,
                &mut mom.v_biases,
                self.beta1,
                self.beta2,
                self.epsilon,
                lr_t,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Activation, LayerSpec};

    fn store() -> MasterParameterStore {
        let specs = [LayerSpec {
            nodes: 1,
            activation: Activation::Identity,
        }];
        MasterParameterStore::new(&["H".to_string()], 2, &specs, 0).unwrap()
    }

    #[test]
    fn test_regularization_terms() {
        let params = [2.0, -1.0, 0.0];
        let mut grads = [0.5, 0.5, 0.5];
        Regularization { l1: 0.125, l2: 0.0 }.apply(&params, &mut grads);
        assert_eq!(grads, [0.625, 0.375, 0.5]);

        let mut grads = [0.0; 3];
        Regularization { l1: 0.0, l2: 0.5 }.apply(&params, &mut grads);
        assert_eq!(grads, [1.0, -0.5, 0.0]);
    }

    #[test]
    fn test_adam_first_step() {
        let mut s = store();
        let w0 = s.network("H").unwrap().layers[0].weights.clone();
        for layer in s.layers_mut() {
            layer.weight_grads = vec![0.2, -0.4];
        }
        let mut adam = Adam::new(&s, 0.001);
        adam.step(&mut s).unwrap();

        // 1ステップ目は |Δw| ≈ lr
        let w1 = &s.network("H").unwrap().layers[0].weights;
        assert!((w0[0] - w1[0] - 0.001).abs() < 1e-7);
        assert!((w1[1] - w0[1] - 0.001).abs() < 1e-7);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_state_restore() {
        let mut s = store();
        for layer in s.layers_mut() {
            layer.weight_grads = vec![1.0, 1.0];
        }
        let mut adam = Adam::new(&s, 0.01);
        adam.step(&mut s).unwrap();
        adam.set_lr(0.005);

        let mut fresh = Adam::new(&s, 0.1);
        fresh.restore_state(&adam.state(), Path::new("snap")).unwrap();
        assert_eq!(fresh.state(), adam.state());
        assert_eq!(fresh.get_lr(), 0.005);
    }

    #[test]
    fn test_state_restore_rejects_other_shape() {
        let s = store();
        let mut adam = Adam::new(&s, 0.01);
        let mut state = adam.state();
        state.moments[0].m_weights.push(0.0);
        let err = adam.restore_state(&state, Path::new("snap")).unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }));
        assert_eq!(adam.state().moments[0].m_weights.len(), 2);
    }
}
