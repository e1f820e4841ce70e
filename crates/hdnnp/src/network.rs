//! 元素ネットワーク
//!
//! 1元素ぶんの全結合ネットワーク。記述子 `x` とその座標微分 `Ẋ`, `Ẍ` を
//! ジェットとして前進伝播し、エネルギー・1階微分・2階微分をテープ上に作る。

use crate::structure::Order;
use crate::tape::{Matrix, Tape, Var};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// 活性化関数
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Tanh,
    Sigmoid,
    Identity,
}

impl Activation {
    pub fn code(self) -> u8 {
        match self {
            Activation::Tanh => 0,
            Activation::Sigmoid => 1,
            Activation::Identity => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Activation::Tanh),
            1 => Some(Activation::Sigmoid),
            2 => Some(Activation::Identity),
            _ => None,
        }
    }

    pub fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => 0.5 * (0.5 * x).tanh() + 0.5,
            Activation::Identity => x,
        }
    }
}

/// 層の幅と活性化
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub nodes: usize,
    pub activation: Activation,
}

/// 学習可能なアフィン変換層
#[derive(Clone, Debug)]
pub struct Affine {
    pub n_in: usize,
    pub n_out: usize,
    pub activation: Activation,
    /// 重み [n_out][n_in]
    pub weights: Vec<f64>,
    /// バイアス [n_out]
    pub biases: Vec<f64>,
    /// 重みの勾配
    pub weight_grads: Vec<f64>,
    /// バイアスの勾配
    pub bias_grads: Vec<f64>,
}

impl Affine {
    /// 新しい層を作成（ゼロ初期化）
    pub fn new(n_in: usize, n_out: usize, activation: Activation) -> Self {
        Self {
            n_in,
            n_out,
            activation,
            weights: vec![0.0; n_out * n_in],
            biases: vec![0.0; n_out],
            weight_grads: vec![0.0; n_out * n_in],
            bias_grads: vec![0.0; n_out],
        }
    }

    /// LeCun 一様初期化
    pub fn init_lecun<R: Rng>(&mut self, rng: &mut R) {
        let bound = (1.0 / self.n_in as f64).sqrt();
        for w in &mut self.weights {
            *w = rng.random::<f64>() * 2.0 * bound - bound;
        }
        self.biases.fill(0.0);
    }

    /// 順伝播（活性化込み）
    pub fn forward(&self, input: &[f64], output: &mut [f64]) {
        debug_assert_eq!(input.len(), self.n_in);
        debug_assert_eq!(output.len(), self.n_out);

        for (j, out) in output.iter_mut().enumerate() {
            let row = &self.weights[j * self.n_in..(j + 1) * self.n_in];
            let sum: f64 = row.iter().zip(input).map(|(w, x)| w * x).sum();
            *out = self.activation.apply(sum + self.biases[j]);
        }
    }

    /// 勾配をゼロにリセット
    pub fn zero_grad(&mut self) {
        self.weight_grads.fill(0.0);
        self.bias_grads.fill(0.0);
    }

    /// パラメータ数
    pub fn param_count(&self) -> usize {
        self.n_out * self.n_in + self.n_out
    }

    pub fn same_shape(&self, other: &Affine) -> bool {
        self.n_in == other.n_in && self.n_out == other.n_out && self.activation == other.activation
    }
}

/// テープに登録した層パラメータ
#[derive(Clone, Debug)]
pub struct NetworkVars {
    layers: Vec<(Var, Var)>,
}

/// 入力側のジェット
pub struct JetInput {
    /// n_in x 1
    pub value: Var,
    /// n_in x 3N
    pub first: Option<Var>,
    /// n_in x 9N
    pub second: Option<Var>,
}

/// 出力側のジェット (スカラー出力)
pub struct JetOutput {
    /// 1 x 1
    pub value: Var,
    /// 1 x 3N
    pub first: Option<Var>,
    /// 1 x 9N (列 `i*9 + α*3 + β`)
    pub second: Option<Var>,
}

/// 1元素ぶんのネットワーク
#[derive(Clone, Debug)]
pub struct ElementNetwork {
    pub layers: Vec<Affine>,
}

impl ElementNetwork {
    /// 入力次元と層仕様からネットワークを作成し初期化する
    pub fn new<R: Rng>(n_input: usize, specs: &[LayerSpec], rng: &mut R) -> Self {
        let mut layers = Vec::with_capacity(specs.len());
        let mut n_in = n_input;
        for spec in specs {
            let mut layer = Affine::new(n_in, spec.nodes, spec.activation);
            layer.init_lecun(rng);
            layers.push(layer);
            n_in = spec.nodes;
        }
        Self { layers }
    }

    pub fn n_input(&self) -> usize {
        self.layers.first().map_or(0, |l| l.n_in)
    }

    /// テープを使わない順伝播
    pub fn energy(&self, input: &[f64]) -> f64 {
        let mut x = input.to_vec();
        for layer in &self.layers {
            let mut y = vec![0.0; layer.n_out];
            layer.forward(&x, &mut y);
            x = y;
        }
        x.first().copied().unwrap_or(0.0)
    }

    pub fn zero_grad(&mut self) {
        for layer in &mut self.layers {
            layer.zero_grad();
        }
    }

    pub fn param_count(&self) -> usize {
        self.layers.iter().map(Affine::param_count).sum()
    }

    pub fn same_shape(&self, other: &ElementNetwork) -> bool {
        self.layers.len() == other.layers.len()
            && self.layers.iter().zip(&other.layers).all(|(a, b)| a.same_shape(b))
    }

    /// パラメータ値だけをコピーする (形状は呼び出し側で保証)
    pub fn copy_params_from(&mut self, other: &ElementNetwork) {
        debug_assert!(self.same_shape(other));
        for (dst, src) in self.layers.iter_mut().zip(&other.layers) {
            dst.weights.copy_from_slice(&src.weights);
            dst.biases.copy_from_slice(&src.biases);
        }
    }

    /// 勾配を `other` に加算する
    pub fn add_grads_to(&self, other: &mut ElementNetwork) {
        debug_assert!(self.same_shape(other));
        for (src, dst) in self.layers.iter().zip(&mut other.layers) {
            for (d, s) in dst.weight_grads.iter_mut().zip(&src.weight_grads) {
                *d += s;
            }
            for (d, s) in dst.bias_grads.iter_mut().zip(&src.bias_grads) {
                *d += s;
            }
        }
    }

    /// 現在のパラメータをテープの葉として登録する
    pub fn register(&self, tape: &mut Tape) -> NetworkVars {
        let layers = self
            .layers
            .iter()
            .map(|l| {
                let w = tape.leaf(Matrix::from_vec(l.n_out, l.n_in, l.weights.clone()));
                let b = tape.leaf(Matrix::column(l.biases.clone()));
                (w, b)
            })
            .collect();
        NetworkVars { layers }
    }

    /// 逆伝播結果を層の勾配バッファに加算する
    pub fn accumulate_grads(&mut self, vars: &NetworkVars, grads: &crate::tape::Gradients) {
        for (layer, (w, b)) in self.layers.iter_mut().zip(&vars.layers) {
            if let Some(gw) = grads.get(*w) {
                for (d, s) in layer.weight_grads.iter_mut().zip(&gw.data) {
                    *d += s;
                }
            }
            if let Some(gb) = grads.get(*b) {
                for (d, s) in layer.bias_grads.iter_mut().zip(&gb.data) {
                    *d += s;
                }
            }
        }
    }

    /// 指定次数までのジェットを前進伝播する
    pub fn forward_jet(
        &self,
        tape: &mut Tape,
        vars: &NetworkVars,
        input: JetInput,
        order: Order,
    ) -> JetOutput {
        let mut x = input.value;
        let mut xd = if order >= Order::Force { input.first } else { None };
        let mut xdd = if order >= Order::Second { input.second } else { None };

        for (layer, &(w, b)) in self.layers.iter().zip(&vars.layers) {
            let h = tape.matmul(w, x);
            let h = tape.add_col(h, b);
            let act = activation_jet(tape, layer.activation, h, order);

            let hd = xd.map(|xd| tape.matmul(w, xd));
            let yd = hd.map(|hd| match act.d1 {
                Some(d1) => tape.mul_col(hd, d1),
                None => hd,
            });

            let ydd = match (xdd, hd) {
                (Some(xdd), Some(hd)) => {
                    let hdd = tape.matmul(w, xdd);
                    let linear = match act.d1 {
                        Some(d1) => tape.mul_col(hdd, d1),
                        None => hdd,
                    };
                    Some(match act.d2 {
                        Some(d2) => {
                            let (left, right) = pair_columns(tape.value(hd).cols / 3);
                            let l = tape.select_cols(hd, left);
                            let r = tape.select_cols(hd, right);
                            let outer = tape.mul(l, r);
                            let curvature = tape.mul_col(outer, d2);
                            tape.add(curvature, linear)
                        }
                        None => linear,
                    })
                }
                _ => None,
            };

            x = act.value;
            xd = yd;
            xdd = ydd;
        }

        JetOutput {
            value: x,
            first: xd,
            second: xdd,
        }
    }
}

/// σ(h), σ'(h), σ''(h)。恒等写像では微分を `None` で表す
struct ActivationJet {
    value: Var,
    d1: Option<Var>,
    d2: Option<Var>,
}

fn activation_jet(tape: &mut Tape, activation: Activation, h: Var, order: Order) -> ActivationJet {
    match activation {
        Activation::Identity => ActivationJet {
            value: h,
            d1: None,
            d2: None,
        },
        Activation::Tanh => {
            let t = tape.tanh(h);
            let (d1, d2) = if order >= Order::Force {
                // 1 - t^2, -2 t (1 - t^2)
                let t2 = tape.square(t);
                let neg = tape.neg(t2);
                let d1 = tape.add_scalar(neg, 1.0);
                let d2 = (order >= Order::Second).then(|| {
                    let td1 = tape.mul(t, d1);
                    tape.scale(td1, -2.0)
                });
                (Some(d1), d2)
            } else {
                (None, None)
            };
            ActivationJet { value: t, d1, d2 }
        }
        Activation::Sigmoid => {
            // σ(h) = (tanh(h/2) + 1) / 2
            let half = tape.scale(h, 0.5);
            let th = tape.tanh(half);
            let th = tape.scale(th, 0.5);
            let s = tape.add_scalar(th, 0.5);
            let (d1, d2) = if order >= Order::Force {
                // s (1 - s), s (1 - s) (1 - 2 s)
                let neg = tape.neg(s);
                let one_minus = tape.add_scalar(neg, 1.0);
                let d1 = tape.mul(s, one_minus);
                let d2 = (order >= Order::Second).then(|| {
                    let two_s = tape.scale(s, -2.0);
                    let factor = tape.add_scalar(two_s, 1.0);
                    tape.mul(d1, factor)
                });
                (Some(d1), d2)
            } else {
                (None, None)
            };
            ActivationJet { value: s, d1, d2 }
        }
    }
}

/// 2階ジェットの列 `i*9 + α*3 + β` に対応する 1階ジェットの列 (i*3+α, i*3+β)
fn pair_columns(n_atom: usize) -> (Vec<usize>, Vec<usize>) {
    let mut left = Vec::with_capacity(n_atom * 9);
    let mut right = Vec::with_capacity(n_atom * 9);
    for i in 0..n_atom {
        for alpha in 0..3 {
            for beta in 0..3 {
                left.push(i * 3 + alpha);
                right.push(i * 3 + beta);
            }
        }
    }
    (left, right)
}
