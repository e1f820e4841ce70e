//! 結合テスト用のデータ生成
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use hdnnp::source::STRUCTURE_FILE;
use hdnnp::{Config, Descriptor, DescriptorGenerator, Order, Result, Structure};

/// G_{a,k} = Σ_{b≠a} exp(-η_k |r_a - r_b|²) と、その座標微分を解析的に返す
pub struct GaussianPairs {
    pub etas: Vec<f64>,
}

impl GaussianPairs {
    pub fn new(n_feature: usize) -> Self {
        Self {
            etas: (0..n_feature).map(|k| 0.2 + 0.3 * k as f64).collect(),
        }
    }

    pub fn descriptor(&self, s: &Structure, order: Order) -> Descriptor {
        let n = s.n_atom();
        let d = self.etas.len();
        let mut values = vec![0.0; n * d];
        let mut first = vec![0.0; n * d * n * 3];
        let mut second = vec![0.0; n * d * n * 9];
        for a in 0..n {
            for b in 0..n {
                if a == b {
                    continue;
                }
                let diff: Vec<f64> = (0..3).map(|x| s.positions[a][x] - s.positions[b][x]).collect();
                let r2: f64 = diff.iter().map(|v| v * v).sum();
                for (k, &eta) in self.etas.iter().enumerate() {
                    let g = (-eta * r2).exp();
                    let row = a * d + k;
                    values[row] += g;
                    for x in 0..3 {
                        let dg = -2.0 * eta * diff[x] * g;
                        first[(row * n + a) * 3 + x] += dg;
                        first[(row * n + b) * 3 + x] -= dg;
                        for y in 0..3 {
                            let delta = if x == y { 1.0 } else { 0.0 };
                            let h = (-2.0 * eta * delta + 4.0 * eta * eta * diff[x] * diff[y]) * g;
                            second[(row * n + a) * 9 + x * 3 + y] += h;
                            second[(row * n + b) * 9 + x * 3 + y] += h;
                        }
                    }
                }
            }
        }
        Descriptor {
            n_atom: n,
            n_feature: d,
            values,
            first: (order >= Order::Force).then_some(first),
            second: (order >= Order::Second).then_some(second),
        }
    }
}

impl DescriptorGenerator for GaussianPairs {
    fn name(&self) -> &str {
        "gaussian_pairs"
    }

    fn generate(&self, _tag: &str, structures: &[Structure], order: Order) -> Result<Vec<Descriptor>> {
        Ok(structures.iter().map(|s| self.descriptor(s, order)).collect())
    }
}

/// 調和的な対ポテンシャル E = Σ_{a<b} (|r_ab|² - 1)² / 2 でラベルを付けた構造
pub fn structure(elements: &[&str], i: usize) -> Structure {
    let t = i as f64;
    let positions: Vec<[f64; 3]> = (0..elements.len())
        .map(|a| {
            let a = a as f64;
            [
                a * (0.9 + 0.07 * t),
                0.3 * a * a - 0.05 * t,
                0.1 * (a + 1.0) * (t % 3.0),
            ]
        })
        .collect();
    let n = positions.len();
    let mut energy = 0.0;
    let mut forces = vec![[0.0; 3]; n];
    for a in 0..n {
        for b in 0..n {
            if a == b {
                continue;
            }
            let diff: Vec<f64> = (0..3).map(|x| positions[a][x] - positions[b][x]).collect();
            let r2: f64 = diff.iter().map(|v| v * v).sum();
            if a < b {
                energy += 0.5 * (r2 - 1.0) * (r2 - 1.0);
            }
            for x in 0..3 {
                forces[a][x] -= 2.0 * (r2 - 1.0) * diff[x];
            }
        }
    }
    Structure {
        elements: elements.iter().map(|e| e.to_string()).collect(),
        positions,
        energy,
        forces,
    }
}

/// `<root>/<tag>/structures.jsonl` を書く
pub fn write_tag(root: &Path, tag: &str, elements: &[&str], n: usize) {
    let dir = root.join(tag);
    std::fs::create_dir_all(&dir).unwrap();
    let lines: Vec<String> = (0..n)
        .map(|i| serde_json::to_string(&structure(elements, i)).unwrap())
        .collect();
    std::fs::write(dir.join(STRUCTURE_FILE), lines.join("\n")).unwrap();
}

pub struct Setup {
    pub data: PathBuf,
    pub out: PathBuf,
}

/// データ `A` (H, H, O) と `B` (H, O, O) を 5 構造ずつ用意する
pub fn setup(dir: &Path) -> Setup {
    let data = dir.join("data");
    write_tag(&data, "A", &["H", "H", "O"], 5);
    write_tag(&data, "B", &["H", "O", "O"], 5);
    Setup {
        data,
        out: dir.join("out"),
    }
}

pub fn config(data: &Path, out: &Path, tags: &str, loss: &str, epoch: u64, patience: u64) -> Config {
    Config::from_toml_str(&format!(
        r#"
[dataset]
root = "{data}"
tags = {tags}
seed = 3

[model]
layers = [
    {{ nodes = 4, activation = "tanh" }},
    {{ nodes = 1, activation = "identity" }},
]
loss_function = {loss}

[training]
out_dir = "{out}"
train_test_ratio = 0.8
batch_size = 2
epoch = {epoch}
patience = {patience}
init_lr = 1.0e-2
final_lr = 1.0e-4
lr_decay = 0.1
l1_norm = 1.0e-5
l2_norm = 1.0e-5
seed = 7
progress = false
"#,
        data = data.display(),
        out = out.display(),
    ))
    .unwrap()
}

pub const POTENTIAL: &str =
    r#"{ name = "potential", mixing_beta = 0.5, summation = 0.1, rotation = 0.1 }"#;
