//! 原子構造と記述子
//!
//! 記述子の計算そのものは外部の生成器が担い、ここでは形状の検証と
//! 原子ごとの行列ビューだけを提供する。

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// 要求する微分の次数
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Order {
    /// エネルギーのみ
    Energy,
    /// + 力
    Force,
    /// + 力の座標微分 (回転ペナルティ用)
    Second,
}

/// 原子配置とラベル
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Structure {
    /// 原子ごとの元素記号
    pub elements: Vec<String>,
    /// 原子座標
    pub positions: Vec<[f64; 3]>,
    /// 全エネルギー
    pub energy: f64,
    /// 原子ごとの力 (エネルギーだけで学習する場合は空でもよい)
    #[serde(default)]
    pub forces: Vec<[f64; 3]>,
}

impl Structure {
    pub fn n_atom(&self) -> usize {
        self.elements.len()
    }

    pub fn validate(&self, tag: &str) -> Result<()> {
        if self.elements.is_empty() {
            return Err(Error::dataset(tag, "structure has no atoms"));
        }
        if self.positions.len() != self.n_atom() {
            return Err(Error::dataset(
                tag,
                format!("{} positions for {} atoms", self.positions.len(), self.n_atom()),
            ));
        }
        if !self.forces.is_empty() && self.forces.len() != self.n_atom() {
            return Err(Error::dataset(
                tag,
                format!("{} forces for {} atoms", self.forces.len(), self.n_atom()),
            ));
        }
        Ok(())
    }
}

/// 1構造分の記述子
///
/// - `values`: `[atom][feature]`
/// - `first`: `[atom][feature][atom'][xyz]`
/// - `second`: `[atom][feature][atom'][xyz][xyz]` (同一原子ブロックのみ)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    pub n_atom: usize,
    pub n_feature: usize,
    pub values: Vec<f64>,
    #[serde(default)]
    pub first: Option<Vec<f64>>,
    #[serde(default)]
    pub second: Option<Vec<f64>>,
}

impl Descriptor {
    /// 保持している最大の微分次数
    pub fn order(&self) -> Order {
        match (&self.first, &self.second) {
            (Some(_), Some(_)) => Order::Second,
            (Some(_), None) => Order::Force,
            _ => Order::Energy,
        }
    }

    pub fn validate(&self, tag: &str) -> Result<()> {
        let n = self.n_atom;
        let d = self.n_feature;
        let check = |name: &str, len: usize, expected: usize| {
            if len == expected {
                Ok(())
            } else {
                Err(Error::dataset(
                    tag,
                    format!("descriptor {name} has {len} values, expected {expected}"),
                ))
            }
        };
        check("values", self.values.len(), n * d)?;
        if let Some(first) = &self.first {
            check("first derivative", first.len(), n * d * n * 3)?;
        }
        if let Some(second) = &self.second {
            check("second derivative", second.len(), n * d * n * 9)?;
        }
        Ok(())
    }

    /// 原子 `a` の記述子 (長さ n_feature)
    pub fn atom_values(&self, a: usize) -> &[f64] {
        let d = self.n_feature;
        &self.values[a * d..(a + 1) * d]
    }

    /// 原子 `a` の 1 階微分 (n_feature x 3N, 行優先)
    pub fn atom_first(&self, a: usize) -> Option<&[f64]> {
        let stride = self.n_feature * self.n_atom * 3;
        self.first.as_deref().map(|f| &f[a * stride..(a + 1) * stride])
    }

    /// 原子 `a` の 2 階微分 (n_feature x 9N, 行優先)
    pub fn atom_second(&self, a: usize) -> Option<&[f64]> {
        let stride = self.n_feature * self.n_atom * 9;
        self.second.as_deref().map(|s| &s[a * stride..(a + 1) * stride])
    }
}

/// 学習サンプル (記述子 + ラベル)
#[derive(Clone, Debug)]
pub struct Sample {
    pub descriptor: Descriptor,
    pub energy: f64,
    /// 力ラベル (3N, 空なら力を持たない)
    pub forces: Vec<f64>,
}

impl Sample {
    pub fn new(structure: &Structure, descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            energy: structure.energy,
            forces: structure.forces.iter().flatten().copied().collect(),
        }
    }

    pub fn n_atom(&self) -> usize {
        self.descriptor.n_atom
    }
}
