//! タグ付きデータセットとランクごとのシャード

use crate::error::{Error, Result};
use crate::structure::{Order, Sample};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// `(seed, tag, stream, epoch, rank)` から決定的に導いた乱数生成器
///
/// 同じ引数なら常に同じ系列になるので、再開後のシャッフル順も一致する。
pub fn stream_rng(seed: u64, tag: &str, stream: &str, epoch: u64, rank: usize) -> ChaCha8Rng {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update((tag.len() as u64).to_le_bytes());
    hasher.update(tag.as_bytes());
    hasher.update((stream.len() as u64).to_le_bytes());
    hasher.update(stream.as_bytes());
    hasher.update(epoch.to_le_bytes());
    hasher.update((rank as u64).to_le_bytes());
    ChaCha8Rng::from_seed(hasher.finalize().into())
}

/// 1つのタグに属するサンプル集合
///
/// 全構造が同じ組成を持つ。サンプルは `Arc` で共有し、分割やシャード化で
/// 記述子をコピーしない。
#[derive(Clone, Debug)]
pub struct TaggedDataset {
    tag: String,
    composition: Vec<String>,
    samples: Vec<Arc<Sample>>,
}

impl TaggedDataset {
    pub fn new(tag: &str, composition: Vec<String>, samples: Vec<Sample>) -> Result<Self> {
        let n_atom = composition.len();
        let mut n_feature = None;
        for sample in &samples {
            if sample.n_atom() != n_atom {
                return Err(Error::dataset(
                    tag,
                    format!(
                        "sample has {} atoms, composition has {n_atom}",
                        sample.n_atom()
                    ),
                ));
            }
            sample.descriptor.validate(tag)?;
            match n_feature {
                None => n_feature = Some(sample.descriptor.n_feature),
                Some(d) if d != sample.descriptor.n_feature => {
                    return Err(Error::dataset(
                        tag,
                        format!(
                            "descriptor length {} differs from {d}",
                            sample.descriptor.n_feature
                        ),
                    ));
                }
                Some(_) => {}
            }
            if !sample.forces.is_empty() && sample.forces.len() != 3 * n_atom {
                return Err(Error::dataset(
                    tag,
                    format!("{} force components for {n_atom} atoms", sample.forces.len()),
                ));
            }
        }
        Ok(Self {
            tag: tag.to_string(),
            composition,
            samples: samples.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn composition(&self) -> &[String] {
        &self.composition
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// 記述子の長さ (空なら None)
    pub fn n_feature(&self) -> Option<usize> {
        self.samples.first().map(|s| s.descriptor.n_feature)
    }

    /// 全サンプルが持つ記述子の次数
    pub fn descriptor_order(&self) -> Order {
        self.samples
            .iter()
            .map(|s| s.descriptor.order())
            .min()
            .unwrap_or(Order::Second)
    }

    /// 全サンプルが持つラベルの次数
    pub fn property_order(&self) -> Order {
        if self.samples.iter().all(|s| !s.forces.is_empty()) {
            Order::Force
        } else {
            Order::Energy
        }
    }

    /// 組成に含まれる元素 (重複なし、ソート済み)
    pub fn elements(&self) -> Vec<String> {
        let mut elements = self.composition.clone();
        elements.sort();
        elements.dedup();
        elements
    }

    pub fn shuffle<R: rand::Rng>(&mut self, rng: &mut R) {
        self.samples.shuffle(rng);
    }

    /// 先頭 `floor(n * ratio)` 個を学習用、残りを検証用に分ける
    pub fn holdout(&self, ratio: f64) -> Result<(TaggedDataset, TaggedDataset)> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(Error::InvalidConfig(format!(
                "train_test_ratio must be in [0, 1], got {ratio}"
            )));
        }
        let n_train = ((self.len() as f64) * ratio).floor() as usize;
        let n_train = n_train.min(self.len());
        let (train, test) = self.samples.split_at(n_train);
        let part = |samples: &[Arc<Sample>]| TaggedDataset {
            tag: self.tag.clone(),
            composition: self.composition.clone(),
            samples: samples.to_vec(),
        };
        Ok((part(train), part(test)))
    }

    /// ランク `rank` のシャードを作る
    ///
    /// 全ランクが `ceil(n / size)` 個を受け取り、末尾は先頭へ折り返す。
    pub fn scatter(&self, rank: usize, size: usize) -> Shard {
        let n = self.len();
        if n == 0 || size == 0 {
            return Shard::new(Vec::new());
        }
        let shard_len = n.div_ceil(size);
        let start = rank * n / size;
        let samples = (0..shard_len)
            .map(|i| Arc::clone(&self.samples[(start + i) % n]))
            .collect();
        Shard::new(samples)
    }
}

/// 1ランクが担当するサンプル
pub struct Shard {
    samples: Vec<Arc<Sample>>,
    order: Vec<usize>,
}

impl Shard {
    fn new(samples: Vec<Arc<Sample>>) -> Self {
        let order = (0..samples.len()).collect();
        Self { samples, order }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// エポックごとの巡回順を作る。前回の順序には依存しない
    pub fn shuffle_for_epoch<R: rand::Rng>(&mut self, rng: &mut R) {
        self.reset_order();
        self.order.shuffle(rng);
    }

    /// 元の順序に戻す
    pub fn reset_order(&mut self) {
        for (i, slot) in self.order.iter_mut().enumerate() {
            *slot = i;
        }
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len().div_ceil(batch_size)
        }
    }

    /// 現在の巡回順でバッチに分ける (最後のバッチは短くなりうる)
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Vec<&Sample>> + '_ {
        self.order
            .chunks(batch_size.max(1))
            .map(move |chunk| chunk.iter().map(|&i| self.samples[i].as_ref()).collect())
    }
}
