//! マスターパラメータ
//!
//! 元素記号ごとの正準パラメータを保持する。全ランクで同一値を保つ唯一の
//! 共有状態であり、更新は集団的な勾配ステップを通してのみ行う。

use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::io::write_atomic;
use crate::network::{Activation, Affine, ElementNetwork, LayerSpec};
use crate::optimizer::{Optimizer, Regularization};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

/// 最終モデルファイル名に使うクラス名
pub const MODEL_CLASS: &str = "MasterNNP";

/// スナップショットのマジック ("HDNP")
const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"HDNP");
const SNAPSHOT_VERSION: u32 = 1;

/// 1層ぶんのパラメータ (チェックポイント用)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub n_in: usize,
    pub n_out: usize,
    pub activation: Activation,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

/// 形状付きの全パラメータ
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MasterParams {
    pub n_input: usize,
    pub networks: BTreeMap<String, Vec<LayerParams>>,
}

/// 元素ごとの正準パラメータ
#[derive(Clone, Debug)]
pub struct MasterParameterStore {
    n_input: usize,
    networks: BTreeMap<String, ElementNetwork>,
}

impl MasterParameterStore {
    /// 元素ごとにネットワークを作成する (元素は記号順に初期化)
    pub fn new(elements: &[String], n_input: usize, specs: &[LayerSpec], seed: u64) -> Result<Self> {
        let unique: BTreeSet<&String> = elements.iter().collect();
        if unique.is_empty() {
            return Err(Error::InvalidConfig("no elements to build networks for".into()));
        }
        if n_input == 0 {
            return Err(Error::InvalidConfig("descriptor length must be positive".into()));
        }
        match specs.last() {
            None => return Err(Error::InvalidConfig("model.layers must not be empty".into())),
            Some(last) if last.nodes != 1 => {
                return Err(Error::InvalidConfig(format!(
                    "the last layer must have 1 node, got {}",
                    last.nodes
                )));
            }
            _ => {}
        }
        if specs.iter().any(|s| s.nodes == 0) {
            return Err(Error::InvalidConfig("layer width must be positive".into()));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let networks = unique
            .into_iter()
            .map(|e| (e.clone(), ElementNetwork::new(n_input, specs, &mut rng)))
            .collect();
        Ok(Self { n_input, networks })
    }

    pub fn n_input(&self) -> usize {
        self.n_input
    }

    pub fn elements(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }

    pub fn network(&self, element: &str) -> Option<&ElementNetwork> {
        self.networks.get(element)
    }

    pub fn network_mut(&mut self, element: &str) -> Option<&mut ElementNetwork> {
        self.networks.get_mut(element)
    }

    /// 元素記号順・層順の全層
    pub fn layers(&self) -> impl Iterator<Item = &Affine> {
        self.networks.values().flat_map(|n| n.layers.iter())
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut Affine> {
        self.networks.values_mut().flat_map(|n| n.layers.iter_mut())
    }

    pub fn param_count(&self) -> usize {
        self.networks.values().map(ElementNetwork::param_count).sum()
    }

    pub fn zero_grad(&mut self) {
        for net in self.networks.values_mut() {
            net.zero_grad();
        }
    }

    fn flat_params(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.param_count());
        for layer in self.layers() {
            flat.extend_from_slice(&layer.weights);
            flat.extend_from_slice(&layer.biases);
        }
        flat
    }

    fn set_flat_params(&mut self, flat: &[f64]) {
        let mut offset = 0;
        for layer in self.layers_mut() {
            let (nw, nb) = (layer.weights.len(), layer.biases.len());
            layer.weights.copy_from_slice(&flat[offset..offset + nw]);
            layer.biases.copy_from_slice(&flat[offset + nw..offset + nw + nb]);
            offset += nw + nb;
        }
    }

    fn flat_grads(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.param_count());
        for layer in self.layers() {
            flat.extend_from_slice(&layer.weight_grads);
            flat.extend_from_slice(&layer.bias_grads);
        }
        flat
    }

    fn set_flat_grads(&mut self, flat: &[f64]) {
        let mut offset = 0;
        for layer in self.layers_mut() {
            let (nw, nb) = (layer.weight_grads.len(), layer.bias_grads.len());
            layer.weight_grads.copy_from_slice(&flat[offset..offset + nw]);
            layer.bias_grads.copy_from_slice(&flat[offset + nw..offset + nw + nb]);
            offset += nw + nb;
        }
    }

    /// パラメータのダイジェスト (SHA-256 の先頭 8 バイト)
    pub fn digest(&self) -> u64 {
        let hash = Sha256::digest(self.snapshot());
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash[..8]);
        u64::from_le_bytes(head)
    }

    /// ランク 0 の値を全ランクへ配る
    ///
    /// 集団通信。全ランクが同じ順序で呼ぶこと。
    pub fn synchronize(&mut self, comm: &dyn Communicator) -> Result<()> {
        const SITE: &str = "master.synchronize";
        let mut flat = self.flat_params();
        comm.broadcast(SITE, &mut flat)?;
        if flat.len() != self.param_count() {
            return Err(Error::CollectiveDesync {
                site: SITE.into(),
                detail: format!(
                    "received {} parameters, expected {}",
                    flat.len(),
                    self.param_count()
                ),
            });
        }
        self.set_flat_params(&flat);
        if comm.checks_enabled() {
            self.verify_consistent(comm, SITE)?;
        }
        Ok(())
    }

    /// 全ランクのダイジェストが一致することを確認する
    pub fn verify_consistent(&self, comm: &dyn Communicator, site: &str) -> Result<()> {
        if comm.all_equal(site, self.digest())? {
            Ok(())
        } else {
            Err(Error::CollectiveDesync {
                site: site.into(),
                detail: "parameter digest differs between ranks".into(),
            })
        }
    }

    /// 勾配をランク平均し、L1/L2 項を加えてオプティマイザで更新する
    pub fn apply_gradient_step(
        &mut self,
        optimizer: &mut dyn Optimizer,
        regularization: &Regularization,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let mut grads = self.flat_grads();
        comm.allreduce_mean("master.gradients", &mut grads)?;
        self.set_flat_grads(&grads);

        for layer in self.layers_mut() {
            regularization.apply(&layer.weights, &mut layer.weight_grads);
            regularization.apply(&layer.biases, &mut layer.bias_grads);
        }
        optimizer.step(self)
    }

    /// スナップショットを書き出す (元素記号順, little endian)
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(SNAPSHOT_MAGIC)?;
        w.write_u32::<LittleEndian>(SNAPSHOT_VERSION)?;
        w.write_u32::<LittleEndian>(self.n_input as u32)?;
        w.write_u32::<LittleEndian>(self.networks.len() as u32)?;
        for (element, net) in &self.networks {
            w.write_u32::<LittleEndian>(element.len() as u32)?;
            w.write_all(element.as_bytes())?;
            w.write_u32::<LittleEndian>(net.layers.len() as u32)?;
            for layer in &net.layers {
                w.write_u32::<LittleEndian>(layer.n_in as u32)?;
                w.write_u32::<LittleEndian>(layer.n_out as u32)?;
                w.write_u8(layer.activation.code())?;
                for &v in layer.weights.iter().chain(&layer.biases) {
                    w.write_f64::<LittleEndian>(v)?;
                }
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.param_count() * 8);
        self.write_to(&mut buf).expect("writing to Vec<u8> cannot fail");
        buf
    }

    /// `snapshot` の逆変換。形状が現在の構成と合わなければ何も変更しない
    pub fn restore(&mut self, bytes: &[u8], origin: &Path) -> Result<()> {
        let params = read_snapshot(bytes).map_err(|e| Error::corrupt(origin, e))?;
        self.restore_params(&params, origin)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomic(path, |w| self.write_to(w))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| Error::corrupt(path, e.to_string()))?;
        self.restore(&bytes, path)
    }

    pub fn to_params(&self) -> MasterParams {
        let networks = self
            .networks
            .iter()
            .map(|(e, net)| {
                let layers = net
                    .layers
                    .iter()
                    .map(|l| LayerParams {
                        n_in: l.n_in,
                        n_out: l.n_out,
                        activation: l.activation,
                        weights: l.weights.clone(),
                        biases: l.biases.clone(),
                    })
                    .collect();
                (e.clone(), layers)
            })
            .collect();
        MasterParams {
            n_input: self.n_input,
            networks,
        }
    }

    /// 形状を検証してからパラメータを置き換える
    pub fn restore_params(&mut self, params: &MasterParams, origin: &Path) -> Result<()> {
        self.check_compatible(params).map_err(|reason| Error::corrupt(origin, reason))?;
        for (element, layers) in &params.networks {
            if let Some(net) = self.networks.get_mut(element) {
                for (dst, src) in net.layers.iter_mut().zip(layers) {
                    dst.weights.copy_from_slice(&src.weights);
                    dst.biases.copy_from_slice(&src.biases);
                }
            }
        }
        Ok(())
    }

    fn check_compatible(&self, params: &MasterParams) -> std::result::Result<(), String> {
        if params.n_input != self.n_input {
            return Err(format!(
                "descriptor length {} does not match configured {}",
                params.n_input, self.n_input
            ));
        }
        let stored: Vec<&str> = params.networks.keys().map(String::as_str).collect();
        let current: Vec<&str> = self.elements().collect();
        if stored != current {
            return Err(format!("elements {stored:?} do not match configured {current:?}"));
        }
        for (element, layers) in &params.networks {
            let net = &self.networks[element];
            if layers.len() != net.layers.len() {
                return Err(format!(
                    "{element}: {} layers, expected {}",
                    layers.len(),
                    net.layers.len()
                ));
            }
            for (i, (src, dst)) in layers.iter().zip(&net.layers).enumerate() {
                if src.n_in != dst.n_in || src.n_out != dst.n_out || src.activation != dst.activation {
                    return Err(format!(
                        "{element} layer {i}: {}x{} {:?}, expected {}x{} {:?}",
                        src.n_out, src.n_in, src.activation, dst.n_out, dst.n_in, dst.activation
                    ));
                }
                if src.weights.len() != dst.weights.len() || src.biases.len() != dst.biases.len() {
                    return Err(format!("{element} layer {i}: parameter count mismatch"));
                }
            }
        }
        Ok(())
    }
}

fn read_snapshot(bytes: &[u8]) -> std::result::Result<MasterParams, String> {
    let mut r = Cursor::new(bytes);
    let eof = |e: io::Error| format!("truncated snapshot: {e}");

    let magic = r.read_u32::<LittleEndian>().map_err(eof)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(format!("bad magic 0x{magic:08x}"));
    }
    let version = r.read_u32::<LittleEndian>().map_err(eof)?;
    if version != SNAPSHOT_VERSION {
        return Err(format!("unsupported snapshot version {version}"));
    }
    let n_input = r.read_u32::<LittleEndian>().map_err(eof)? as usize;
    let n_elements = r.read_u32::<LittleEndian>().map_err(eof)?;

    let mut networks = BTreeMap::new();
    for _ in 0..n_elements {
        let len = r.read_u32::<LittleEndian>().map_err(eof)? as usize;
        if len > bytes.len() - r.position() as usize {
            return Err("truncated snapshot in element name".into());
        }
        let mut name = vec![0u8; len];
        r.read_exact(&mut name).map_err(eof)?;
        let element = String::from_utf8(name).map_err(|e| format!("bad element name: {e}"))?;

        let n_layers = r.read_u32::<LittleEndian>().map_err(eof)?;
        let mut layers = Vec::new();
        for _ in 0..n_layers {
            let n_in = r.read_u32::<LittleEndian>().map_err(eof)? as usize;
            let n_out = r.read_u32::<LittleEndian>().map_err(eof)? as usize;
            let code = r.read_u8().map_err(eof)?;
            let activation =
                Activation::from_code(code).ok_or_else(|| format!("unknown activation code {code}"))?;
            let remaining = bytes.len() - r.position() as usize;
            let needed = n_in
                .checked_mul(n_out)
                .and_then(|n| n.checked_add(n_out))
                .and_then(|n| n.checked_mul(8));
            if needed.is_none_or(|n| n > remaining) {
                return Err(format!("truncated snapshot in {element}"));
            }
            let mut read_vec = |n: usize| -> std::result::Result<Vec<f64>, String> {
                (0..n).map(|_| r.read_f64::<LittleEndian>().map_err(eof)).collect()
            };
            let weights = read_vec(n_in * n_out)?;
            let biases = read_vec(n_out)?;
            layers.push(LayerParams {
                n_in,
                n_out,
                activation,
                weights,
                biases,
            });
        }
        if networks.insert(element.clone(), layers).is_some() {
            return Err(format!("duplicate element {element}"));
        }
    }
    if r.position() as usize != bytes.len() {
        return Err("trailing bytes after snapshot".into());
    }
    Ok(MasterParams { n_input, networks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalGroup, SingleProcess};
    use crate::optimizer::Adam;

    fn specs() -> Vec<LayerSpec> {
        vec![
            LayerSpec {
                nodes: 4,
                activation: Activation::Tanh,
            },
            LayerSpec {
                nodes: 1,
                activation: Activation::Identity,
            },
        ]
    }

    fn store(seed: u64) -> MasterParameterStore {
        let elements = vec!["O".to_string(), "H".to_string(), "H".to_string()];
        MasterParameterStore::new(&elements, 8, &specs(), seed).unwrap()
    }

    #[test]
    fn test_elements_are_sorted_and_unique() {
        let s = store(1);
        assert_eq!(s.elements().collect::<Vec<_>>(), vec!["H", "O"]);
        assert_eq!(s.param_count(), 2 * (8 * 4 + 4 + 4 + 1));
    }

    #[test]
    fn test_snapshot_restore_bit_identical() {
        let original = store(1);
        let bytes = original.snapshot();

        let mut restored = store(2);
        assert_ne!(restored.digest(), original.digest());
        restored.restore(&bytes, Path::new("mem")).unwrap();

        for (a, b) in original.layers().zip(restored.layers()) {
            let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
            assert_eq!(bits(&a.weights), bits(&b.weights));
            assert_eq!(bits(&a.biases), bits(&b.biases));
        }
        assert_eq!(restored.snapshot(), bytes);
    }

    #[test]
    fn test_restore_rejects_mismatched_shapes() {
        let other = MasterParameterStore::new(&["H".to_string()], 8, &specs(), 0).unwrap();
        let mut s = store(1);
        let before = s.snapshot();

        let err = s.restore(&other.snapshot(), Path::new("model.bin")).unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }), "{err}");
        assert_eq!(s.snapshot(), before);

        let err = s.restore(&before[..before.len() - 3], Path::new("model.bin")).unwrap_err();
        assert!(matches!(err, Error::CorruptCheckpoint { .. }));

        let mut bad_magic = before.clone();
        bad_magic[0] ^= 0xff;
        assert!(s.restore(&bad_magic, Path::new("model.bin")).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{MODEL_CLASS}.bin"));
        let s = store(3);
        s.save(&path).unwrap();

        let mut t = store(4);
        t.load(&path).unwrap();
        assert_eq!(t.digest(), s.digest());
    }

    #[test]
    fn test_params_roundtrip_through_json() {
        let s = store(5);
        let json = serde_json::to_string(&s.to_params()).unwrap();
        let params: MasterParams = serde_json::from_str(&json).unwrap();
        let mut t = store(6);
        t.restore_params(&params, Path::new("snapshot.json")).unwrap();
        assert_eq!(t.snapshot(), s.snapshot());
    }

    #[test]
    fn test_new_rejects_bad_layers() {
        let elements = vec!["H".to_string()];
        let wide_output = vec![LayerSpec {
            nodes: 2,
            activation: Activation::Identity,
        }];
        assert!(MasterParameterStore::new(&elements, 8, &wide_output, 0).is_err());
        assert!(MasterParameterStore::new(&elements, 8, &[], 0).is_err());
        assert!(MasterParameterStore::new(&[], 8, &specs(), 0).is_err());
    }

    #[test]
    fn test_synchronize_is_idempotent() {
        let mut s = store(7);
        let before = s.snapshot();
        s.synchronize(&SingleProcess::new(true)).unwrap();
        s.synchronize(&SingleProcess::new(true)).unwrap();
        assert_eq!(s.snapshot(), before);

        // 同一状態の2ランクで同期しても値は変わらない
        let digests = LocalGroup::run(2, true, |comm| {
            let mut s = store(7);
            s.synchronize(&comm).unwrap();
            s.synchronize(&comm).unwrap();
            s.digest()
        });
        assert_eq!(digests, vec![store(7).digest(); 2]);
    }

    #[test]
    fn test_synchronize_broadcasts_rank_zero() {
        let digests = LocalGroup::run(3, true, |comm| {
            use crate::comm::Communicator;
            let mut s = store(10 + comm.rank() as u64);
            s.synchronize(&comm).unwrap();
            s.digest()
        });
        assert_eq!(digests, vec![store(10).digest(); 3]);
    }

    #[test]
    fn test_gradient_step_moves_against_gradient() {
        let mut s = store(8);
        let mut adam = Adam::new(&s, 0.01);
        let before = s.to_params();
        for layer in s.layers_mut() {
            layer.weight_grads.fill(1.0);
            layer.bias_grads.fill(-1.0);
        }
        s.apply_gradient_step(&mut adam, &Regularization::default(), &SingleProcess::new(false))
            .unwrap();

        let after = s.to_params();
        for (e, layers) in &after.networks {
            for (a, b) in layers.iter().zip(&before.networks[e]) {
                assert!(a.weights.iter().zip(&b.weights).all(|(x, y)| x < y));
                assert!(a.biases.iter().zip(&b.biases).all(|(x, y)| x > y));
            }
        }
    }
}
