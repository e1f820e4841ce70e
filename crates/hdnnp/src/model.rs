//! 構造単位のモデル
//!
//! 組成 (原子ごとの元素) に従って原子ごとのサブネットワークを持ち、
//! エネルギー・力・力の座標微分を合算する。パラメータはマスターからの
//! 一方向コピーで、逆伝播後の勾配は元素ごとにマスターへ集約する。

use crate::error::{Error, Result};
use crate::master::MasterParameterStore;
use crate::network::{ElementNetwork, JetInput, NetworkVars};
use crate::structure::{Order, Sample};
use crate::tape::{Gradients, Matrix, Tape, Var};

/// 1構造の予測
pub struct Prediction {
    /// 全エネルギー (1x1)
    pub energy: Var,
    /// 力 F = -∂E/∂r (1x3N)
    pub force: Option<Var>,
    /// T[i][α][β] = ∂F_iα/∂r_iβ (1x9N)
    pub second: Option<Var>,
}

/// テープに登録した原子ごとのパラメータ
pub struct ModelVars {
    atoms: Vec<NetworkVars>,
}

/// 構造単位のモデル
pub struct CompositeStructureModel {
    composition: Vec<String>,
    networks: Vec<ElementNetwork>,
}

impl CompositeStructureModel {
    /// 組成に従ってサブネットワークを作り、マスターの値で初期化する
    pub fn new(composition: &[String], master: &MasterParameterStore) -> Result<Self> {
        let networks = composition
            .iter()
            .map(|element| {
                master.network(element).cloned().ok_or_else(|| {
                    Error::InvalidConfig(format!("no network for element {element}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            composition: composition.to_vec(),
            networks,
        })
    }

    pub fn composition(&self) -> &[String] {
        &self.composition
    }

    /// マスターの現在値をサブネットワークへコピーする
    pub fn sync_param_with(&mut self, master: &MasterParameterStore) -> Result<()> {
        for (element, net) in self.composition.iter().zip(&mut self.networks) {
            let src = master
                .network(element)
                .ok_or_else(|| Error::InvalidConfig(format!("no network for element {element}")))?;
            if !net.same_shape(src) {
                return Err(Error::InvalidConfig(format!(
                    "network shape for element {element} changed"
                )));
            }
            net.copy_params_from(src);
        }
        Ok(())
    }

    pub fn zero_grad(&mut self) {
        for net in &mut self.networks {
            net.zero_grad();
        }
    }

    pub fn register(&self, tape: &mut Tape) -> ModelVars {
        ModelVars {
            atoms: self.networks.iter().map(|n| n.register(tape)).collect(),
        }
    }

    /// 1構造を指定次数まで予測する
    pub fn predict(
        &self,
        tape: &mut Tape,
        vars: &ModelVars,
        sample: &Sample,
        order: Order,
    ) -> Result<Prediction> {
        let desc = &sample.descriptor;
        let n = self.composition.len();
        if desc.n_atom != n {
            return Err(Error::InvalidConfig(format!(
                "descriptor has {} atoms, composition has {n}",
                desc.n_atom
            )));
        }
        if desc.order() < order {
            return Err(Error::InvalidConfig(format!(
                "descriptor provides {:?}, {order:?} was requested",
                desc.order()
            )));
        }

        let d = desc.n_feature;
        let mut energy: Option<Var> = None;
        let mut first: Option<Var> = None;
        let mut second: Option<Var> = None;

        for (a, (net, atom_vars)) in self.networks.iter().zip(&vars.atoms).enumerate() {
            if net.n_input() != d {
                return Err(Error::InvalidConfig(format!(
                    "descriptor length {d} does not match network input {}",
                    net.n_input()
                )));
            }
            let value = tape.leaf(Matrix::column(desc.atom_values(a).to_vec()));
            let jet_first = match (order >= Order::Force, desc.atom_first(a)) {
                (true, Some(f)) => Some(tape.leaf(Matrix::from_vec(d, 3 * n, f.to_vec()))),
                _ => None,
            };
            let jet_second = match (order >= Order::Second, desc.atom_second(a)) {
                (true, Some(s)) => Some(tape.leaf(Matrix::from_vec(d, 9 * n, s.to_vec()))),
                _ => None,
            };
            let input = JetInput {
                value,
                first: jet_first,
                second: jet_second,
            };
            let out = net.forward_jet(tape, atom_vars, input, order);

            energy = Some(accumulate(tape, energy, out.value));
            if let Some(v) = out.first {
                first = Some(accumulate(tape, first, v));
            }
            if let Some(v) = out.second {
                second = Some(accumulate(tape, second, v));
            }
        }

        let energy = energy.ok_or_else(|| Error::InvalidConfig("structure has no atoms".into()))?;
        Ok(Prediction {
            energy,
            force: first.map(|v| tape.neg(v)),
            second: second.map(|v| tape.neg(v)),
        })
    }

    pub fn predict_batch(
        &self,
        tape: &mut Tape,
        vars: &ModelVars,
        batch: &[&Sample],
        order: Order,
    ) -> Result<Vec<Prediction>> {
        batch
            .iter()
            .map(|s| self.predict(tape, vars, s, order))
            .collect()
    }

    /// 逆伝播結果を原子ごとの勾配バッファに加算する
    pub fn accumulate_grads(&mut self, vars: &ModelVars, grads: &Gradients) {
        for (net, atom_vars) in self.networks.iter_mut().zip(&vars.atoms) {
            net.accumulate_grads(atom_vars, grads);
        }
    }

    /// 原子ごとの勾配を元素ごとに合計してマスターへ加算する
    pub fn reduce_grads_into(&self, master: &mut MasterParameterStore) -> Result<()> {
        for (element, net) in self.composition.iter().zip(&self.networks) {
            let dst = master
                .network_mut(element)
                .ok_or_else(|| Error::InvalidConfig(format!("no network for element {element}")))?;
            net.add_grads_to(dst);
        }
        Ok(())
    }
}

fn accumulate(tape: &mut Tape, acc: Option<Var>, v: Var) -> Var {
    match acc {
        Some(a) => tape.add(a, v),
        None => v,
    }
}
