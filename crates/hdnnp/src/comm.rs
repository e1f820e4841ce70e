//! 集団通信
//!
//! 全ランクが同じ順序で呼び出す同期的な集団操作だけを提供する。
//! `LocalGroup` はプロセス内のスレッドをランクとして扱い、ランク 0 が
//! 寄与を集めてランク順に縮約し、結果を返信する。

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::cell::{Cell, RefCell};

/// 集団通信のインターフェース
///
/// `site` は呼び出し箇所のラベルで、整合性チェックに使う。
pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// ダイジェスト比較などの追加チェックを行うか
    fn checks_enabled(&self) -> bool;

    fn barrier(&self, site: &str) -> Result<()>;

    /// ランク 0 の `data` で全ランクの `data` を置き換える
    fn broadcast(&self, site: &str, data: &mut Vec<f64>) -> Result<()>;

    /// ランク順に合計してランク数で割る
    fn allreduce_mean(&self, site: &str, data: &mut [f64]) -> Result<()>;

    /// いずれかのランクが true なら全ランクで true
    fn any(&self, site: &str, flag: bool) -> Result<bool>;

    /// 全ランクの値がビット単位で一致するか
    fn all_equal(&self, site: &str, value: u64) -> Result<bool>;
}

/// ルートだけが行った処理の成否を全ランクで共有する
///
/// 集団通信なのでバリアを兼ねる。ルートの失敗は他ランクでは
/// `on_peer_failure` のエラーになる。
pub fn agree<T>(
    comm: &dyn Communicator,
    site: &str,
    result: Result<T>,
    on_peer_failure: impl FnOnce() -> Error,
) -> Result<T> {
    let failed = comm.any(site, result.is_err())?;
    match result {
        Ok(_) if failed => Err(on_peer_failure()),
        other => other,
    }
}

/// 1プロセスのみ
pub struct SingleProcess {
    checks: bool,
}

impl SingleProcess {
    pub fn new(checks: bool) -> Self {
        Self {
            checks: checks || cfg!(debug_assertions),
        }
    }
}

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn checks_enabled(&self) -> bool {
        self.checks
    }

    fn barrier(&self, _site: &str) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _site: &str, _data: &mut Vec<f64>) -> Result<()> {
        Ok(())
    }

    fn allreduce_mean(&self, _site: &str, _data: &mut [f64]) -> Result<()> {
        Ok(())
    }

    fn any(&self, _site: &str, flag: bool) -> Result<bool> {
        Ok(flag)
    }

    fn all_equal(&self, _site: &str, _value: u64) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Barrier,
    Broadcast,
    AllreduceMean,
    Any,
    AllEqual,
}

struct Contribution {
    rank: usize,
    seq: u64,
    site: String,
    kind: Kind,
    payload: Vec<f64>,
}

enum Message {
    Call(Contribution),
    /// ランクの終了 (正常終了・エラー・パニックを問わない)
    Departed(usize),
}

type Reply = std::result::Result<Vec<f64>, String>;

/// プロセス内のランク群
pub struct LocalGroup;

impl LocalGroup {
    /// `size` 個のエンドポイントを作成する (index = rank)
    pub fn endpoints(size: usize, checks: bool) -> Vec<LocalComm> {
        let size = size.max(1);
        let checks = checks || cfg!(debug_assertions);
        let (to_root, inbox) = unbounded();
        let mut reply_txs = Vec::with_capacity(size);
        let mut reply_rxs = Vec::with_capacity(size);
        for _ in 1..size {
            let (tx, rx) = unbounded();
            reply_txs.push(tx);
            reply_rxs.push(rx);
        }

        let mut endpoints = Vec::with_capacity(size);
        endpoints.push(LocalComm {
            rank: 0,
            size,
            checks,
            seq: Cell::new(0),
            role: Role::Root {
                inbox,
                reply_txs,
                departed: RefCell::new(vec![false; size]),
            },
        });
        for (i, reply_rx) in reply_rxs.into_iter().enumerate() {
            endpoints.push(LocalComm {
                rank: i + 1,
                size,
                checks,
                seq: Cell::new(0),
                role: Role::Peer {
                    to_root: to_root.clone(),
                    reply_rx,
                },
            });
        }
        endpoints
    }

    /// ランクごとにスレッドを起こして `f` を実行し、ランク順に結果を返す
    pub fn run<R, F>(size: usize, checks: bool, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(LocalComm) -> R + Sync,
    {
        let endpoints = Self::endpoints(size, checks);
        std::thread::scope(|scope| {
            let f = &f;
            let handles: Vec<_> = endpoints
                .into_iter()
                .map(|comm| {
                    std::thread::Builder::new()
                        .name(format!("rank-{}", comm.rank))
                        .spawn_scoped(scope, move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h {
                    Ok(handle) => handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)),
                    Err(e) => panic!("failed to spawn rank thread: {e}"),
                })
                .collect()
        })
    }
}

enum Role {
    Root {
        inbox: Receiver<Message>,
        reply_txs: Vec<Sender<Reply>>,
        /// 既に抜けたランク (以降の集団操作では待たない)
        departed: RefCell<Vec<bool>>,
    },
    Peer {
        to_root: Sender<Message>,
        reply_rx: Receiver<Reply>,
    },
}

/// `LocalGroup` の1ランク
pub struct LocalComm {
    rank: usize,
    size: usize,
    checks: bool,
    seq: Cell<u64>,
    role: Role,
}

impl LocalComm {
    fn collective(&self, site: &str, kind: Kind, payload: Vec<f64>) -> Result<Vec<f64>> {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        let desync = |detail: String| Error::CollectiveDesync {
            site: site.to_string(),
            detail,
        };

        match &self.role {
            Role::Root {
                inbox,
                reply_txs,
                departed,
            } => {
                let mut departed = departed.borrow_mut();
                let mut slots: Vec<Option<Vec<f64>>> = vec![None; self.size];
                slots[0] = Some(payload);
                let mut problem: Option<String> =
                    (1..self.size).find(|&r| departed[r]).map(|r| format!("rank {r} left the group"));

                // メッセージ数ではなく、ランクごとに寄与か離脱が届くまで待つ
                while (1..self.size).any(|r| slots[r].is_none() && !departed[r]) {
                    let message = inbox
                        .recv()
                        .map_err(|_| desync("all peer ranks disconnected".into()))?;
                    match message {
                        Message::Call(c) => {
                            if problem.is_none() {
                                problem = self.mismatch(site, kind, seq, &c);
                            }
                            slots[c.rank] = Some(c.payload);
                        }
                        Message::Departed(rank) => {
                            departed[rank] = true;
                            if slots[rank].is_none() {
                                problem.get_or_insert_with(|| format!("rank {rank} left the group"));
                            }
                        }
                    }
                }

                let reply: Reply = match problem {
                    Some(detail) => Err(detail),
                    None => {
                        let payloads: Vec<Vec<f64>> = slots.into_iter().flatten().collect();
                        reduce(kind, &payloads)
                    }
                };
                for tx in reply_txs {
                    // 既に抜けたランクへの送信失敗は無視する
                    let _ = tx.send(reply.clone());
                }
                reply.map_err(desync)
            }
            Role::Peer { to_root, reply_rx } => {
                to_root
                    .send(Message::Call(Contribution {
                        rank: self.rank,
                        seq,
                        site: site.to_string(),
                        kind,
                        payload,
                    }))
                    .map_err(|_| desync("root rank disconnected".into()))?;
                reply_rx
                    .recv()
                    .map_err(|_| desync("root rank disconnected".into()))?
                    .map_err(desync)
            }
        }
    }

    fn mismatch(&self, site: &str, kind: Kind, seq: u64, c: &Contribution) -> Option<String> {
        if c.kind != kind {
            return Some(format!(
                "rank {} called {:?} at \"{}\" while rank 0 called {:?}",
                c.rank, c.kind, c.site, kind
            ));
        }
        if self.checks && (c.seq != seq || c.site != site) {
            return Some(format!(
                "rank {} is at call #{} \"{}\", rank 0 at call #{} \"{}\"",
                c.rank, c.seq, c.site, seq, site
            ));
        }
        None
    }
}

fn reduce(kind: Kind, payloads: &[Vec<f64>]) -> Reply {
    match kind {
        Kind::Barrier => Ok(Vec::new()),
        Kind::Broadcast => Ok(payloads[0].clone()),
        Kind::AllreduceMean => {
            let len = payloads[0].len();
            if let Some(p) = payloads.iter().find(|p| p.len() != len) {
                return Err(format!("allreduce length {} differs from {len}", p.len()));
            }
            let mut sum = vec![0.0; len];
            for p in payloads {
                for (s, v) in sum.iter_mut().zip(p) {
                    *s += v;
                }
            }
            let n = payloads.len() as f64;
            Ok(sum.into_iter().map(|s| s / n).collect())
        }
        Kind::Any => Ok(vec![if payloads.iter().any(|p| p[0] != 0.0) { 1.0 } else { 0.0 }]),
        Kind::AllEqual => {
            let first = payloads[0][0].to_bits();
            let equal = payloads.iter().all(|p| p[0].to_bits() == first);
            Ok(vec![if equal { 1.0 } else { 0.0 }])
        }
    }
}

impl Drop for LocalComm {
    fn drop(&mut self) {
        if let Role::Peer { to_root, .. } = &self.role {
            let _ = to_root.send(Message::Departed(self.rank));
        }
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn checks_enabled(&self) -> bool {
        self.checks
    }

    fn barrier(&self, site: &str) -> Result<()> {
        self.collective(site, Kind::Barrier, Vec::new()).map(|_| ())
    }

    fn broadcast(&self, site: &str, data: &mut Vec<f64>) -> Result<()> {
        let payload = if self.is_root() { data.clone() } else { Vec::new() };
        *data = self.collective(site, Kind::Broadcast, payload)?;
        Ok(())
    }

    fn allreduce_mean(&self, site: &str, data: &mut [f64]) -> Result<()> {
        let reduced = self.collective(site, Kind::AllreduceMean, data.to_vec())?;
        data.copy_from_slice(&reduced);
        Ok(())
    }

    fn any(&self, site: &str, flag: bool) -> Result<bool> {
        let out = self.collective(site, Kind::Any, vec![if flag { 1.0 } else { 0.0 }])?;
        Ok(out[0] != 0.0)
    }

    fn all_equal(&self, site: &str, value: u64) -> Result<bool> {
        let out = self.collective(site, Kind::AllEqual, vec![f64::from_bits(value)])?;
        Ok(out[0] != 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allreduce_mean_is_rank_ordered() {
        let results = LocalGroup::run(4, true, |comm| {
            let mut data = vec![comm.rank() as f64, 1.0];
            comm.allreduce_mean("test.allreduce", &mut data).unwrap();
            data
        });
        for data in &results {
            assert_eq!(data, &vec![1.5, 1.0]);
        }
    }

    #[test]
    fn test_broadcast_and_any() {
        let results = LocalGroup::run(3, true, |comm| {
            let mut data = if comm.is_root() { vec![3.0, 4.0] } else { vec![] };
            comm.broadcast("test.broadcast", &mut data).unwrap();
            let any = comm.any("test.any", comm.rank() == 2).unwrap();
            let none = comm.any("test.none", false).unwrap();
            comm.barrier("test.barrier").unwrap();
            (data, any, none)
        });
        for (data, any, none) in results {
            assert_eq!(data, vec![3.0, 4.0]);
            assert!(any);
            assert!(!none);
        }
    }

    #[test]
    fn test_all_equal_uses_bit_patterns() {
        let results = LocalGroup::run(2, true, |comm| {
            let same = comm.all_equal("test.same", u64::MAX - 1).unwrap();
            let differ = comm.all_equal("test.differ", comm.rank() as u64).unwrap();
            (same, differ)
        });
        assert_eq!(results, vec![(true, false), (true, false)]);
    }

    #[test]
    fn test_mismatched_site_is_reported_on_every_rank() {
        let results = LocalGroup::run(2, true, |comm| {
            let site = if comm.is_root() { "trainer.epoch" } else { "trainer.checkpoint" };
            comm.barrier(site)
        });
        for r in results {
            assert!(matches!(r, Err(Error::CollectiveDesync { .. })));
        }
    }

    #[test]
    fn test_mismatched_kind_is_reported_even_without_checks() {
        let results = LocalGroup::run(2, false, |comm| {
            if comm.is_root() {
                comm.barrier("a").map(|_| ())
            } else {
                comm.any("a", true).map(|_| ())
            }
        });
        for r in results {
            assert!(matches!(r, Err(Error::CollectiveDesync { .. })));
        }
    }

    #[test]
    fn test_departed_rank_does_not_hang_root() {
        let results = LocalGroup::run(3, true, |comm| {
            if comm.rank() == 2 {
                // 集団通信に参加せず終了する
                return Ok(());
            }
            comm.barrier("test.barrier")
        });
        assert!(results[0].is_err());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_departed_rank_is_not_awaited_again() {
        let results = LocalGroup::run(3, true, |comm| {
            if comm.rank() == 1 {
                return Vec::new();
            }
            // 2回目もランク 1 を待たずにエラーになる
            vec![comm.barrier("test.first"), comm.barrier("test.second")]
        });
        for r in results[0].iter().chain(&results[2]) {
            assert!(matches!(r, Err(Error::CollectiveDesync { .. })), "{r:?}");
        }
        assert_eq!(results[0].len(), 2);
        assert_eq!(results[2].len(), 2);
    }

    #[test]
    fn test_departure_after_contributing_is_reported_later() {
        let results = LocalGroup::run(3, true, |comm| {
            let first = comm.any("test.first", comm.rank() == 1);
            if comm.rank() == 1 {
                return vec![first.map(|_| ())];
            }
            let second = comm.barrier("test.second");
            let third = comm.barrier("test.third");
            vec![first.map(|_| ()), second, third]
        });
        assert!(results[1][0].is_ok());
        for rank in [0, 2] {
            assert!(results[rank][0].is_ok());
            // 抜けたランクはその後の操作すべてで報告される
            assert!(matches!(&results[rank][1], Err(Error::CollectiveDesync { .. })));
            assert!(matches!(&results[rank][2], Err(Error::CollectiveDesync { .. })));
        }
    }

    #[test]
    fn test_agree_propagates_root_failure() {
        let results = LocalGroup::run(2, true, |comm| {
            let local: Result<()> = if comm.is_root() {
                Err(Error::InvalidConfig("disk full".into()))
            } else {
                Ok(())
            };
            agree(&comm, "test.agree", local, || Error::InvalidConfig("peer failed".into()))
        });
        assert!(matches!(&results[0], Err(Error::InvalidConfig(m)) if m == "disk full"));
        assert!(matches!(&results[1], Err(Error::InvalidConfig(m)) if m == "peer failed"));
    }

    #[test]
    fn test_single_process() {
        let comm = SingleProcess::new(false);
        let mut data = vec![1.0, 2.0];
        comm.allreduce_mean("x", &mut data).unwrap();
        assert_eq!(data, vec![1.0, 2.0]);
        assert!(comm.any("x", true).unwrap());
        assert!(comm.all_equal("x", 7).unwrap());
    }
}
