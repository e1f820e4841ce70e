//! # hdnnp
//!
//! 高次元ニューラルネットワークポテンシャル (HDNNP) の分散学習ライブラリ。
//!
//! ## モジュール構成
//!
//! - `tape`: 学習に必要な分だけの逆伝播テープ
//! - `network`: 元素ごとのネットワークと入力微分 (ジェット)
//! - `master`: 全ランクで同期するマスターパラメータ
//! - `model`: 構造単位のモデル (原子ごとのサブネットワーク)
//! - `loss`: 損失関数
//! - `optimizer`: Adam と L1/L2 正則化
//! - `comm`: 集団通信
//! - `dataset` / `source`: タグ付きデータセットと記述子キャッシュ
//! - `trainer`: 1タグ分の学習ループ
//! - `orchestrator`: タグ順の多段学習
//! - `checkpoint` / `report`: 再開用スナップショットと学習ログ
//!

// 基盤
pub mod error;
pub mod io;
pub mod tape;

// データ
pub mod dataset;
pub mod source;
pub mod structure;

// モデル
pub mod loss;
pub mod master;
pub mod model;
pub mod network;
pub mod optimizer;

// 分散学習
pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod orchestrator;
pub mod report;
pub mod trainer;

pub use comm::{Communicator, LocalGroup, SingleProcess};
pub use config::Config;
pub use error::{Error, Result};
pub use loss::LossFunction;
pub use master::MasterParameterStore;
pub use orchestrator::{MultiStageOrchestrator, RunSummary};
pub use source::{DescriptorGenerator, JsonlSource, PrecomputedOnly, StructureSource, construct_datasets};
pub use structure::{Descriptor, Order, Structure};
pub use trainer::{StopReason, TrainingLoopController};
