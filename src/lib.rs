#![cfg_attr(not(test), no_std)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

extern crate alloc;

/// エラー型定義
pub mod error;

/// 設定値と固定定数
pub mod config;

/// 外部コンポーネント（VM、タイマー、ローダー、SMP、アーキテクチャ）との境界
pub mod hal;

/// タスク管理（プロセス・スレッド・スケジューラ・スリープ/ウェイクアップ）
pub mod task;

pub use config::Config;
pub use error::{KernelError, Result};
pub use hal::Platform;
pub use task::ProcessManager;
