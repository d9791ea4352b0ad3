//! タスク管理の設定値
//!
//! 起動時に一度だけ構築し、`ProcessManager` に渡す

use crate::error::{KernelError, Result};

/// 優先度レベルの数（0が最も緊急、127が最も緩い）
pub const PRIORITY_LEVELS: usize = 128;

/// アイドルスレッドの優先度
pub const IDLE_PRIORITY: u8 = (PRIORITY_LEVELS - 1) as u8;

/// スレッドごとのエラー履歴の長さ（現在 + 直前）
pub const ERROR_HISTORY: usize = 2;

/// 識別子空間の上限（16ビット）
pub const PID_SPACE: usize = 1 << 16;

/// タスク管理の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// アタッチ可能なCPUの最大数
    pub max_cpus: usize,
    /// 使用するPIDの数（PID 0 は予約）
    pub pid_limit: usize,
    /// 最も緩い優先度に与えるタイムスライス（ティック数）
    pub min_slice_ticks: u32,
    /// 最も緊急な優先度に与えるタイムスライス（ティック数）
    pub max_slice_ticks: u32,
    /// 優先度指定がないときの既定値
    pub default_priority: u8,
    /// カーネルモードスレッドのスタックサイズ
    pub kernel_stack_size: usize,
    /// ユーザーモードスレッドのスタックサイズ
    pub user_stack_size: usize,
}

impl Config {
    /// 既定のCPU数上限
    pub const DEFAULT_MAX_CPUS: usize = 8;
    /// 既定の最小タイムスライス（10ms × 2 = 20ms）
    pub const DEFAULT_MIN_SLICE: u32 = 2;
    /// 既定の最大タイムスライス（10ms × 20 = 200ms）
    pub const DEFAULT_MAX_SLICE: u32 = 20;
    /// 既定の優先度
    pub const DEFAULT_PRIORITY: u8 = 64;
    /// 既定のスタックサイズ
    pub const DEFAULT_STACK_SIZE: usize = 4096 * 8;

    /// 既定値で設定を作成
    pub const fn new() -> Self {
        Self {
            max_cpus: Self::DEFAULT_MAX_CPUS,
            pid_limit: PID_SPACE,
            min_slice_ticks: Self::DEFAULT_MIN_SLICE,
            max_slice_ticks: Self::DEFAULT_MAX_SLICE,
            default_priority: Self::DEFAULT_PRIORITY,
            kernel_stack_size: Self::DEFAULT_STACK_SIZE,
            user_stack_size: Self::DEFAULT_STACK_SIZE,
        }
    }

    pub const fn with_max_cpus(mut self, max_cpus: usize) -> Self {
        self.max_cpus = max_cpus;
        self
    }

    pub const fn with_pid_limit(mut self, pid_limit: usize) -> Self {
        self.pid_limit = pid_limit;
        self
    }

    pub const fn with_slices(mut self, min_ticks: u32, max_ticks: u32) -> Self {
        self.min_slice_ticks = min_ticks;
        self.max_slice_ticks = max_ticks;
        self
    }

    pub const fn with_default_priority(mut self, priority: u8) -> Self {
        self.default_priority = priority;
        self
    }

    pub const fn with_stack_sizes(mut self, kernel: usize, user: usize) -> Self {
        self.kernel_stack_size = kernel;
        self.user_stack_size = user;
        self
    }

    /// 設定値の整合性を検査
    pub fn validate(&self) -> Result<()> {
        let ok = self.max_cpus > 0
            && self.pid_limit >= 2
            && self.pid_limit <= PID_SPACE
            && self.min_slice_ticks > 0
            && self.min_slice_ticks <= self.max_slice_ticks
            && (self.default_priority as usize) < PRIORITY_LEVELS
            && self.default_priority != IDLE_PRIORITY
            && self.kernel_stack_size >= 16
            && self.user_stack_size >= 16;

        if ok {
            Ok(())
        } else {
            Err(KernelError::InvalidParam)
        }
    }

    /// 優先度からタイムスライスを計算
    ///
    /// 優先度0で `max_slice_ticks`、優先度127で `min_slice_ticks` となる線形補間
    pub fn slice_for(&self, priority: u8) -> u32 {
        let level = (priority as u64).min(IDLE_PRIORITY as u64);
        let span = (self.max_slice_ticks - self.min_slice_ticks) as u64;
        let slice = self.max_slice_ticks as u64 - span * level / IDLE_PRIORITY as u64;
        slice as u32
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
