//! タスク管理のエラー型定義
//!
//! すべてのカーネルエラーをResult型で表現し、panicを禁止

use thiserror::Error;

/// トップレベルエラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// メモリエラー
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
    /// プロセスエラー
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
    /// ELFエラー
    #[error("ELF error: {0}")]
    Elf(#[from] ElfError),
    /// 無効なパラメータ
    #[error("Invalid parameter")]
    InvalidParam,
    /// 未実装の機能
    #[error("Not implemented")]
    NotImplemented,
}

/// メモリ関連のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// 利用可能なメモリがない
    #[error("Out of memory")]
    OutOfMemory,
    /// スタック領域を確保できない
    #[error("No stack space")]
    NoStackSpace,
    /// 無効なアドレスへのアクセス
    #[error("Invalid address")]
    InvalidAddress,
}

/// プロセス・スレッド関連のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// 識別子空間を使い切った
    #[error("No PID available")]
    NoPid,
    /// プロセスが見つからない
    #[error("Process not found")]
    ProcessNotFound,
    /// スレッドが見つからない
    #[error("Thread not found")]
    ThreadNotFound,
    /// 生存スレッドが残っている
    #[error("Process still has live threads")]
    ThreadsAlive,
    /// 現在の状態では許されない操作
    #[error("Invalid state")]
    InvalidState,
    /// チャネルもタイムアウトも指定されていないスリープ
    #[error("Invalid wait specification")]
    InvalidWaitSpec,
    /// 予約されていないチャネルの解放
    #[error("Channel not reserved")]
    ChannelNotReserved,
    /// このCPUで実行中のスレッドがない
    #[error("No current thread")]
    NoCurrentThread,
    /// CPUがアタッチされていない
    #[error("CPU offline")]
    CpuOffline,
    /// CPUは既にアタッチ済み
    #[error("CPU already attached")]
    CpuAlreadyAttached,
    /// スリープがイベントでもタイムアウトでもなく中断された
    #[error("Sleep interrupted")]
    Interrupted,
}

/// ELF（イメージローダー）関連のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ElfError {
    /// イメージが見つからない
    #[error("Image not found")]
    NotFound,
    /// 無効なELFフォーマット
    #[error("Invalid format")]
    InvalidFormat,
    /// サポートされていないELFタイプ
    #[error("Unsupported type")]
    UnsupportedType,
    /// セグメントのロード失敗
    #[error("Segment load failure")]
    SegmentLoadFailure,
}

impl KernelError {
    /// このエラーが致命的かどうか
    ///
    /// 致命的なエラーは回復不能であり、システムの継続が不可能
    /// - `MemoryError::OutOfMemory`
    pub fn is_fatal(&self) -> bool {
        matches!(self, KernelError::Memory(MemoryError::OutOfMemory))
    }

    /// 資源枯渇によるエラーかどうか
    ///
    /// 呼び出し元に必ず返され、内部で再試行されることはない
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            KernelError::Process(ProcessError::NoPid)
                | KernelError::Memory(MemoryError::OutOfMemory)
                | KernelError::Memory(MemoryError::NoStackSpace)
        )
    }

    /// 呼び出し側の誤用によるエラーかどうか
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            KernelError::InvalidParam
                | KernelError::Process(ProcessError::InvalidWaitSpec)
                | KernelError::Process(ProcessError::ChannelNotReserved)
                | KernelError::Process(ProcessError::InvalidState)
                | KernelError::Process(ProcessError::ThreadsAlive)
                | KernelError::Process(ProcessError::CpuAlreadyAttached)
        )
    }
}

/// 結果型のエイリアス
pub type Result<T> = core::result::Result<T, KernelError>;
