use alloc::string::String;
use core::fmt;

use bitflags::bitflags;

use super::context::{Context, Entry};
use super::ids::{CpuId, ProcessId, ThreadId, ThreadState, WakeReason};
use crate::config::ERROR_HISTORY;
use crate::error::KernelError;
use crate::hal::{AddressSpace, StackRegion, TimerHandle};

/// スレッド自身の実行で発生したフォルト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    /// 不正なメモリアクセス
    PageFault,
    /// 一般保護例外
    GeneralProtection,
    /// 無効な命令
    InvalidOpcode,
    /// ゼロ除算
    DivideError,
    /// スタックオーバーフロー
    StackOverflow,
    /// 許可されていない操作（呼び出しは失敗するがスレッドは継続）
    Disallowed,
    /// 外部から強制終了された
    Killed,
}

/// フォルトの重大度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// 記録のみ
    Recoverable,
    /// スレッドを終了させる
    Fatal,
}

impl FaultCode {
    pub fn severity(&self) -> Severity {
        match self {
            FaultCode::Disallowed => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    /// フォルトで終了したスレッドの終了コード
    pub fn exit_code(&self) -> i32 {
        match self {
            FaultCode::PageFault => -11,
            FaultCode::GeneralProtection => -13,
            FaultCode::InvalidOpcode => -4,
            FaultCode::DivideError => -8,
            FaultCode::StackOverflow => -12,
            FaultCode::Disallowed => -1,
            FaultCode::Killed => -9,
        }
    }
}

/// エラー履歴に残る原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCause {
    Kernel(KernelError),
    Fault(FaultCode),
}

/// エラー記録
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub cause: ErrorCause,
    pub message: String,
}

/// エラー履歴のリング（現在 + 直前）
///
/// システムコールの入口で `next` を呼んで新しいスロットを始めても、
/// 直前の呼び出しで起きたエラーは `previous` で参照できる。
#[derive(Debug, Clone, Default)]
pub struct ErrorRing {
    slots: [Option<ErrorRecord>; ERROR_HISTORY],
    current: usize,
}

impl ErrorRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在のスロットにエラーを記録（上書き）
    pub fn set(&mut self, cause: ErrorCause, message: &str) {
        self.slots[self.current] = Some(ErrorRecord { cause, message: String::from(message) });
    }

    pub fn current(&self) -> Option<&ErrorRecord> {
        self.slots[self.current].as_ref()
    }

    pub fn previous(&self) -> Option<&ErrorRecord> {
        self.slots[(self.current + ERROR_HISTORY - 1) % ERROR_HISTORY].as_ref()
    }

    /// 次のスロットへ進み、そこを空にする
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) {
        self.current = (self.current + 1) % ERROR_HISTORY;
        self.slots[self.current] = None;
    }

    /// 一つ前のスロットへ戻る（現在のスロットは破棄）
    pub fn prev(&mut self) {
        self.slots[self.current] = None;
        self.current = (self.current + ERROR_HISTORY - 1) % ERROR_HISTORY;
    }

    pub fn clear(&mut self) {
        self.slots = Default::default();
        self.current = 0;
    }
}

bitflags! {
    /// 他のCPUから実行中のスレッドへ送られる要求
    ///
    /// 実行中のCPUが特権モードから戻る際に `validate_state` で処理する。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Requests: u32 {
        /// 停止させる
        const STOP = 1 << 0;
        /// 終了させる
        const TERMINATE = 1 << 1;
    }
}

/// ランキュー内の優先度別リストのリンク
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct QueueLink {
    pub(crate) prev: Option<ThreadId>,
    pub(crate) next: Option<ThreadId>,
}

/// スレッド構造体
///
/// プロセス内で実行される実行単位。同じプロセスのスレッドはアドレス空間を共有する。
/// 所有者はプロセス（PIDテーブル）で、ランキューと待機テーブルはIDで参照するだけ。
pub struct Thread {
    /// スレッドID
    id: ThreadId,
    /// 所属するプロセスID
    process_id: ProcessId,
    /// スレッド名
    name: String,
    /// 現在の状態
    pub(crate) state: ThreadState,

    /// 現在の優先度
    pub(crate) priority: u8,
    /// 次のラウンドから有効になる優先度
    pub(crate) next_priority: u8,
    /// 残りタイムスライス（ティック数）
    pub(crate) slice_ticks: u32,
    /// タイムスライスが属するラウンド（CPU, ラウンド番号）
    pub(crate) slice_round: Option<(CpuId, u64)>,
    /// expired側に移されたラウンド
    pub(crate) expired_in: Option<(CpuId, u64)>,
    /// いずれかのCPUで実行中
    pub(crate) is_active: bool,
    /// 割り当てられているCPU（ランキュー外ではNone）
    pub(crate) cpu: Option<CpuId>,
    /// 最後に割り当てられたCPU
    pub(crate) home_cpu: Option<CpuId>,
    pub(crate) link: QueueLink,

    /// CPUコンテキスト
    pub(crate) context: Context,
    /// 開始位置
    entry: Entry,
    /// アドレス空間（プロセスと共有）
    space: AddressSpace,
    /// スタック領域（アイドルスレッドは起動時のスタックを使うためNone）
    stack: Option<StackRegion>,

    /// 待機理由
    pub(crate) wait_reason: &'static str,
    /// タイムアウト用タイマー
    pub(crate) timer: Option<TimerHandle>,
    /// 起床の原因
    pub(crate) waken_by: Option<WakeReason>,

    /// 他のCPUからの未処理の要求
    pub(crate) requests: Requests,
    /// TERMINATE要求に付随する終了コード
    pub(crate) requested_exit: i32,

    /// エラー履歴
    pub(crate) errors: ErrorRing,
    /// 終了原因となったフォルト
    pub(crate) fault: Option<FaultCode>,
    /// 終了コード
    pub(crate) exit_code: Option<i32>,
}

impl Thread {
    /// 新しいスレッドを作成（状態はInactive）
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ThreadId,
        process_id: ProcessId,
        name: &str,
        priority: u8,
        entry: Entry,
        context: Context,
        space: AddressSpace,
        stack: Option<StackRegion>,
    ) -> Self {
        log::debug!(
            "Creating thread '{}' ({:?}) in {:?}: priority={}, rip={:#x}, rsp={:#x}",
            name,
            id,
            process_id,
            priority,
            context.rip,
            context.rsp
        );

        Self {
            id,
            process_id,
            name: String::from(name),
            state: ThreadState::Inactive,
            priority,
            next_priority: priority,
            slice_ticks: 0,
            slice_round: None,
            expired_in: None,
            is_active: false,
            cpu: None,
            home_cpu: None,
            link: QueueLink::default(),
            context,
            entry,
            space,
            stack,
            wait_reason: "",
            timer: None,
            waken_by: None,
            requests: Requests::empty(),
            requested_exit: 0,
            errors: ErrorRing::new(),
            fault: None,
            exit_code: None,
        }
    }

    /// スレッドIDを取得
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// 所属するプロセスIDを取得
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn next_priority(&self) -> u8 {
        self.next_priority
    }

    pub fn slice_ticks(&self) -> u32 {
        self.slice_ticks
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn stack(&self) -> Option<StackRegion> {
        self.stack
    }

    pub fn waken_by(&self) -> Option<WakeReason> {
        self.waken_by
    }

    pub fn errors(&self) -> &ErrorRing {
        &self.errors
    }

    pub fn fault(&self) -> Option<FaultCode> {
        self.fault
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// 指定したラウンドでexpired側にいるかどうか
    pub(crate) fn is_expired_in(&self, cpu: CpuId, round: u64) -> bool {
        self.expired_in == Some((cpu, round))
    }

    /// 終了状態に遷移
    ///
    /// メモリ（スタック、エラー履歴）は回収されるまで保持する。
    /// 実行中のスレッドの `is_active` は、CPUが別のスレッドに移った後で下ろす。
    pub(crate) fn terminate(&mut self, exit_code: i32, fault: Option<FaultCode>) {
        self.state = ThreadState::Terminated;
        self.exit_code = Some(exit_code);
        self.fault = fault;
        self.cpu = None;
        self.timer = None;
        self.wait_reason = "";
        self.requests = Requests::empty();
        self.link = QueueLink::default();
    }

    /// 回収時にスタックを取り出す
    pub(crate) fn take_stack(&mut self) -> Option<StackRegion> {
        self.errors.clear();
        self.stack.take()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("process_id", &self.process_id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("cpu", &self.cpu)
            .field("is_active", &self.is_active)
            .field("stack", &self.stack.map(|s| s.base()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessError;

    #[test]
    fn test_error_ring_keeps_previous() {
        let mut ring = ErrorRing::new();
        ring.set(ErrorCause::Kernel(KernelError::InvalidParam), "bad argument");
        ring.next();

        assert!(ring.current().is_none());
        let prev = ring.previous().unwrap();
        assert_eq!(prev.cause, ErrorCause::Kernel(KernelError::InvalidParam));
        assert_eq!(prev.message, "bad argument");

        ring.set(ErrorCause::Fault(FaultCode::Disallowed), "denied");
        ring.next();
        assert_eq!(ring.previous().unwrap().message, "denied");
        assert!(ring.current().is_none());
    }

    #[test]
    fn test_error_ring_prev_restores() {
        let mut ring = ErrorRing::new();
        ring.set(ErrorCause::Kernel(KernelError::Process(ProcessError::NoPid)), "first");
        ring.next();
        ring.set(ErrorCause::Kernel(KernelError::InvalidParam), "second");
        ring.prev();
        assert_eq!(ring.current().unwrap().message, "first");
    }

    #[test]
    fn test_fault_severity() {
        assert_eq!(FaultCode::Disallowed.severity(), Severity::Recoverable);
        assert_eq!(FaultCode::PageFault.severity(), Severity::Fatal);
        assert!(FaultCode::Killed.exit_code() < 0);
    }
}
