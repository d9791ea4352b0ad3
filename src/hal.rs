//! 外部コンポーネントとの境界
//!
//! タスク管理が呼び出す側のインターフェース（アドレス空間、タイマー、
//! イメージローダー、SMP、コンテキストスイッチ）を定義する。
//! 組み込み先のカーネルがこれらを実装し、`ProcessManager` に注入する。

use alloc::sync::Arc;
use core::time::Duration;

use x86_64::{PhysAddr, VirtAddr};

use crate::error::Result;
use crate::task::context::{Context, Entry};
use crate::task::ids::{CpuId, ThreadId};

/// アドレス空間（ページテーブルのルート）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace(PhysAddr);

impl AddressSpace {
    pub const fn new(root: PhysAddr) -> Self {
        Self(root)
    }

    pub fn root(&self) -> PhysAddr {
        self.0
    }
}

/// スタック領域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    base: VirtAddr,
    size: usize,
}

impl StackRegion {
    pub const fn new(base: VirtAddr, size: usize) -> Self {
        Self { base, size }
    }

    /// 領域の開始アドレス（最下位）
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// スタックトップ（スタックは下に伸びる）
    pub fn top(&self) -> VirtAddr {
        self.base + self.size as u64
    }
}

/// 一回限りのタイマーコールバックのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// 仮想メモリ管理
pub trait AddressSpaces {
    /// カーネルのアドレス空間
    fn kernel_space(&self) -> AddressSpace;
    /// 新しいアドレス空間を作成
    fn create_space(&self) -> Result<AddressSpace>;
    /// アドレス空間を破棄
    fn destroy_space(&self, space: AddressSpace);
    /// スレッド用のスタック領域を確保してマップ
    fn allocate_stack(&self, space: AddressSpace, size: usize) -> Result<StackRegion>;
    /// スタック領域を解放
    fn free_stack(&self, space: AddressSpace, stack: StackRegion);
    /// アクティブなアドレス空間を切り替える
    fn activate(&self, space: AddressSpace);
}

/// タイマー
///
/// 期限が来たら組み込み側が `ProcessManager::expire_timer` を呼ぶ。
pub trait Timer {
    /// 時間をティック数に変換
    fn ticks_for(&self, duration: Duration) -> u64;
    /// `ticks` 後に発火するコールバックを登録
    fn arm(&self, ticks: u64, thread: ThreadId) -> TimerHandle;
    /// 登録を取り消す。既に発火していればfalse
    fn cancel(&self, handle: TimerHandle) -> bool;
}

/// 実行イメージのローダー
pub trait ImageLoader {
    /// イメージを読み込んでアドレス空間に配置し、エントリポイントを返す
    fn load(&self, path: &str, space: AddressSpace) -> Result<VirtAddr>;
}

/// SMP（割込み・CPU識別）
pub trait Smp {
    /// 呼び出し元のCPU
    fn current_cpu(&self) -> CpuId;
    /// 他のCPUに再検証を促すプロセッサ間割り込みを送る
    fn send_ipi(&self, cpu: CpuId);
    /// 新しいスレッドを載せるCPUを選ぶ
    fn select_cpu(&self, online: &[CpuId]) -> CpuId {
        let current = self.current_cpu();
        if online.contains(&current) {
            current
        } else {
            online.first().copied().unwrap_or(current)
        }
    }
}

/// アーキテクチャ依存のコンテキスト操作
pub trait Arch {
    /// 新しいスレッドの初期コンテキストを作る（スレッド終了ハンドラの配置を含む）
    fn init_context(
        &self,
        thread: ThreadId,
        entry: Entry,
        stack: &StackRegion,
        space: AddressSpace,
    ) -> Context;

    /// `from` のレジスタを `save` に保存して `to` に切り替える
    ///
    /// `from` が再び選ばれて実行されるまで戻らない。`from` がNoneなら `save` はnull。
    ///
    /// # Safety
    /// `save` はnullか、`from` のスレッド制御ブロック内の `Context` を指すこと。
    /// 制御ブロックは `from` が再び選ばれるまで解放されない。
    unsafe fn switch_context(
        &self,
        cpu: CpuId,
        from: Option<ThreadId>,
        save: *mut Context,
        to: ThreadId,
        context: &Context,
    );

    /// 現在のスレッドを保存せずに `to` へ切り替える（終了したスレッド用）
    fn exit_context(&self, cpu: CpuId, to: ThreadId, context: &Context) -> !;

    /// 次の割り込みまでCPUを停止
    fn halt(&self, cpu: CpuId);
}

/// タスク管理が必要とする外部コンポーネント一式
pub trait Platform: AddressSpaces + Timer + ImageLoader + Smp + Arch + Send + Sync {}

impl<T> Platform for T where T: AddressSpaces + Timer + ImageLoader + Smp + Arch + Send + Sync {}

impl<T: AddressSpaces + ?Sized> AddressSpaces for Arc<T> {
    fn kernel_space(&self) -> AddressSpace {
        (**self).kernel_space()
    }

    fn create_space(&self) -> Result<AddressSpace> {
        (**self).create_space()
    }

    fn destroy_space(&self, space: AddressSpace) {
        (**self).destroy_space(space)
    }

    fn allocate_stack(&self, space: AddressSpace, size: usize) -> Result<StackRegion> {
        (**self).allocate_stack(space, size)
    }

    fn free_stack(&self, space: AddressSpace, stack: StackRegion) {
        (**self).free_stack(space, stack)
    }

    fn activate(&self, space: AddressSpace) {
        (**self).activate(space)
    }
}

impl<T: Timer + ?Sized> Timer for Arc<T> {
    fn ticks_for(&self, duration: Duration) -> u64 {
        (**self).ticks_for(duration)
    }

    fn arm(&self, ticks: u64, thread: ThreadId) -> TimerHandle {
        (**self).arm(ticks, thread)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        (**self).cancel(handle)
    }
}

impl<T: ImageLoader + ?Sized> ImageLoader for Arc<T> {
    fn load(&self, path: &str, space: AddressSpace) -> Result<VirtAddr> {
        (**self).load(path, space)
    }
}

impl<T: Smp + ?Sized> Smp for Arc<T> {
    fn current_cpu(&self) -> CpuId {
        (**self).current_cpu()
    }

    fn send_ipi(&self, cpu: CpuId) {
        (**self).send_ipi(cpu)
    }

    fn select_cpu(&self, online: &[CpuId]) -> CpuId {
        (**self).select_cpu(online)
    }
}

impl<T: Arch + ?Sized> Arch for Arc<T> {
    fn init_context(
        &self,
        thread: ThreadId,
        entry: Entry,
        stack: &StackRegion,
        space: AddressSpace,
    ) -> Context {
        (**self).init_context(thread, entry, stack, space)
    }

    unsafe fn switch_context(
        &self,
        cpu: CpuId,
        from: Option<ThreadId>,
        save: *mut Context,
        to: ThreadId,
        context: &Context,
    ) {
        (**self).switch_context(cpu, from, save, to, context)
    }

    fn exit_context(&self, cpu: CpuId, to: ThreadId, context: &Context) -> ! {
        (**self).exit_context(cpu, to, context)
    }

    fn halt(&self, cpu: CpuId) {
        (**self).halt(cpu)
    }
}
