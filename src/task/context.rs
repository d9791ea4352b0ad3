use x86_64::VirtAddr;

use crate::hal::{AddressSpace, StackRegion};

/// カーネルモードスレッドのエントリ関数。戻り値は終了コードになる。
pub type KernelEntry = fn(usize) -> i32;

/// スレッドの開始位置
#[derive(Debug, Clone, Copy)]
pub enum Entry {
    /// カーネル空間の関数を引数付きで呼び出す
    Kernel { func: KernelEntry, arg: usize },
    /// ユーザー空間のアドレスから実行する（イメージから解決されたもの）
    User { entry: VirtAddr, arg: usize },
}

impl Entry {
    /// 最初のコンテキストスイッチで着地する命令アドレス
    pub fn instruction_pointer(&self) -> VirtAddr {
        match self {
            Entry::Kernel { func, .. } => VirtAddr::new_truncate(*func as usize as u64),
            Entry::User { entry, .. } => *entry,
        }
    }

    /// エントリに渡す引数
    pub fn argument(&self) -> usize {
        match self {
            Entry::Kernel { arg, .. } | Entry::User { arg, .. } => *arg,
        }
    }

    pub fn is_usermode(&self) -> bool {
        matches!(self, Entry::User { .. })
    }
}

/// CPU コンテキスト（切替時に保存・復元されるレジスタ）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rip: u64,
    /// 第1引数レジスタ
    pub rdi: u64,
    pub rflags: u64,
    /// ページテーブルのルート
    pub cr3: u64,
}

impl Context {
    /// RFLAGSの初期値（割り込み有効）
    pub const INITIAL_RFLAGS: u64 = 0x202;

    pub const fn new() -> Self {
        Self { rsp: 0, rbp: 0, rip: 0, rdi: 0, rflags: 0, cr3: 0 }
    }

    /// 初回の切替でエントリに引数付きで着地するコンテキストを作成
    ///
    /// スタックトップを16バイト境界に合わせ、戻り先アドレス用に1スロット空ける。
    /// 戻り先（スレッド終了ハンドラ）の書き込みはアーキテクチャ側が行う。
    pub fn for_entry(entry: &Entry, stack: &StackRegion, space: AddressSpace) -> Self {
        let stack_top = stack.top().as_u64() & !0xF;
        let stack_ptr = stack_top - 8;

        Self {
            rsp: stack_ptr,
            rbp: stack_top,
            rip: entry.instruction_pointer().as_u64(),
            rdi: entry.argument() as u64,
            rflags: Self::INITIAL_RFLAGS,
            cr3: space.root().as_u64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    fn entry(_: usize) -> i32 {
        0
    }

    #[test]
    fn test_seeded_context() {
        let stack = StackRegion::new(VirtAddr::new(0x10_0000), 0x2004);
        let space = AddressSpace::new(PhysAddr::new(0x5000));
        let e = Entry::User { entry: VirtAddr::new(0x40_1000), arg: 9 };
        let ctx = Context::for_entry(&e, &stack, space);

        assert_eq!(ctx.rbp, 0x10_2000);
        assert_eq!(ctx.rsp, 0x10_2000 - 8);
        assert_eq!(ctx.rip, 0x40_1000);
        assert_eq!(ctx.rdi, 9);
        assert_eq!(ctx.cr3, 0x5000);
        assert_eq!(ctx.rflags, Context::INITIAL_RFLAGS);
    }

    #[test]
    fn test_kernel_entry_pointer() {
        let e = Entry::Kernel { func: entry, arg: 3 };
        assert_eq!(e.argument(), 3);
        assert!(!e.is_usermode());
        assert_ne!(e.instruction_pointer().as_u64(), 0);
    }
}
