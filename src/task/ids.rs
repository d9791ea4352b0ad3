use core::fmt;

/// スレッドID
///
/// 下位16ビットがPID、上位16ビットが世代番号。
/// PIDが再利用されても古いIDは一致しない。
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

/// プロセスID（スレッドと同じPID空間を共有する）
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u32);

macro_rules! handle_impl {
    ($name:ident, $tag:literal) => {
        impl $name {
            /// PIDと世代番号から生成
            pub(crate) const fn from_parts(pid: u16, generation: u16) -> Self {
                Self(((generation as u32) << 16) | pid as u32)
            }

            /// 生の32ビット値から復元（0は無効）
            pub fn from_raw(raw: u32) -> Option<Self> {
                if raw & 0xFFFF == 0 {
                    None
                } else {
                    Some(Self(raw))
                }
            }

            /// PIDテーブルのインデックス
            pub fn pid(&self) -> u16 {
                (self.0 & 0xFFFF) as u16
            }

            /// 世代番号
            pub fn generation(&self) -> u16 {
                (self.0 >> 16) as u16
            }

            /// 生の32ビット値
            pub fn as_u32(&self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}:{})", $tag, self.pid(), self.generation())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.pid())
            }
        }
    };
}

handle_impl!(ThreadId, "tid");
handle_impl!(ProcessId, "pid");

/// PIDテーブルのキー（プロセスとスレッドの共用体）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskId {
    Process(ProcessId),
    Thread(ThreadId),
}

impl TaskId {
    pub fn pid(&self) -> u16 {
        match self {
            TaskId::Process(id) => id.pid(),
            TaskId::Thread(id) => id.pid(),
        }
    }
}

/// CPU番号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u32);

impl CpuId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// 待機チャネル
///
/// 待機対象のオブジェクトのアドレスから作るのが慣例。
/// 値そのものに意味はなく、同じカーネル内でのみ比較される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(usize);

impl Channel {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// オブジェクトのアドレスからチャネルを作成
    pub fn of<T: ?Sized>(object: &T) -> Self {
        Self(object as *const T as *const () as usize)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// スリープから起こされた理由（wakenBy）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// このチャネルへのウェイクアップで起床
    Channel(Channel),
    /// タイムアウトで起床
    Timeout,
}

/// スレッドの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// どのランキューにも属していない（作成直後、ランキューから外された直後）
    Inactive,
    /// 実行可能（いずれかのランキューに登録済み）
    Running,
    /// 待機チャネルかタイムアウトを待っている
    Sleep,
    /// 停止中（再開要求を待つ）
    Stopped,
    /// 終了済み（回収待ち）
    Terminated,
}

/// プロセスの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// 生存スレッドがある
    Alive,
    /// すべてのスレッドが終了した
    Exited,
    /// 致命的なフォルトで終了した
    Faulted,
}

/// タスクが保有する権限レベル
///
/// - Core: カーネルモード（Ring0）で動作するタスク。
/// - User: ユーザーモード（Ring3）で動作。イメージから起動されたプロセス。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    /// コアレベルタスク（Ring0）
    Core,
    /// ユーザーレベルタスク（Ring3）
    User,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_parts() {
        let id = ThreadId::from_parts(42, 7);
        assert_eq!(id.pid(), 42);
        assert_eq!(id.generation(), 7);
        assert_eq!(ThreadId::from_raw(id.as_u32()), Some(id));
        assert_eq!(ThreadId::from_raw(0x0003_0000), None);
        assert_ne!(ThreadId::from_parts(42, 8), id);
    }

    #[test]
    fn test_channel_of_object() {
        let a = 1u64;
        let b = 2u64;
        assert_eq!(Channel::of(&a), Channel::of(&a));
        assert_ne!(Channel::of(&a), Channel::of(&b));
    }
}
