use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use super::ids::{PrivilegeLevel, ProcessId, ProcessState, ThreadId};
use super::thread::FaultCode;
use crate::hal::AddressSpace;

/// 外部（ストリーム層）が所有するストリームのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamHandle(u64);

impl StreamHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// プロセス構造体
///
/// アドレス空間とリソースを管理する実行単位。
/// 1つ以上のスレッドを持ち、スレッドの所有者となる。
pub struct Process {
    /// プロセスID
    id: ProcessId,
    /// プロセス名
    name: String,
    /// 起動引数
    args: String,
    /// 権限レベル
    privilege: PrivilegeLevel,
    /// アドレス空間
    space: AddressSpace,
    /// 優先度（0が最高、値が大きいほど低い）。新しいスレッドの既定値
    pub(crate) priority: u8,
    /// 所有するスレッド（作成順）
    pub(crate) threads: Vec<ThreadId>,
    /// 終了していないスレッドの数
    pub(crate) alive: usize,
    /// 最初に作られたスレッド
    pub(crate) main_thread: Option<ThreadId>,
    /// 名前からストリームへの対応表
    pub(crate) streams: BTreeMap<String, StreamHandle>,
    /// プロセスの状態
    pub(crate) state: ProcessState,
    /// 致命的なフォルト
    pub(crate) fault: Option<FaultCode>,
}

impl Process {
    /// 新しいプロセスを作成
    pub fn new(
        id: ProcessId,
        name: &str,
        args: &str,
        privilege: PrivilegeLevel,
        space: AddressSpace,
        priority: u8,
    ) -> Self {
        Self {
            id,
            name: String::from(name),
            args: String::from(args),
            privilege,
            space,
            priority,
            threads: Vec::new(),
            alive: 0,
            main_thread: None,
            streams: BTreeMap::new(),
            state: ProcessState::Alive,
            fault: None,
        }
    }

    /// プロセスIDを取得
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// プロセス名を取得
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &str {
        &self.args
    }

    /// 権限レベルを取得
    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    /// 優先度を取得
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn threads(&self) -> &[ThreadId] {
        &self.threads
    }

    pub fn alive_threads(&self) -> usize {
        self.alive
    }

    pub fn main_thread(&self) -> Option<ThreadId> {
        self.main_thread
    }

    /// プロセスの状態を取得
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn fault(&self) -> Option<FaultCode> {
        self.fault
    }

    /// 生存スレッドがなく、破棄できるかどうか
    pub fn is_reapable(&self) -> bool {
        self.alive == 0
    }

    /// スレッドを登録
    pub(crate) fn adopt(&mut self, thread: ThreadId) {
        self.threads.push(thread);
        self.alive += 1;
        self.main_thread.get_or_insert(thread);
    }

    /// スレッドの終了を反映
    pub(crate) fn thread_exited(&mut self, fault: Option<FaultCode>) {
        self.alive = self.alive.saturating_sub(1);
        if let Some(code) = fault {
            self.fault = Some(code);
            self.state = ProcessState::Faulted;
        } else if self.alive == 0 && self.state == ProcessState::Alive {
            self.state = ProcessState::Exited;
        }
    }

    /// 回収済みのスレッドを一覧から外す
    pub(crate) fn forget(&mut self, thread: ThreadId) {
        self.threads.retain(|t| *t != thread);
    }

    /// ストリームを名前に結び付ける。既存の結び付きは返される
    pub fn attach_stream(&mut self, name: &str, stream: StreamHandle) -> Option<StreamHandle> {
        self.streams.insert(String::from(name), stream)
    }

    pub fn detach_stream(&mut self, name: &str) -> Option<StreamHandle> {
        self.streams.remove(name)
    }

    pub fn stream(&self, name: &str) -> Option<StreamHandle> {
        self.streams.get(name).copied()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("privilege", &self.privilege)
            .field("priority", &self.priority)
            .field("alive", &self.alive)
            .field("space", &format_args!("{:#x}", self.space.root().as_u64()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x86_64::PhysAddr;

    fn process() -> Process {
        Process::new(
            ProcessId::from_parts(1, 0),
            "init",
            "--verbose",
            PrivilegeLevel::User,
            AddressSpace::new(PhysAddr::new(0x2000)),
            32,
        )
    }

    #[test]
    fn test_main_thread_is_first() {
        let mut p = process();
        let a = ThreadId::from_parts(2, 0);
        let b = ThreadId::from_parts(3, 0);
        p.adopt(a);
        p.adopt(b);
        assert_eq!(p.main_thread(), Some(a));
        assert_eq!(p.alive_threads(), 2);
        assert_eq!(p.threads(), &[a, b]);
    }

    #[test]
    fn test_exit_and_fault_states() {
        let mut p = process();
        p.adopt(ThreadId::from_parts(2, 0));
        p.adopt(ThreadId::from_parts(3, 0));
        p.thread_exited(None);
        assert_eq!(p.state(), ProcessState::Alive);
        p.thread_exited(Some(FaultCode::PageFault));
        assert_eq!(p.state(), ProcessState::Faulted);
        assert!(p.is_reapable());
        assert_eq!(p.fault(), Some(FaultCode::PageFault));
    }

    #[test]
    fn test_streams() {
        let mut p = process();
        assert_eq!(p.attach_stream("stdout", StreamHandle::new(1)), None);
        assert_eq!(p.attach_stream("stdout", StreamHandle::new(2)), Some(StreamHandle::new(1)));
        assert_eq!(p.stream("stdout"), Some(StreamHandle::new(2)));
        assert_eq!(p.detach_stream("stdout"), Some(StreamHandle::new(2)));
        assert_eq!(p.stream("stdout"), None);
    }
}
