//! PIDテーブル
//!
//! PIDをインデックスとして、プロセスまたはスレッドを保持する。
//! ハンドルの世代番号が一致しない参照は見つからなかったものとして扱う。

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::ids::{ProcessId, TaskId, ThreadId};
use super::process::Process;
use super::thread::Thread;
use crate::error::{ProcessError, Result};

/// テーブルの1エントリ
enum Slot {
    Process(Box<Process>),
    Thread(Box<Thread>),
}

/// プロセスとスレッドの所有者
pub struct TaskTable {
    slots: Vec<Option<Slot>>,
    processes: usize,
    threads: usize,
}

impl TaskTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, processes: 0, threads: 0 }
    }

    /// スレッドを登録（スロットはPIDアロケータで確保済みであること）
    pub fn insert_thread(&mut self, thread: Thread) -> Result<()> {
        let pid = thread.id().pid() as usize;
        let slot = self.vacant(pid)?;
        *slot = Some(Slot::Thread(Box::new(thread)));
        self.threads += 1;
        Ok(())
    }

    pub fn insert_process(&mut self, process: Process) -> Result<()> {
        let pid = process.id().pid() as usize;
        let slot = self.vacant(pid)?;
        *slot = Some(Slot::Process(Box::new(process)));
        self.processes += 1;
        Ok(())
    }

    fn vacant(&mut self, pid: usize) -> Result<&mut Option<Slot>> {
        match self.slots.get_mut(pid) {
            Some(slot @ None) => Ok(slot),
            Some(Some(_)) => Err(ProcessError::InvalidState.into()),
            None => Err(ProcessError::NoPid.into()),
        }
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        match self.slots.get(id.pid() as usize)? {
            Some(Slot::Thread(t)) if t.id() == id => Some(&**t),
            _ => None,
        }
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        match self.slots.get_mut(id.pid() as usize)? {
            Some(Slot::Thread(t)) if t.id() == id => Some(&mut **t),
            _ => None,
        }
    }

    pub fn process(&self, id: ProcessId) -> Option<&Process> {
        match self.slots.get(id.pid() as usize)? {
            Some(Slot::Process(p)) if p.id() == id => Some(&**p),
            _ => None,
        }
    }

    pub fn process_mut(&mut self, id: ProcessId) -> Option<&mut Process> {
        match self.slots.get_mut(id.pid() as usize)? {
            Some(Slot::Process(p)) if p.id() == id => Some(&mut **p),
            _ => None,
        }
    }

    /// スレッドを取得（見つからなければエラー）
    pub fn lookup_thread(&self, id: ThreadId) -> Result<&Thread> {
        self.thread(id).ok_or_else(|| ProcessError::ThreadNotFound.into())
    }

    pub fn lookup_thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread> {
        self.thread_mut(id).ok_or_else(|| ProcessError::ThreadNotFound.into())
    }

    pub fn lookup_process(&self, id: ProcessId) -> Result<&Process> {
        self.process(id).ok_or_else(|| ProcessError::ProcessNotFound.into())
    }

    pub fn lookup_process_mut(&mut self, id: ProcessId) -> Result<&mut Process> {
        self.process_mut(id).ok_or_else(|| ProcessError::ProcessNotFound.into())
    }

    /// スレッドとその所属プロセスを同時に借用
    pub fn thread_and_process_mut(
        &mut self,
        id: ThreadId,
    ) -> Result<(&mut Thread, &mut Process)> {
        let process_id = self.lookup_thread(id)?.process_id();
        let (tpid, ppid) = (id.pid() as usize, process_id.pid() as usize);
        if tpid == ppid {
            return Err(ProcessError::InvalidState.into());
        }

        // 2つのスロットを分割して借用する
        let (low, high) = (tpid.min(ppid), tpid.max(ppid));
        let (head, tail) = self.slots.split_at_mut(high);
        let (a, b) = (&mut head[low], &mut tail[0]);
        let (tslot, pslot) = if tpid < ppid { (a, b) } else { (b, a) };

        match (tslot, pslot) {
            (Some(Slot::Thread(t)), Some(Slot::Process(p))) if p.id() == process_id => {
                Ok((&mut **t, &mut **p))
            }
            (_, _) => Err(ProcessError::ProcessNotFound.into()),
        }
    }

    pub fn remove_thread(&mut self, id: ThreadId) -> Option<Thread> {
        self.thread(id)?;
        match self.slots.get_mut(id.pid() as usize)?.take() {
            Some(Slot::Thread(t)) => {
                self.threads -= 1;
                Some(*t)
            }
            _ => None,
        }
    }

    pub fn remove_process(&mut self, id: ProcessId) -> Option<Process> {
        self.process(id)?;
        match self.slots.get_mut(id.pid() as usize)?.take() {
            Some(Slot::Process(p)) => {
                self.processes -= 1;
                Some(*p)
            }
            _ => None,
        }
    }

    /// PIDが指しているプロセスまたはスレッド
    pub fn resolve(&self, pid: u16) -> Option<TaskId> {
        match self.slots.get(pid as usize)? {
            Some(Slot::Process(p)) => Some(TaskId::Process(p.id())),
            Some(Slot::Thread(t)) => Some(TaskId::Thread(t.id())),
            None => None,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }

    pub fn process_count(&self) -> usize {
        self.processes
    }

    /// 登録されているすべてのスレッド
    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.slots.iter().filter_map(|slot| match slot {
            Some(Slot::Thread(t)) => Some(&**t),
            _ => None,
        })
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.slots.iter().filter_map(|slot| match slot {
            Some(Slot::Process(p)) => Some(&**p),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::hal::{AddressSpace, StackRegion};
    use crate::task::context::{Context, Entry};
    use crate::task::ids::PrivilegeLevel;
    use x86_64::{PhysAddr, VirtAddr};

    fn space() -> AddressSpace {
        AddressSpace::new(PhysAddr::new(0x1000))
    }

    fn thread(id: ThreadId, process: ProcessId) -> Thread {
        let entry = Entry::User { entry: VirtAddr::new(0x40_0000), arg: 0 };
        let stack = StackRegion::new(VirtAddr::new(0x10_0000), 0x1000);
        let ctx = Context::for_entry(&entry, &stack, space());
        Thread::new(id, process, "worker", 10, entry, ctx, space(), Some(stack))
    }

    #[test]
    fn test_generation_checked_lookup() {
        let mut table = TaskTable::new(16);
        let pid = ProcessId::from_parts(1, 0);
        table.insert_process(Process::new(pid, "p", "", PrivilegeLevel::User, space(), 10)).unwrap();
        let tid = ThreadId::from_parts(2, 3);
        table.insert_thread(thread(tid, pid)).unwrap();

        assert!(table.thread(tid).is_some());
        assert!(table.thread(ThreadId::from_parts(2, 4)).is_none());
        assert!(table.process(ProcessId::from_parts(2, 3)).is_none());
        assert_eq!(
            table.lookup_thread(ThreadId::from_parts(2, 2)).err(),
            Some(KernelError::from(ProcessError::ThreadNotFound))
        );
        assert_eq!(table.thread_count(), 1);
        assert_eq!(table.process_count(), 1);
        assert_eq!(table.resolve(1), Some(TaskId::Process(pid)));
        assert_eq!(table.resolve(2), Some(TaskId::Thread(tid)));
        assert_eq!(table.resolve(3), None);
    }

    #[test]
    fn test_split_borrow() {
        let mut table = TaskTable::new(16);
        let pid = ProcessId::from_parts(5, 0);
        table.insert_process(Process::new(pid, "p", "", PrivilegeLevel::User, space(), 10)).unwrap();
        let tid = ThreadId::from_parts(3, 0);
        table.insert_thread(thread(tid, pid)).unwrap();

        let (t, p) = table.thread_and_process_mut(tid).unwrap();
        p.adopt(t.id());
        t.priority = 4;
        assert_eq!(table.process(pid).unwrap().main_thread(), Some(tid));
        assert_eq!(table.thread(tid).unwrap().priority(), 4);
    }

    #[test]
    fn test_occupied_slot_rejected() {
        let mut table = TaskTable::new(4);
        let pid = ProcessId::from_parts(1, 0);
        table.insert_process(Process::new(pid, "p", "", PrivilegeLevel::User, space(), 10)).unwrap();
        assert!(table.insert_thread(thread(ThreadId::from_parts(1, 1), pid)).is_err());
        assert!(table.remove_process(pid).is_some());
        assert!(table.remove_process(pid).is_none());
        assert_eq!(table.process_count(), 0);
    }
}
