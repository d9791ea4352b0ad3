//! プロセスマネージャ
//!
//! プロセス・スレッドの生成と破棄、CPUのアタッチ、スリープ/ウェイクアップを
//! 一手に引き受けるカーネルコンテキスト。
//!
//! ロックは必ず 待機テーブル → ランキュー → PIDテーブル の順に取る。
//! PIDアロケータのロックは他のロックと同時に持たない。
//! コンテキストスイッチはすべてのロックを手放してから行う。

mod sched;
mod sleep;

use alloc::string::String;
use alloc::vec::Vec;
use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, Once};

use super::context::{Context, Entry, KernelEntry};
use super::ids::{
    Channel, CpuId, PrivilegeLevel, ProcessId, ProcessState, TaskId, ThreadId, ThreadState,
    WakeReason,
};
use super::pid::PidAllocator;
use super::process::{Process, StreamHandle};
use super::runqueue::{Runqueue, RunqueueStats};
use super::table::TaskTable;
use super::thread::{ErrorCause, ErrorRecord, FaultCode, Thread};
use super::wait::WaitTable;
use crate::config::{Config, IDLE_PRIORITY};
use crate::error::{KernelError, ProcessError, Result};
use crate::hal::{AddressSpace, Platform, TimerHandle};

/// プロセスの実行イメージ
#[derive(Debug, Clone, Copy)]
pub enum ProcessImage<'a> {
    /// カーネル空間の関数から開始する
    Entry(KernelEntry, usize),
    /// 実行ファイルを読み込んでユーザーモードで開始する
    Path(&'a str),
}

/// スレッドの状態のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub process: ProcessId,
    pub name: String,
    pub state: ThreadState,
    pub priority: u8,
    pub next_priority: u8,
    pub slice_ticks: u32,
    pub cpu: Option<CpuId>,
    pub is_active: bool,
    pub wait_reason: &'static str,
    /// 待機中のチャネル
    pub channels: Vec<Channel>,
    pub timer: Option<TimerHandle>,
    pub waken_by: Option<WakeReason>,
    pub exit_code: Option<i32>,
    pub fault: Option<FaultCode>,
}

/// プロセスの状態のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub name: String,
    pub args: String,
    pub privilege: PrivilegeLevel,
    pub priority: u8,
    pub state: ProcessState,
    pub threads: Vec<ThreadId>,
    pub alive_threads: usize,
    pub main_thread: Option<ThreadId>,
    pub fault: Option<FaultCode>,
}

/// CPUごとの状態
pub(crate) struct CpuState {
    id: CpuId,
    runqueue: Mutex<Runqueue>,
    /// 実行中のスレッド（ロックなしで読む。書くのはこのCPUだけ）
    current: AtomicU32,
    idle: AtomicU32,
    /// 次の特権モードからの復帰で再スケジュールする
    need_resched: AtomicBool,
    /// 実行中のスレッドに他のCPUからの要求が届いている
    mailbox: AtomicBool,
    /// 終了したが、まだこのCPUのスタック上にいるかもしれないスレッド
    retiring: AtomicU32,
}

impl CpuState {
    fn new(id: CpuId, config: Config) -> Self {
        Self {
            id,
            runqueue: Mutex::new(Runqueue::new(id, config)),
            current: AtomicU32::new(0),
            idle: AtomicU32::new(0),
            need_resched: AtomicBool::new(false),
            mailbox: AtomicBool::new(false),
            retiring: AtomicU32::new(0),
        }
    }

    fn current(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.current.load(Ordering::Acquire))
    }
}

/// アイドルスレッドの名目上のエントリ。アイドルスレッドは起動時のスタックで
/// `attach_cpu` のループを実行するため、呼ばれることはない。
fn idle_entry(_cpu: usize) -> i32 {
    0
}

/// プロセスマネージャ
pub struct ProcessManager<P: Platform> {
    platform: P,
    config: Config,
    waits: Mutex<WaitTable>,
    cpus: Vec<Once<CpuState>>,
    pids: Mutex<PidAllocator>,
    table: Mutex<TaskTable>,
    kernel_process: Once<ProcessId>,
}

impl<P: Platform> ProcessManager<P> {
    /// プロセスマネージャを作成
    pub fn new(config: Config, platform: P) -> Result<Self> {
        config.validate()?;
        log::info!(
            "Process manager: {} CPUs, {} PIDs, slices {}..{} ticks",
            config.max_cpus,
            config.pid_limit,
            config.min_slice_ticks,
            config.max_slice_ticks
        );

        Ok(Self {
            platform,
            config,
            waits: Mutex::new(WaitTable::new()),
            cpus: (0..config.max_cpus).map(|_| Once::new()).collect(),
            pids: Mutex::new(PidAllocator::new(config.pid_limit)),
            table: Mutex::new(TaskTable::new(config.pid_limit)),
            kernel_process: Once::new(),
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn cpu_state(&self, cpu: CpuId) -> Result<&CpuState> {
        self.cpus
            .get(cpu.index())
            .and_then(Once::get)
            .ok_or_else(|| ProcessError::CpuOffline.into())
    }

    fn this_cpu(&self) -> Result<&CpuState> {
        self.cpu_state(self.platform.current_cpu())
    }

    /// アタッチ済みのCPU
    pub fn online_cpus(&self) -> Vec<CpuId> {
        self.cpus.iter().filter_map(Once::get).map(|c| c.id).collect()
    }

    fn is_idle_thread(&self, id: ThreadId) -> bool {
        self.cpus
            .iter()
            .filter_map(Once::get)
            .any(|c| c.idle.load(Ordering::Acquire) == id.as_u32())
    }

    fn check_priority(priority: u8) -> Result<()> {
        if priority < IDLE_PRIORITY {
            Ok(())
        } else {
            Err(KernelError::InvalidParam)
        }
    }

    fn allocate_pid(&self) -> Result<(u16, u16)> {
        self.pids.lock().allocate().ok_or_else(|| {
            log::warn!("PID space exhausted");
            ProcessError::NoPid.into()
        })
    }

    fn release_pid(&self, pid: u16) {
        if !self.pids.lock().release(pid) {
            log::warn!("Released PID {} was not allocated", pid);
        }
    }

    /// 呼び出し元のCPUをアタッチし、スケジューラに制御を渡す
    ///
    /// 最初の呼び出しでカーネルプロセスを作成する。`kernel_entry` を渡すと
    /// カーネルプロセスに "main" スレッドを作ってこのCPUで実行する。
    /// 成功した場合は戻らない。
    pub fn attach_cpu(&self, kernel_entry: Option<(KernelEntry, usize)>) -> Result<Infallible> {
        let idle = self.bring_up(kernel_entry)?;
        let cpu = self.platform.current_cpu();
        log::info!("CPU {} attached (idle {:?})", cpu.as_u32(), idle);
        self.idle_loop(cpu)
    }

    fn idle_loop(&self, cpu: CpuId) -> Result<Infallible> {
        loop {
            self.schedule()?;
            self.platform.halt(cpu);
        }
    }

    /// CPUの状態とアイドルスレッドを作成（スケジューラには入らない）
    fn bring_up(&self, kernel_entry: Option<(KernelEntry, usize)>) -> Result<ThreadId> {
        let cpu = self.platform.current_cpu();
        let slot = self.cpus.get(cpu.index()).ok_or(KernelError::InvalidParam)?;

        let mut fresh = false;
        let state = slot.call_once(|| {
            fresh = true;
            CpuState::new(cpu, self.config)
        });
        if !fresh {
            return Err(ProcessError::CpuAlreadyAttached.into());
        }

        let kernel = *self.kernel_process.try_call_once(|| self.create_kernel_process())?;
        if let Some((func, arg)) = kernel_entry {
            self.spawn_thread(kernel, "main", Entry::Kernel { func, arg }, None, Some(cpu))?;
        }
        self.create_idle_thread(kernel, state)
    }

    fn create_kernel_process(&self) -> Result<ProcessId> {
        let (pid, generation) = self.allocate_pid()?;
        let id = ProcessId::from_parts(pid, generation);
        let process = Process::new(
            id,
            "kernel",
            "",
            PrivilegeLevel::Core,
            self.platform.kernel_space(),
            self.config.default_priority,
        );

        let inserted = self.table.lock().insert_process(process);
        if let Err(e) = inserted {
            self.release_pid(pid);
            return Err(e);
        }
        log::info!("Kernel process created: {:?}", id);
        Ok(id)
    }

    fn create_idle_thread(&self, kernel: ProcessId, state: &CpuState) -> Result<ThreadId> {
        let (pid, generation) = self.allocate_pid()?;
        let id = ThreadId::from_parts(pid, generation);
        let entry = Entry::Kernel { func: idle_entry, arg: state.id.index() };
        let space = self.platform.kernel_space();
        let thread = Thread::new(id, kernel, "idle", IDLE_PRIORITY, entry, Context::new(), space, None);

        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();
        table.insert_thread(thread)?;
        table.lookup_process_mut(kernel)?.adopt(id);
        rq.set_idle(&mut table, id)?;
        rq.set_current(id);
        table.lookup_thread_mut(id)?.is_active = true;
        state.idle.store(id.as_u32(), Ordering::Release);
        state.current.store(id.as_u32(), Ordering::Release);
        Ok(id)
    }

    /// 新しいプロセスを作成し、最初のスレッドを実行可能にする
    ///
    /// 途中で失敗した場合、確保したPID・アドレス空間・プロセスはすべて解放される。
    pub fn create_process(
        &self,
        image: ProcessImage<'_>,
        name: &str,
        priority: u8,
        args: &str,
    ) -> Result<ProcessId> {
        Self::check_priority(priority)?;
        let (pid, generation) = self.allocate_pid()?;
        let id = ProcessId::from_parts(pid, generation);

        let space = match self.platform.create_space() {
            Ok(space) => space,
            Err(e) => {
                self.release_pid(pid);
                return Err(e);
            }
        };

        match self.populate(id, image, name, priority, args, space) {
            Ok(main) => {
                log::info!("Process created: {:?} '{}' (main {:?})", id, name, main);
                Ok(id)
            }
            Err(e) => {
                log::warn!("Failed to create process '{}': {}", name, e);
                self.platform.destroy_space(space);
                self.release_pid(pid);
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        id: ProcessId,
        image: ProcessImage<'_>,
        name: &str,
        priority: u8,
        args: &str,
        space: AddressSpace,
    ) -> Result<ThreadId> {
        let (entry, privilege) = match image {
            ProcessImage::Entry(func, arg) => (Entry::Kernel { func, arg }, PrivilegeLevel::Core),
            ProcessImage::Path(path) => {
                let entry = self.platform.load(path, space)?;
                (Entry::User { entry, arg: 0 }, PrivilegeLevel::User)
            }
        };

        let process = Process::new(id, name, args, privilege, space, priority);
        self.table.lock().insert_process(process)?;

        self.spawn_thread(id, name, entry, Some(priority), None).inspect_err(|_| {
            self.table.lock().remove_process(id);
        })
    }

    /// プロセスに新しいスレッドを作成して実行可能にする
    ///
    /// 優先度を省略するとプロセスの優先度になる。
    pub fn create_thread(
        &self,
        process: ProcessId,
        name: &str,
        entry: Entry,
        priority: Option<u8>,
    ) -> Result<ThreadId> {
        self.spawn_thread(process, name, entry, priority, None)
    }

    fn spawn_thread(
        &self,
        process: ProcessId,
        name: &str,
        entry: Entry,
        priority: Option<u8>,
        cpu: Option<CpuId>,
    ) -> Result<ThreadId> {
        if let Some(priority) = priority {
            Self::check_priority(priority)?;
        }

        let (space, default_priority) = {
            let table = self.table.lock();
            let process = table.lookup_process(process)?;
            if process.state() != ProcessState::Alive {
                return Err(ProcessError::InvalidState.into());
            }
            (process.space(), process.priority())
        };
        let priority = priority.unwrap_or(default_priority);
        let cpu = match cpu {
            Some(cpu) => cpu,
            None => self.platform.select_cpu(&self.online_cpus()),
        };
        let state = self.cpu_state(cpu)?;

        let (pid, generation) = self.allocate_pid()?;
        let id = ThreadId::from_parts(pid, generation);
        let size = if entry.is_usermode() {
            self.config.user_stack_size
        } else {
            self.config.kernel_stack_size
        };
        let stack = match self.platform.allocate_stack(space, size) {
            Ok(stack) => stack,
            Err(e) => {
                self.release_pid(pid);
                return Err(e);
            }
        };
        let context = self.platform.init_context(id, entry, &stack, space);
        let thread = Thread::new(id, process, name, priority, entry, context, space, Some(stack));

        let admitted = {
            let mut rq = state.runqueue.lock();
            let mut table = self.table.lock();
            self.admit_new(state, &mut rq, &mut table, thread)
        };
        if let Err(e) = admitted {
            self.platform.free_stack(space, stack);
            self.release_pid(pid);
            return Err(e);
        }
        Ok(id)
    }

    fn admit_new(
        &self,
        state: &CpuState,
        rq: &mut Runqueue,
        table: &mut TaskTable,
        thread: Thread,
    ) -> Result<()> {
        let (id, process) = (thread.id(), thread.process_id());
        if table.lookup_process(process)?.state() != ProcessState::Alive {
            return Err(ProcessError::InvalidState.into());
        }
        table.insert_thread(thread)?;
        table.lookup_process_mut(process)?.adopt(id);
        rq.add_thread(table, id)?;
        self.notify_if_preempting(state, rq, table);
        Ok(())
    }

    /// より緊急なスレッドが入ったCPUに再スケジュールを促す
    fn notify_if_preempting(&self, state: &CpuState, rq: &Runqueue, table: &TaskTable) {
        if rq.should_preempt(table) {
            state.need_resched.store(true, Ordering::Release);
            if state.id != self.platform.current_cpu() {
                self.platform.send_ipi(state.id);
            }
        }
    }

    /// 終了したスレッドの後始末（PIDテーブルのロックを保持して呼ぶ）
    fn finish_thread(
        &self,
        table: &mut TaskTable,
        id: ThreadId,
        exit_code: i32,
        fault: Option<FaultCode>,
    ) -> Result<()> {
        let (thread, process) = table.thread_and_process_mut(id)?;
        thread.terminate(exit_code, fault);
        process.thread_exited(fault);

        if let Some(fault) = fault {
            log::warn!("Thread {:?} terminated by fault {:?}", id, fault);
        } else {
            log::debug!("Thread {:?} exited with code {}", id, exit_code);
        }
        if process.alive_threads() == 0 {
            log::info!("Process {:?} '{}' finished: {:?}", process.id(), process.name(), process.state());
        }
        Ok(())
    }

    /// 終了したスレッドを回収し、スタックとPIDを解放する
    ///
    /// # Returns
    /// スレッドの終了コード
    pub fn reap_thread(&self, id: ThreadId) -> Result<i32> {
        let mut thread = {
            let mut table = self.table.lock();
            let thread = table.lookup_thread(id)?;
            if thread.state() != ThreadState::Terminated || thread.is_active() {
                return Err(ProcessError::InvalidState.into());
            }
            let process = thread.process_id();
            let thread = table.remove_thread(id).ok_or(ProcessError::ThreadNotFound)?;
            if let Some(process) = table.process_mut(process) {
                process.forget(id);
            }
            thread
        };

        if let Some(stack) = thread.take_stack() {
            self.platform.free_stack(thread.space(), stack);
        }
        self.release_pid(id.pid());
        Ok(thread.exit_code().unwrap_or(0))
    }

    /// 生存スレッドのないプロセスを破棄する
    ///
    /// 残っている終了済みスレッドを回収し、アドレス空間とPIDを解放する。
    pub fn destroy_process(&self, id: ProcessId) -> Result<()> {
        if self.kernel_process() == Some(id) {
            return Err(ProcessError::InvalidState.into());
        }

        let (process, threads) = {
            let mut table = self.table.lock();
            let process = table.lookup_process(id)?;
            if process.alive_threads() > 0 {
                log::warn!("Refusing to destroy {:?}: {} threads alive", id, process.alive_threads());
                return Err(ProcessError::ThreadsAlive.into());
            }
            let ids = process.threads().to_vec();
            if ids.iter().any(|t| table.thread(*t).is_some_and(Thread::is_active)) {
                return Err(ProcessError::InvalidState.into());
            }

            let threads: Vec<Thread> = ids.iter().filter_map(|t| table.remove_thread(*t)).collect();
            let process = table.remove_process(id).ok_or(ProcessError::ProcessNotFound)?;
            (process, threads)
        };

        for mut thread in threads {
            if let Some(stack) = thread.take_stack() {
                self.platform.free_stack(thread.space(), stack);
            }
            self.release_pid(thread.id().pid());
        }
        self.platform.destroy_space(process.space());
        self.release_pid(id.pid());
        log::info!("Process destroyed: {:?} '{}'", id, process.name());
        Ok(())
    }

    /// 呼び出し元のCPUで実行中のスレッド
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.this_cpu().ok()?.current()
    }

    /// 呼び出し元のCPUで実行中のスレッドが属するプロセス
    pub fn current_process(&self) -> Option<ProcessId> {
        let current = self.current_thread()?;
        self.table.lock().thread(current).map(Thread::process_id)
    }

    pub fn kernel_process(&self) -> Option<ProcessId> {
        self.kernel_process.get().copied()
    }

    /// スレッドの優先度を変更する（次のラウンドから有効）
    pub fn set_thread_priority(&self, id: ThreadId, priority: u8) -> Result<()> {
        Self::check_priority(priority)?;
        if self.is_idle_thread(id) {
            return Err(ProcessError::InvalidState.into());
        }

        let mut table = self.table.lock();
        let thread = table.lookup_thread_mut(id)?;
        if thread.state() == ThreadState::Terminated {
            return Err(ProcessError::InvalidState.into());
        }
        thread.next_priority = priority;
        Ok(())
    }

    /// プロセスの優先度を変更し、生存スレッドにも反映する
    pub fn set_process_priority(&self, id: ProcessId, priority: u8) -> Result<()> {
        Self::check_priority(priority)?;
        if self.kernel_process() == Some(id) {
            return Err(ProcessError::InvalidState.into());
        }

        let mut table = self.table.lock();
        let process = table.lookup_process_mut(id)?;
        process.priority = priority;
        let threads = process.threads().to_vec();
        for id in threads {
            let Some(thread) = table.thread_mut(id) else {
                continue;
            };
            if thread.state() != ThreadState::Terminated {
                thread.next_priority = priority;
            }
        }
        Ok(())
    }

    /// ストリームを名前に結び付ける
    ///
    /// # Returns
    /// 同じ名前に結び付いていた以前のストリーム
    pub fn attach_stream(
        &self,
        process: ProcessId,
        name: &str,
        stream: StreamHandle,
    ) -> Result<Option<StreamHandle>> {
        Ok(self.table.lock().lookup_process_mut(process)?.attach_stream(name, stream))
    }

    pub fn detach_stream(&self, process: ProcessId, name: &str) -> Result<Option<StreamHandle>> {
        Ok(self.table.lock().lookup_process_mut(process)?.detach_stream(name))
    }

    pub fn stream(&self, process: ProcessId, name: &str) -> Result<Option<StreamHandle>> {
        Ok(self.table.lock().lookup_process(process)?.stream(name))
    }

    /// スレッドの現在のエラースロットにエラーを記録
    pub fn record_error(&self, id: ThreadId, error: KernelError, message: &str) -> Result<()> {
        log::debug!("Thread {:?}: {} ({})", id, error, message);
        self.table.lock().lookup_thread_mut(id)?.errors.set(ErrorCause::Kernel(error), message);
        Ok(())
    }

    /// 新しいエラースロットを始める（システムコールの入口）
    pub fn next_error(&self, id: ThreadId) -> Result<()> {
        self.table.lock().lookup_thread_mut(id)?.errors.next();
        Ok(())
    }

    /// 直前のエラースロットに戻る
    pub fn prev_error(&self, id: ThreadId) -> Result<()> {
        self.table.lock().lookup_thread_mut(id)?.errors.prev();
        Ok(())
    }

    pub fn last_error(&self, id: ThreadId) -> Result<Option<ErrorRecord>> {
        Ok(self.table.lock().lookup_thread(id)?.errors().current().cloned())
    }

    pub fn previous_error(&self, id: ThreadId) -> Result<Option<ErrorRecord>> {
        Ok(self.table.lock().lookup_thread(id)?.errors().previous().cloned())
    }

    pub fn thread_info(&self, id: ThreadId) -> Result<ThreadInfo> {
        let waits = self.waits.lock();
        let table = self.table.lock();
        let thread = table.lookup_thread(id)?;

        Ok(ThreadInfo {
            id,
            process: thread.process_id(),
            name: String::from(thread.name()),
            state: thread.state(),
            priority: thread.priority(),
            next_priority: thread.next_priority(),
            slice_ticks: thread.slice_ticks(),
            cpu: thread.cpu(),
            is_active: thread.is_active(),
            wait_reason: thread.wait_reason,
            channels: waits.channels_of(id).to_vec(),
            timer: thread.timer,
            waken_by: thread.waken_by(),
            exit_code: thread.exit_code(),
            fault: thread.fault(),
        })
    }

    pub fn process_info(&self, id: ProcessId) -> Result<ProcessInfo> {
        let table = self.table.lock();
        let process = table.lookup_process(id)?;

        Ok(ProcessInfo {
            id,
            name: String::from(process.name()),
            args: String::from(process.args()),
            privilege: process.privilege(),
            priority: process.priority(),
            state: process.state(),
            threads: process.threads().to_vec(),
            alive_threads: process.alive_threads(),
            main_thread: process.main_thread(),
            fault: process.fault(),
        })
    }

    /// 生のPIDをプロセスかスレッドのハンドルに解決する
    pub fn resolve(&self, pid: u16) -> Option<TaskId> {
        self.table.lock().resolve(pid)
    }

    /// 登録されているプロセスの一覧
    pub fn processes(&self) -> Vec<ProcessId> {
        self.table.lock().processes().map(Process::id).collect()
    }

    pub fn runqueue_stats(&self, cpu: CpuId) -> Result<RunqueueStats> {
        Ok(self.cpu_state(cpu)?.runqueue.lock().stats())
    }

    /// ランキュー内のスレッド（active側、expired側の順）
    pub fn queued_threads(&self, cpu: CpuId) -> Result<Vec<ThreadId>> {
        let rq = self.cpu_state(cpu)?.runqueue.lock();
        let table = self.table.lock();
        Ok(rq.queued_threads(&table))
    }
}
