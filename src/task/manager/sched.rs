//! スケジューリングと実行中スレッドの制御
//!
//! ティック、再スケジュール、CPU間要求の処理、停止・再開・終了。

use core::ptr;
use core::sync::atomic::Ordering;

use super::{CpuState, ProcessManager};
use crate::error::{ProcessError, Result};
use crate::hal::{AddressSpace, Platform};
use crate::task::context::Context;
use crate::task::ids::{CpuId, ProcessId, ThreadId, ThreadState};
use crate::task::runqueue::Runqueue;
use crate::task::table::TaskTable;
use crate::task::thread::{ErrorCause, FaultCode, Requests, Severity};

/// ロックを手放した後に行うコンテキストスイッチ
#[derive(Debug, Clone, Copy)]
pub(super) struct Switch {
    pub(super) cpu: CpuId,
    pub(super) from: Option<ThreadId>,
    /// `from` のレジスタの保存先（`from` がNoneならnull）
    pub(super) save: *mut Context,
    pub(super) to: ThreadId,
    pub(super) context: Context,
    pub(super) space: AddressSpace,
    /// アドレス空間の切り替えが必要
    pub(super) activate: bool,
}

impl<P: Platform> ProcessManager<P> {
    /// 次に実行するスレッドを選び、切り替えを準備する
    ///
    /// ランキューとPIDテーブルのロックを保持して呼ぶ。
    /// 選ばれたのが `from` 自身ならNone。
    pub(super) fn hand_off(
        &self,
        state: &CpuState,
        rq: &mut Runqueue,
        table: &mut TaskTable,
        from: Option<ThreadId>,
    ) -> Result<Option<Switch>> {
        let to = rq.select_thread()?;
        if Some(to) == from {
            return Ok(None);
        }

        // 前回切り替えられたスレッドは、もうこのCPUのスタックを使っていない
        if let Some(old) = ThreadId::from_raw(state.retiring.swap(0, Ordering::AcqRel)) {
            if let Some(thread) = table.thread_mut(old) {
                thread.is_active = false;
            }
        }

        // `from` の制御ブロックは保存が終わるまで回収させない
        let mut from_space = None;
        let mut save = ptr::null_mut();
        if let Some(from) = from {
            if let Some(thread) = table.thread_mut(from) {
                from_space = Some(thread.space());
                if thread.state() != ThreadState::Terminated {
                    save = &mut thread.context as *mut Context;
                }
                state.retiring.store(from.as_u32(), Ordering::Release);
            }
        }

        let next = table.lookup_thread_mut(to)?;
        next.is_active = true;
        if !next.requests.is_empty() {
            state.mailbox.store(true, Ordering::Release);
        }
        let (context, space) = (next.context, next.space());

        rq.set_current(to);
        state.current.store(to.as_u32(), Ordering::Release);
        log::debug!("CPU {}: switch {:?} -> {:?}", state.id.as_u32(), from, to);

        Ok(Some(Switch {
            cpu: state.id,
            from,
            save,
            to,
            context,
            space,
            activate: from_space != Some(space),
        }))
    }

    /// コンテキストスイッチを実行する（ロックを持たずに呼ぶ）
    ///
    /// `from` が再び選ばれたときに戻る。
    pub(super) fn perform(&self, switch: Switch) {
        if switch.activate {
            self.platform.activate(switch.space);
        }
        // SAFETY: `save` はTaskTable内でBox化されたスレッドを指す。
        // `from` は `retiring` に残っている間 `is_active` のままで、回収されない。
        unsafe {
            self.platform
                .switch_context(switch.cpu, switch.from, switch.save, switch.to, &switch.context);
        }
        self.retire_previous(switch.cpu);
    }

    /// 切り替え前のスレッドがCPUを離れたことを記録
    fn retire_previous(&self, cpu: CpuId) {
        let Ok(state) = self.cpu_state(cpu) else {
            return;
        };
        if let Some(old) = ThreadId::from_raw(state.retiring.swap(0, Ordering::AcqRel)) {
            if state.current.load(Ordering::Acquire) == old.as_u32() {
                return;
            }
            if let Some(thread) = self.table.lock().thread_mut(old) {
                thread.is_active = false;
            }
        }
    }

    /// タイマーティック（呼び出し元のCPU）
    ///
    /// 実行中のスレッドのスライスを1つ減らし、使い切ったらexpired側に移す。
    /// 切り替えは行わず、次の `validate_state` か `schedule` に任せる。
    ///
    /// # Returns
    /// 再スケジュールが必要ならtrue
    pub fn tick(&self) -> Result<bool> {
        let state = self.this_cpu()?;
        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();

        let resched = rq.tick(&mut table)? || rq.should_preempt(&table);
        if resched {
            state.need_resched.store(true, Ordering::Release);
        }
        Ok(resched)
    }

    /// 呼び出し元のCPUで次のスレッドを選んで切り替える
    pub fn schedule(&self) -> Result<()> {
        let state = self.this_cpu()?;
        self.retire_previous(state.id);
        state.need_resched.store(false, Ordering::Release);

        let switch = {
            let mut rq = state.runqueue.lock();
            let mut table = self.table.lock();
            let current = rq.current();
            self.hand_off(state, &mut rq, &mut table, current)?
        };
        if let Some(switch) = switch {
            self.perform(switch);
        }
        Ok(())
    }

    /// 特権モードからの復帰時に呼ぶ
    ///
    /// 他のCPUからの要求（停止・終了）を処理し、必要なら再スケジュールする。
    /// 終了を要求されていた場合は戻らない。
    pub fn validate_state(&self) -> Result<()> {
        let state = self.this_cpu()?;
        self.retire_previous(state.id);

        if state.mailbox.swap(false, Ordering::AcqRel) {
            self.process_requests(state)?;
        }
        if state.need_resched.load(Ordering::Acquire) {
            self.schedule()?;
        }
        Ok(())
    }

    fn process_requests(&self, state: &CpuState) -> Result<()> {
        let Some(current) = state.current() else {
            return Ok(());
        };

        let (requests, exit_code, fault) = {
            let mut table = self.table.lock();
            let thread = table.lookup_thread_mut(current)?;
            (core::mem::take(&mut thread.requests), thread.requested_exit, thread.fault)
        };

        if requests.contains(Requests::TERMINATE) {
            log::debug!("{:?}: terminating on request", current);
            self.exit_with(exit_code, fault);
        }
        if requests.contains(Requests::STOP) {
            log::debug!("{:?}: stopping on request", current);
            self.stop_current(state, current)?;
        }
        Ok(())
    }

    fn home_cpu(&self, id: ThreadId) -> Result<CpuId> {
        self.table
            .lock()
            .lookup_thread(id)?
            .home_cpu
            .ok_or_else(|| ProcessError::InvalidState.into())
    }

    /// 実行中のスレッドに他のCPUから要求を届ける（ランキューとPIDテーブルのロックを保持して呼ぶ）
    fn post_request(
        &self,
        state: &CpuState,
        table: &mut TaskTable,
        id: ThreadId,
        request: Requests,
    ) -> Result<()> {
        table.lookup_thread_mut(id)?.requests |= request;
        state.mailbox.store(true, Ordering::Release);
        self.platform.send_ipi(state.id);
        log::debug!("{:?}: posted {:?} to CPU {}", id, request, state.id.as_u32());
        Ok(())
    }

    /// 実行中のスレッドを終了させ、次のスレッドに切り替える
    pub fn exit_current(&self, exit_code: i32) -> ! {
        self.exit_with(exit_code, None)
    }

    pub(super) fn exit_with(&self, exit_code: i32, fault: Option<FaultCode>) -> ! {
        match self.prepare_exit(exit_code, fault) {
            Ok(switch) => {
                if switch.activate {
                    self.platform.activate(switch.space);
                }
                self.platform.exit_context(switch.cpu, switch.to, &switch.context)
            }
            Err(e) => {
                let cpu = self.platform.current_cpu();
                log::error!("CPU {}: cannot exit current thread: {}", cpu.as_u32(), e);
                loop {
                    self.platform.halt(cpu);
                }
            }
        }
    }

    fn prepare_exit(&self, exit_code: i32, fault: Option<FaultCode>) -> Result<Switch> {
        let state = self.this_cpu()?;
        let current = state.current().ok_or(ProcessError::NoCurrentThread)?;
        if self.is_idle_thread(current) {
            return Err(ProcessError::InvalidState.into());
        }

        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();
        rq.remove_thread(&mut table, current)?;
        self.finish_thread(&mut table, current, exit_code, fault)?;
        self.hand_off(state, &mut rq, &mut table, Some(current))?
            .ok_or_else(|| ProcessError::InvalidState.into())
    }

    /// スレッドを終了させる
    ///
    /// 他のCPUで実行中なら、そのCPUの次の `validate_state` で終了する。
    /// 呼び出し元自身を指定した場合は戻らない。終了済みなら何もしない。
    pub fn terminate_thread(&self, id: ThreadId, exit_code: i32) -> Result<()> {
        self.terminate_with(id, exit_code, None)
    }

    pub(super) fn terminate_with(
        &self,
        id: ThreadId,
        exit_code: i32,
        fault: Option<FaultCode>,
    ) -> Result<()> {
        if self.current_thread() == Some(id) {
            self.exit_with(exit_code, fault);
        }
        if self.is_idle_thread(id) {
            return Err(ProcessError::InvalidState.into());
        }

        let state = self.cpu_state(self.home_cpu(id)?)?;
        let mut waits = self.waits.lock();
        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();

        let timer = match table.lookup_thread(id)?.state() {
            ThreadState::Terminated => return Ok(()),
            ThreadState::Sleep => waits.release(id).and_then(|r| r.timer),
            ThreadState::Stopped | ThreadState::Inactive => None,
            ThreadState::Running => {
                if rq.current() == Some(id) {
                    let thread = table.lookup_thread_mut(id)?;
                    thread.requested_exit = exit_code;
                    if fault.is_some() {
                        thread.fault = fault;
                    }
                    return self.post_request(state, &mut table, id, Requests::TERMINATE);
                }
                rq.remove_thread(&mut table, id)?;
                None
            }
        };
        self.finish_thread(&mut table, id, exit_code, fault)?;

        drop(table);
        drop(rq);
        drop(waits);
        if let Some(timer) = timer {
            self.platform.cancel(timer);
        }
        Ok(())
    }

    /// プロセスのすべてのスレッドを終了させる
    ///
    /// 呼び出し元のスレッドが含まれていれば最後に終了し、戻らない。
    pub fn kill_process(&self, id: ProcessId, exit_code: i32) -> Result<()> {
        if self.kernel_process() == Some(id) {
            return Err(ProcessError::InvalidState.into());
        }
        let threads = self.table.lock().lookup_process(id)?.threads().to_vec();
        let me = self.current_thread();

        for thread in threads.iter().copied().filter(|t| Some(*t) != me) {
            self.terminate_with(thread, exit_code, Some(FaultCode::Killed))?;
        }
        if me.is_some_and(|me| threads.contains(&me)) {
            self.exit_with(exit_code, Some(FaultCode::Killed));
        }
        log::info!("Process {:?} killed ({} threads)", id, threads.len());
        Ok(())
    }

    /// スレッドを停止させる
    ///
    /// スリープ中のスレッドは待機から外され、再開後のスリープは
    /// `Interrupted` を返す。呼び出し元自身を指定した場合は再開まで戻らない。
    pub fn stop_thread(&self, id: ThreadId) -> Result<()> {
        if self.is_idle_thread(id) {
            return Err(ProcessError::InvalidState.into());
        }
        if self.current_thread() == Some(id) {
            return self.stop_current(self.this_cpu()?, id);
        }

        let state = self.cpu_state(self.home_cpu(id)?)?;
        let mut waits = self.waits.lock();
        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();

        let timer = match table.lookup_thread(id)?.state() {
            ThreadState::Stopped => return Ok(()),
            ThreadState::Terminated | ThreadState::Inactive => {
                return Err(ProcessError::InvalidState.into())
            }
            ThreadState::Sleep => waits.release(id).and_then(|r| r.timer),
            ThreadState::Running => {
                if rq.current() == Some(id) {
                    return self.post_request(state, &mut table, id, Requests::STOP);
                }
                rq.remove_thread(&mut table, id)?;
                None
            }
        };

        let thread = table.lookup_thread_mut(id)?;
        thread.state = ThreadState::Stopped;
        thread.timer = None;
        thread.waken_by = None;
        log::debug!("Thread {:?} stopped", id);

        drop(table);
        drop(rq);
        drop(waits);
        if let Some(timer) = timer {
            self.platform.cancel(timer);
        }
        Ok(())
    }

    /// 実行中のスレッド自身を停止し、再開されるまで切り替える
    pub(super) fn stop_current(&self, state: &CpuState, id: ThreadId) -> Result<()> {
        let switch = {
            let mut rq = state.runqueue.lock();
            let mut table = self.table.lock();
            rq.remove_thread(&mut table, id)?;
            table.lookup_thread_mut(id)?.state = ThreadState::Stopped;
            self.hand_off(state, &mut rq, &mut table, Some(id))?
        };
        if let Some(switch) = switch {
            self.perform(switch);
        }
        Ok(())
    }

    /// 停止中のスレッドを再開する
    pub fn continue_thread(&self, id: ThreadId) -> Result<()> {
        let state = self.cpu_state(self.home_cpu(id)?)?;
        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();

        let thread = table.lookup_thread_mut(id)?;
        match thread.state() {
            ThreadState::Stopped => {
                rq.add_thread(&mut table, id)?;
                self.notify_if_preempting(state, &rq, &table);
                log::debug!("Thread {:?} continued", id);
                Ok(())
            }
            // 停止要求がまだ処理されていない
            ThreadState::Running if thread.requests.contains(Requests::STOP) => {
                thread.requests.remove(Requests::STOP);
                Ok(())
            }
            _ => Err(ProcessError::InvalidState.into()),
        }
    }

    /// スレッド自身の実行で起きたフォルトを記録する
    ///
    /// 致命的なフォルトはスレッドを終了させ、プロセスをFaultedにする。
    /// 実行中のスレッド自身の致命的なフォルトでは戻らない。
    pub fn fault(&self, id: ThreadId, code: FaultCode, message: &str) -> Result<()> {
        self.table
            .lock()
            .lookup_thread_mut(id)?
            .errors
            .set(ErrorCause::Fault(code), message);
        log::warn!("Thread {:?} fault: {:?} ({})", id, code, message);

        match code.severity() {
            Severity::Recoverable => Ok(()),
            Severity::Fatal => self.terminate_with(id, code.exit_code(), Some(code)),
        }
    }
}
