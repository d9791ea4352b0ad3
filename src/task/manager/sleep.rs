//! スリープ/ウェイクアップ
//!
//! スリープ側の登録とウェイク側の解放は、どちらも待機テーブルのロックの下で行う。
//! タイムアウトとウェイクアップは同じロックで所属記録を取り合い、
//! 先に取った方だけがスレッドを起こす。

use core::sync::atomic::Ordering;
use core::time::Duration;

use super::sched::Switch;
use super::ProcessManager;
use crate::error::{ProcessError, Result};
use crate::hal::{Platform, TimerHandle};
use crate::task::ids::{Channel, ThreadId, ThreadState, WakeReason};
use crate::task::wait::Released;

/// スリープ開始の結果
pub(super) enum SleepOutcome {
    /// 保留中のウェイクアップがあったので待たずに戻る
    Ready(WakeReason),
    /// 待機テーブルに登録した。切り替えが必要
    Blocked(ThreadId, Switch),
}

impl<P: Platform> ProcessManager<P> {
    /// チャネルで待機する
    ///
    /// `timeout` を指定すると、その時間が過ぎたら `WakeReason::Timeout` で戻る。
    pub fn sleep(
        &self,
        channel: Channel,
        reason: &'static str,
        timeout: Option<Duration>,
    ) -> Result<WakeReason> {
        self.sleep_any(&[channel], reason, timeout)
    }

    /// 指定した時間だけ待機する
    pub fn sleep_for(&self, reason: &'static str, duration: Duration) -> Result<()> {
        self.sleep_any(&[], reason, Some(duration)).map(|_| ())
    }

    /// 複数のチャネルのいずれかで待機する
    ///
    /// どれか1つで起こされると、すべてのチャネルから外れる。
    /// チャネルもタイムアウトも指定しない呼び出しは `InvalidWaitSpec`。
    /// 待機中に停止された場合は `Interrupted`。
    pub fn sleep_any(
        &self,
        channels: &[Channel],
        reason: &'static str,
        timeout: Option<Duration>,
    ) -> Result<WakeReason> {
        match self.enter_sleep(channels, reason, timeout)? {
            SleepOutcome::Ready(reason) => Ok(reason),
            SleepOutcome::Blocked(current, switch) => {
                self.perform(switch);
                self.finish_sleep(current)
            }
        }
    }

    /// 待機テーブルに登録し、次のスレッドへの切り替えを準備する
    pub(super) fn enter_sleep(
        &self,
        channels: &[Channel],
        reason: &'static str,
        timeout: Option<Duration>,
    ) -> Result<SleepOutcome> {
        if channels.is_empty() && timeout.is_none() {
            log::warn!("Sleep without channel or timeout ({})", reason);
            return Err(ProcessError::InvalidWaitSpec.into());
        }

        let state = self.this_cpu()?;
        let current = state.current().ok_or(ProcessError::NoCurrentThread)?;
        if self.is_idle_thread(current) {
            return Err(ProcessError::InvalidState.into());
        }
        let ticks = timeout.map(|d| self.platform.ticks_for(d));

        let mut waits = self.waits.lock();
        if let Some(channel) = waits.take_pending(channels) {
            return Ok(SleepOutcome::Ready(WakeReason::Channel(channel)));
        }
        if channels.is_empty() && ticks == Some(0) {
            return Ok(SleepOutcome::Ready(WakeReason::Timeout));
        }

        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();
        if !table.lookup_thread(current)?.requests.is_empty() {
            // 未処理の要求があるので待たずに戻り、validate_stateに任せる
            state.mailbox.store(true, Ordering::Release);
            return Err(ProcessError::Interrupted.into());
        }

        rq.remove_thread(&mut table, current)?;
        waits.link(current, channels, state.id)?;
        let timer = match ticks {
            Some(ticks) => {
                // タイマーのコールバックは待機テーブルのロックを取るので、同期的に呼んではならない
                let handle = self.platform.arm(ticks.max(1), current);
                waits.set_timer(current, handle)?;
                Some(handle)
            }
            None => None,
        };

        let thread = table.lookup_thread_mut(current)?;
        thread.state = ThreadState::Sleep;
        thread.wait_reason = reason;
        thread.waken_by = None;
        thread.timer = timer;
        log::debug!("{:?} sleeping on {:?} ({}), timer {:?}", current, channels, reason, timer);

        let switch = self
            .hand_off(state, &mut rq, &mut table, Some(current))?
            .ok_or(ProcessError::InvalidState)?;
        Ok(SleepOutcome::Blocked(current, switch))
    }

    /// 再び選ばれたスレッドが起床理由を受け取る
    pub(super) fn finish_sleep(&self, current: ThreadId) -> Result<WakeReason> {
        let mut table = self.table.lock();
        let thread = table.lookup_thread_mut(current)?;
        thread.wait_reason = "";
        thread.waken_by.take().ok_or_else(|| ProcessError::Interrupted.into())
    }

    /// チャネルで待機しているすべてのスレッドを起こす
    ///
    /// 待機者がいなければ何もしない（予約中のチャネルでは保留される）。
    ///
    /// # Returns
    /// 起こしたスレッドの数
    pub fn wakeup(&self, channel: Channel) -> usize {
        let released = {
            let mut waits = self.waits.lock();
            let released = waits.wake(channel);
            for r in &released {
                if let Err(e) = self.readmit(r) {
                    log::warn!("Failed to readmit {:?}: {}", r.thread, e);
                }
            }
            released
        };

        for timer in released.iter().filter_map(|r| r.timer) {
            self.platform.cancel(timer);
        }
        released.len()
    }

    /// タイマーの発火を通知する
    ///
    /// # Returns
    /// スレッドを起こした場合はtrue。既にウェイクアップで起きていればfalse
    pub fn expire_timer(&self, timer: TimerHandle) -> bool {
        let mut waits = self.waits.lock();
        let Some(released) = waits.expire_timer(timer) else {
            return false;
        };
        if let Err(e) = self.readmit(&released) {
            log::warn!("Failed to readmit {:?} after timeout: {}", released.thread, e);
        }
        true
    }

    /// 解放されたスレッドを元のCPUのランキューに戻す（待機テーブルのロックを保持して呼ぶ）
    fn readmit(&self, released: &Released) -> Result<()> {
        let state = self.cpu_state(released.cpu)?;
        let mut rq = state.runqueue.lock();
        let mut table = self.table.lock();

        let thread = table.lookup_thread_mut(released.thread)?;
        if thread.state() != ThreadState::Sleep {
            return Err(ProcessError::InvalidState.into());
        }
        thread.waken_by = Some(released.reason);
        thread.timer = None;

        rq.add_thread(&mut table, released.thread)?;
        self.notify_if_preempting(state, &rq, &table);
        log::debug!("{:?} woken by {:?}", released.thread, released.reason);
        Ok(())
    }

    /// チャネルを予約する
    ///
    /// 予約中のチャネルへのウェイクアップは、待機者がいなければ保留され、
    /// 次のスリープがすぐに戻る。待機する条件を調べる前に呼ぶ。
    pub fn reserve_channel(&self, channel: Channel) {
        self.waits.lock().reserve(channel);
    }

    /// チャネルの予約を解除する
    pub fn free_channel(&self, channel: Channel) -> Result<()> {
        self.waits.lock().free(channel)
    }
}
