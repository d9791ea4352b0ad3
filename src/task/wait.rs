//! 待機チャネルテーブル
//!
//! チャネルごとの `SleepEntry`（待機中のスレッド一覧）と、スレッドごとの
//! 所属記録（待っているチャネル、タイマー、戻り先CPU）の多対多の対応を持つ。
//! スレッドはどれか1つのチャネルで起こされると、すべてのチャネルから
//! 一度に外される。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::ids::{Channel, CpuId, ThreadId, WakeReason};
use crate::error::{ProcessError, Result};
use crate::hal::TimerHandle;

/// チャネルごとの待機情報
#[derive(Debug, Default)]
pub struct SleepEntry {
    /// 待機中のスレッド（到着順）
    waiters: Vec<ThreadId>,
    /// `reserve` された回数
    reservations: u32,
    /// 待機者がいない間に届いたウェイクアップ（予約中のみ保持）
    pending: bool,
}

impl SleepEntry {
    fn is_unused(&self) -> bool {
        self.waiters.is_empty() && self.reservations == 0
    }
}

/// スレッドの待機記録
#[derive(Debug, Clone)]
struct Membership {
    channels: Vec<Channel>,
    timer: Option<TimerHandle>,
    cpu: CpuId,
}

/// 待機から解放されたスレッド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub thread: ThreadId,
    pub reason: WakeReason,
    /// 取り消すべきタイマー
    pub timer: Option<TimerHandle>,
    /// スリープ前に実行していたCPU
    pub cpu: CpuId,
}

/// 待機チャネルテーブル
#[derive(Debug, Default)]
pub struct WaitTable {
    entries: BTreeMap<Channel, SleepEntry>,
    members: BTreeMap<ThreadId, Membership>,
    timers: BTreeMap<TimerHandle, ThreadId>,
}

impl WaitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// チャネルの管理情報を先に作っておく
    pub fn reserve(&mut self, channel: Channel) {
        self.entries.entry(channel).or_default().reservations += 1;
    }

    /// 予約を1つ解放
    pub fn free(&mut self, channel: Channel) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&channel)
            .filter(|e| e.reservations > 0)
            .ok_or(ProcessError::ChannelNotReserved)?;

        entry.reservations -= 1;
        if entry.reservations == 0 {
            entry.pending = false;
        }
        self.collect(channel);
        Ok(())
    }

    pub fn is_reserved(&self, channel: Channel) -> bool {
        self.entries.get(&channel).is_some_and(|e| e.reservations > 0)
    }

    /// 保留中のウェイクアップを1つ消費する
    ///
    /// # Returns
    /// 保留があったチャネル
    pub fn take_pending(&mut self, channels: &[Channel]) -> Option<Channel> {
        channels.iter().copied().find(|ch| {
            self.entries
                .get_mut(ch)
                .map(|e| core::mem::take(&mut e.pending))
                .unwrap_or(false)
        })
    }

    /// スレッドを各チャネルの待機者として登録
    pub fn link(&mut self, thread: ThreadId, channels: &[Channel], cpu: CpuId) -> Result<()> {
        if self.members.contains_key(&thread) {
            return Err(ProcessError::InvalidState.into());
        }

        let mut unique: Vec<Channel> = Vec::with_capacity(channels.len());
        for &channel in channels {
            if !unique.contains(&channel) {
                unique.push(channel);
                self.entries.entry(channel).or_default().waiters.push(thread);
            }
        }
        self.members.insert(thread, Membership { channels: unique, timer: None, cpu });
        Ok(())
    }

    /// 待機中のスレッドにタイムアウト用タイマーを結び付ける
    pub fn set_timer(&mut self, thread: ThreadId, timer: TimerHandle) -> Result<()> {
        let member = self.members.get_mut(&thread).ok_or(ProcessError::InvalidState)?;
        member.timer = Some(timer);
        self.timers.insert(timer, thread);
        Ok(())
    }

    /// チャネルで待機しているすべてのスレッドを解放
    ///
    /// 待機者がいなければ、予約中のチャネルに限りウェイクアップを保留する。
    pub fn wake(&mut self, channel: Channel) -> Vec<Released> {
        let Some(entry) = self.entries.get_mut(&channel) else {
            return Vec::new();
        };

        let waiters = core::mem::take(&mut entry.waiters);
        if waiters.is_empty() && entry.reservations > 0 {
            entry.pending = true;
        }

        let released = waiters
            .into_iter()
            .filter_map(|thread| self.detach(thread, WakeReason::Channel(channel)))
            .collect();
        self.collect(channel);
        released
    }

    /// タイマーの発火でスレッドを解放
    ///
    /// 既にウェイクアップで解放されていればNone
    pub fn expire_timer(&mut self, timer: TimerHandle) -> Option<Released> {
        let thread = self.timers.remove(&timer)?;
        let mut released = self.detach(thread, WakeReason::Timeout)?;
        released.timer = None;
        Some(released)
    }

    /// 理由を問わずスレッドを待機から外す（停止・終了用）
    pub fn release(&mut self, thread: ThreadId) -> Option<Released> {
        self.detach(thread, WakeReason::Timeout)
    }

    /// スレッドのすべての所属記録を削除
    fn detach(&mut self, thread: ThreadId, reason: WakeReason) -> Option<Released> {
        let member = self.members.remove(&thread)?;
        for channel in &member.channels {
            if let Some(entry) = self.entries.get_mut(channel) {
                entry.waiters.retain(|t| *t != thread);
            }
            self.collect(*channel);
        }
        if let Some(timer) = member.timer {
            self.timers.remove(&timer);
        }

        Some(Released { thread, reason, timer: member.timer, cpu: member.cpu })
    }

    /// 使われなくなったエントリを削除
    fn collect(&mut self, channel: Channel) {
        if self.entries.get(&channel).is_some_and(SleepEntry::is_unused) {
            self.entries.remove(&channel);
        }
    }

    pub fn is_waiting(&self, thread: ThreadId) -> bool {
        self.members.contains_key(&thread)
    }

    pub fn channels_of(&self, thread: ThreadId) -> &[Channel] {
        self.members.get(&thread).map(|m| m.channels.as_slice()).unwrap_or_default()
    }

    pub fn waiters(&self, channel: Channel) -> &[ThreadId] {
        self.entries.get(&channel).map(|e| e.waiters.as_slice()).unwrap_or_default()
    }

    /// 管理しているチャネルの数
    pub fn channel_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;

    const CPU: CpuId = CpuId::new(0);

    fn tid(n: u16) -> ThreadId {
        ThreadId::from_parts(n, 0)
    }

    #[test]
    fn test_wake_releases_from_all_channels() {
        let mut waits = WaitTable::new();
        let (a, b) = (Channel::new(0xa), Channel::new(0xb));
        waits.link(tid(1), &[a, b], CPU).unwrap();
        waits.link(tid(2), &[b], CPU).unwrap();

        let released = waits.wake(a);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].thread, tid(1));
        assert_eq!(released[0].reason, WakeReason::Channel(a));

        // bで再度起こされることはない
        let released = waits.wake(b);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].thread, tid(2));
        assert_eq!(waits.channel_count(), 0);
    }

    #[test]
    fn test_wake_empty_channel_is_noop() {
        let mut waits = WaitTable::new();
        assert!(waits.wake(Channel::new(1)).is_empty());
        assert_eq!(waits.channel_count(), 0);
    }

    #[test]
    fn test_timer_and_wake_exclusive() {
        let mut waits = WaitTable::new();
        let ch = Channel::new(7);
        let timer = TimerHandle::new(99);
        waits.link(tid(1), &[ch], CPU).unwrap();
        waits.set_timer(tid(1), timer).unwrap();

        let released = waits.wake(ch);
        assert_eq!(released[0].timer, Some(timer));
        assert!(waits.expire_timer(timer).is_none());

        waits.link(tid(1), &[ch], CPU).unwrap();
        waits.set_timer(tid(1), TimerHandle::new(100)).unwrap();
        let released = waits.expire_timer(TimerHandle::new(100)).unwrap();
        assert_eq!(released.reason, WakeReason::Timeout);
        assert!(waits.wake(ch).is_empty());
        assert!(!waits.is_waiting(tid(1)));
    }

    #[test]
    fn test_reserved_channel_latches_wakeup() {
        let mut waits = WaitTable::new();
        let ch = Channel::new(3);
        waits.reserve(ch);
        assert!(waits.wake(ch).is_empty());
        assert_eq!(waits.take_pending(&[Channel::new(4), ch]), Some(ch));
        assert_eq!(waits.take_pending(&[ch]), None);
        waits.free(ch).unwrap();
        assert!(!waits.is_reserved(ch));
        assert_eq!(waits.channel_count(), 0);
    }

    #[test]
    fn test_unreserved_channel_does_not_latch() {
        let mut waits = WaitTable::new();
        let ch = Channel::new(3);
        assert!(waits.wake(ch).is_empty());
        assert_eq!(waits.take_pending(&[ch]), None);
        assert_eq!(waits.free(ch), Err(KernelError::from(ProcessError::ChannelNotReserved)));
    }

    #[test]
    fn test_duplicate_channels_and_double_link() {
        let mut waits = WaitTable::new();
        let ch = Channel::new(5);
        waits.link(tid(1), &[ch, ch], CPU).unwrap();
        assert_eq!(waits.waiters(ch), &[tid(1)]);
        assert_eq!(waits.channels_of(tid(1)), &[ch]);
        assert!(waits.link(tid(1), &[ch], CPU).is_err());

        assert!(waits.release(tid(1)).is_some());
        assert!(waits.release(tid(1)).is_none());
        assert!(waits.waiters(ch).is_empty());
    }
}
