//! CPUごとのランキュー
//!
//! active/expiredの2つの優先度配列を持つラウンド制スケジューラ。
//! 各優先度（128段階）にスレッドの双方向リストを持ち、ビットマスクで
//! 空でない優先度を管理する。最も緊急な（値の小さい）優先度の先頭を選ぶ。
//!
//! タイムスライスを使い切ったスレッドはexpired側に移され、次のラウンド
//! （active/expiredの入れ替え）まで選ばれない。

use alloc::vec::Vec;

use super::ids::{CpuId, ThreadId, ThreadState};
use super::table::TaskTable;
use super::thread::QueueLink;
use crate::config::{Config, PRIORITY_LEVELS};
use crate::error::{ProcessError, Result};

/// 優先度ごとのリストの集合
struct PriorityArray {
    heads: [Option<ThreadId>; PRIORITY_LEVELS],
    tails: [Option<ThreadId>; PRIORITY_LEVELS],
    /// 空でない優先度のビット
    mask: u128,
    len: usize,
}

impl PriorityArray {
    const fn new() -> Self {
        Self {
            heads: [None; PRIORITY_LEVELS],
            tails: [None; PRIORITY_LEVELS],
            mask: 0,
            len: 0,
        }
    }

    fn link_mut(table: &mut TaskTable, id: ThreadId) -> Result<&mut QueueLink> {
        Ok(&mut table.lookup_thread_mut(id)?.link)
    }

    /// 優先度 `level` のリスト末尾に追加
    fn push_back(&mut self, table: &mut TaskTable, id: ThreadId, level: u8) -> Result<()> {
        let level = level as usize;
        let tail = self.tails[level];

        *Self::link_mut(table, id)? = QueueLink { prev: tail, next: None };
        match tail {
            Some(prev) => Self::link_mut(table, prev)?.next = Some(id),
            None => self.heads[level] = Some(id),
        }
        self.tails[level] = Some(id);
        self.mask |= 1 << level;
        self.len += 1;
        Ok(())
    }

    /// リストから外す
    fn unlink(&mut self, table: &mut TaskTable, id: ThreadId, level: u8) -> Result<()> {
        let level = level as usize;
        let link = core::mem::take(Self::link_mut(table, id)?);

        match link.prev {
            Some(prev) => Self::link_mut(table, prev)?.next = link.next,
            None => self.heads[level] = link.next,
        }
        match link.next {
            Some(next) => Self::link_mut(table, next)?.prev = link.prev,
            None => self.tails[level] = link.prev,
        }
        if self.heads[level].is_none() {
            self.mask &= !(1 << level);
        }
        self.len -= 1;
        Ok(())
    }

    /// 最も緊急な優先度の先頭
    fn first(&self) -> Option<ThreadId> {
        if self.mask == 0 {
            return None;
        }
        self.heads[self.mask.trailing_zeros() as usize]
    }

    fn is_level_empty(&self, level: u8) -> bool {
        self.mask & (1 << level) == 0
    }

    /// 優先度順にすべてのスレッドを列挙
    fn collect(&self, table: &TaskTable, out: &mut Vec<ThreadId>) {
        let mut mask = self.mask;
        while mask != 0 {
            let level = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            let mut cursor = self.heads[level];
            while let Some(id) = cursor {
                out.push(id);
                cursor = table.thread(id).and_then(|t| t.link.next);
            }
        }
    }
}

/// ランキューの統計情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunqueueStats {
    pub cpu: CpuId,
    /// 現在のラウンド番号
    pub round: u64,
    /// キュー内のスレッド数（active + expired）
    pub num_queued: usize,
    /// active側のスレッド数
    pub num_active: usize,
    pub active_mask: u128,
    pub queued_mask: u128,
    pub current: Option<ThreadId>,
    pub idle: Option<ThreadId>,
}

/// CPUごとのランキュー
pub struct Runqueue {
    cpu: CpuId,
    arrays: [PriorityArray; 2],
    /// active側の配列のインデックス
    active: usize,
    /// どちらかの配列で空でない優先度のビット
    queued_mask: u128,
    num_queued: usize,
    round: u64,
    /// このCPUで実行中のスレッド（所有CPUのみが書き込む）
    current: Option<ThreadId>,
    /// アイドルスレッド（配列の外に置く）
    idle: Option<ThreadId>,
    config: Config,
}

impl Runqueue {
    pub fn new(cpu: CpuId, config: Config) -> Self {
        Self {
            cpu,
            arrays: [PriorityArray::new(), PriorityArray::new()],
            active: 0,
            queued_mask: 0,
            num_queued: 0,
            round: 0,
            current: None,
            idle: None,
            config,
        }
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn num_queued(&self) -> usize {
        self.num_queued
    }

    pub fn num_active(&self) -> usize {
        self.arrays[self.active].len
    }

    pub fn active_mask(&self) -> u128 {
        self.arrays[self.active].mask
    }

    pub fn queued_mask(&self) -> u128 {
        self.queued_mask
    }

    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    pub fn set_current(&mut self, id: ThreadId) {
        self.current = Some(id);
    }

    pub fn idle(&self) -> Option<ThreadId> {
        self.idle
    }

    /// アイドルスレッドを登録（キューには入らない）
    pub fn set_idle(&mut self, table: &mut TaskTable, id: ThreadId) -> Result<()> {
        let thread = table.lookup_thread_mut(id)?;
        thread.state = ThreadState::Running;
        thread.cpu = Some(self.cpu);
        thread.home_cpu = Some(self.cpu);
        self.idle = Some(id);
        Ok(())
    }

    pub fn is_idle(&self, id: ThreadId) -> bool {
        self.idle == Some(id)
    }

    fn expired(&self) -> usize {
        self.active ^ 1
    }

    /// スレッドを実行可能にしてキューに追加
    ///
    /// このラウンドで既にexpired側に移されたスレッドはexpired側に戻り、
    /// このラウンドのスライスが残っていればそれを引き継ぐ。
    /// それ以外は `next_priority` を適用して新しいスライスを与える。
    pub fn add_thread(&mut self, table: &mut TaskTable, id: ThreadId) -> Result<()> {
        let (cpu, round) = (self.cpu, self.round);
        let config = self.config;
        let thread = table.lookup_thread_mut(id)?;
        if matches!(thread.state, ThreadState::Running | ThreadState::Terminated) {
            return Err(ProcessError::InvalidState.into());
        }

        let expired = thread.is_expired_in(cpu, round);
        if !expired && !(thread.slice_round == Some((cpu, round)) && thread.slice_ticks > 0) {
            thread.priority = thread.next_priority;
            thread.slice_ticks = config.slice_for(thread.priority);
            thread.slice_round = Some((cpu, round));
        }
        thread.state = ThreadState::Running;
        thread.cpu = Some(cpu);
        thread.home_cpu = Some(cpu);
        let level = thread.priority;

        let index = if expired { self.expired() } else { self.active };
        self.arrays[index].push_back(table, id, level)?;
        self.queued_mask |= 1 << level;
        self.num_queued += 1;

        log::trace!(
            "cpu{}: queued {:?} at priority {} ({})",
            cpu.as_u32(),
            id,
            level,
            if expired { "expired" } else { "active" }
        );
        Ok(())
    }

    /// スレッドをキューから外す（状態はInactiveになる）
    pub fn remove_thread(&mut self, table: &mut TaskTable, id: ThreadId) -> Result<()> {
        let (cpu, round) = (self.cpu, self.round);
        let thread = table.lookup_thread(id)?;
        if thread.state != ThreadState::Running || thread.cpu != Some(cpu) || self.is_idle(id) {
            return Err(ProcessError::InvalidState.into());
        }
        let level = thread.priority;
        let index = if thread.is_expired_in(cpu, round) { self.expired() } else { self.active };

        self.arrays[index].unlink(table, id, level)?;
        if self.arrays[0].is_level_empty(level) && self.arrays[1].is_level_empty(level) {
            self.queued_mask &= !(1 << level);
        }
        self.num_queued -= 1;

        let thread = table.lookup_thread_mut(id)?;
        thread.state = ThreadState::Inactive;
        thread.cpu = None;
        Ok(())
    }

    /// 次に実行するスレッドを選択
    ///
    /// キューが空ならアイドルスレッド。active側が空ならラウンドを進めて
    /// active/expiredを入れ替える。
    pub fn select_thread(&mut self) -> Result<ThreadId> {
        if self.num_queued == 0 {
            return self.idle.ok_or_else(|| ProcessError::CpuOffline.into());
        }

        if self.arrays[self.active].len == 0 {
            self.active = self.expired();
            self.round += 1;
            debug_assert_eq!(self.arrays[self.active].len, self.num_queued);
            debug_assert_eq!(self.arrays[self.active].mask, self.queued_mask);
            log::trace!("cpu{}: round {} begins", self.cpu.as_u32(), self.round);
        }

        self.arrays[self.active]
            .first()
            .ok_or_else(|| ProcessError::InvalidState.into())
    }

    /// スライスを使い切ったスレッドをexpired側に移す
    pub fn expire(&mut self, table: &mut TaskTable, id: ThreadId) -> Result<()> {
        let (cpu, round) = (self.cpu, self.round);
        let thread = table.lookup_thread(id)?;
        if thread.state != ThreadState::Running
            || thread.cpu != Some(cpu)
            || thread.is_expired_in(cpu, round)
            || self.is_idle(id)
        {
            return Err(ProcessError::InvalidState.into());
        }
        let old_level = thread.priority;
        self.arrays[self.active].unlink(table, id, old_level)?;

        let config = self.config;
        let thread = table.lookup_thread_mut(id)?;
        thread.priority = thread.next_priority;
        thread.slice_ticks = config.slice_for(thread.priority);
        thread.expired_in = Some((cpu, round));
        thread.slice_round = Some((cpu, round + 1));
        let level = thread.priority;

        let expired = self.expired();
        self.arrays[expired].push_back(table, id, level)?;
        if self.arrays[0].is_level_empty(old_level) && self.arrays[1].is_level_empty(old_level) {
            self.queued_mask &= !(1 << old_level);
        }
        self.queued_mask |= 1 << level;
        Ok(())
    }

    /// タイマーティック：実行中のスレッドのスライスを減らす
    ///
    /// # Returns
    /// 再スケジュールが必要ならtrue
    pub fn tick(&mut self, table: &mut TaskTable) -> Result<bool> {
        let Some(current) = self.current else {
            return Ok(false);
        };
        if self.is_idle(current) {
            return Ok(self.num_queued > 0);
        }

        let (cpu, round) = (self.cpu, self.round);
        let thread = table.lookup_thread_mut(current)?;
        if thread.state != ThreadState::Running || thread.cpu != Some(cpu) {
            return Ok(false);
        }
        if thread.is_expired_in(cpu, round) {
            return Ok(true);
        }

        thread.slice_ticks = thread.slice_ticks.saturating_sub(1);
        log::trace!("cpu{}: {:?} slice={}", cpu.as_u32(), current, thread.slice_ticks);
        if thread.slice_ticks > 0 {
            return Ok(false);
        }

        self.expire(table, current)?;
        Ok(true)
    }

    /// 現在のスレッドより緊急なスレッドが待っているかどうか
    pub fn should_preempt(&self, table: &TaskTable) -> bool {
        let head = self.arrays[self.active].first();
        match (self.current, head) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(current), Some(_)) if self.is_idle(current) => true,
            (Some(current), Some(head)) => {
                let level = |id: ThreadId| table.thread(id).map(|t| t.priority);
                match (level(current), level(head)) {
                    (Some(cur), Some(next)) => next < cur,
                    (None, _) => true,
                    _ => false,
                }
            }
        }
    }

    /// キュー内のスレッド（active側、expired側の順）
    pub fn queued_threads(&self, table: &TaskTable) -> Vec<ThreadId> {
        let mut out = Vec::with_capacity(self.num_queued);
        self.arrays[self.active].collect(table, &mut out);
        self.arrays[self.expired()].collect(table, &mut out);
        out
    }

    pub fn stats(&self) -> RunqueueStats {
        RunqueueStats {
            cpu: self.cpu,
            round: self.round,
            num_queued: self.num_queued,
            num_active: self.num_active(),
            active_mask: self.active_mask(),
            queued_mask: self.queued_mask,
            current: self.current,
            idle: self.idle,
        }
    }
}
