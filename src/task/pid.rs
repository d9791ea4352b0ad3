//! PIDアロケータ
//!
//! ビットマップで使用中のPIDを管理する。直前に解放されたPIDがすぐに
//! 再利用されないよう、次に探索を始める位置（カーソル）を保持する。

use alloc::vec;
use alloc::vec::Vec;

/// ビットマップ型のPIDアロケータ
pub struct PidAllocator {
    /// 使用中ビット（1 = 使用中）
    words: Vec<u64>,
    /// PIDごとの世代番号（解放のたびに進める）
    generations: Vec<u16>,
    /// 管理するPIDの数
    limit: usize,
    /// 次に探索を始めるPID
    cursor: usize,
    /// 使用中のPID数（予約済みのPID 0 を含む）
    in_use: usize,
}

impl PidAllocator {
    /// `limit` 個のPIDを管理するアロケータを作成。PID 0 は予約される。
    pub fn new(limit: usize) -> Self {
        let limit = limit.clamp(2, crate::config::PID_SPACE);
        let mut words = vec![0u64; limit.div_ceil(64)];
        words[0] |= 1;

        Self {
            words,
            generations: vec![0; limit],
            limit,
            cursor: 1,
            in_use: 1,
        }
    }

    /// PIDを確保
    ///
    /// # Returns
    /// (PID, 世代番号)。空きがない場合はNone
    pub fn allocate(&mut self) -> Option<(u16, u16)> {
        if self.in_use >= self.limit {
            return None;
        }

        let words = self.words.len();
        let start_word = self.cursor / 64;
        let start_bit = (self.cursor % 64) as u32;

        for step in 0..=words {
            let w = (start_word + step) % words;
            let mut free = !self.words[w] & self.valid_mask(w);

            if step == 0 {
                free &= !0u64 << start_bit;
            } else if step == words {
                free &= (1u64 << start_bit).wrapping_sub(1);
            }

            if free != 0 {
                let pid = w * 64 + free.trailing_zeros() as usize;
                self.words[w] |= 1 << (pid % 64);
                self.in_use += 1;
                self.cursor = if pid + 1 >= self.limit { 1 } else { pid + 1 };
                return Some((pid as u16, self.generations[pid]));
            }
        }

        None
    }

    /// PIDを解放し、世代番号を進める
    ///
    /// # Returns
    /// 確保されていなかった場合はfalse
    pub fn release(&mut self, pid: u16) -> bool {
        let pid = pid as usize;
        if pid == 0 || !self.is_allocated(pid as u16) {
            return false;
        }

        self.words[pid / 64] &= !(1 << (pid % 64));
        self.generations[pid] = self.generations[pid].wrapping_add(1);
        self.in_use -= 1;
        true
    }

    /// PIDが使用中かどうか
    pub fn is_allocated(&self, pid: u16) -> bool {
        let pid = pid as usize;
        pid < self.limit && self.words[pid / 64] & (1 << (pid % 64)) != 0
    }

    /// 使用中のPID数（PID 0 を除く）
    pub fn in_use(&self) -> usize {
        self.in_use - 1
    }

    /// 確保可能なPIDの総数（PID 0 を除く）
    pub fn capacity(&self) -> usize {
        self.limit - 1
    }

    /// ワード内で `limit` 未満のPIDに対応するビット
    fn valid_mask(&self, word: usize) -> u64 {
        let base = word * 64;
        if base + 64 <= self.limit {
            !0
        } else {
            (1u64 << (self.limit - base)) - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_zero_is_reserved() {
        let mut pids = PidAllocator::new(16);
        let (pid, _) = pids.allocate().unwrap();
        assert_eq!(pid, 1);
        assert!(!pids.release(0));
    }

    #[test]
    fn test_exhaustion() {
        let mut pids = PidAllocator::new(70);
        let mut seen = std::collections::HashSet::new();
        while let Some((pid, _)) = pids.allocate() {
            assert!(seen.insert(pid));
            assert!((pid as usize) < 70);
        }
        assert_eq!(seen.len(), 69);
        assert_eq!(pids.in_use(), pids.capacity());
        assert!(pids.allocate().is_none());
    }

    #[test]
    fn test_released_pid_not_reused_immediately() {
        let mut pids = PidAllocator::new(128);
        let (a, gen_a) = pids.allocate().unwrap();
        let (b, _) = pids.allocate().unwrap();
        assert!(pids.release(a));

        let (c, _) = pids.allocate().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
        assert!(pids.is_allocated(b));

        // 一周した後で再利用される場合は世代番号が進んでいる
        while let Some((pid, generation)) = pids.allocate() {
            if pid == a {
                assert_eq!(generation, gen_a.wrapping_add(1));
            }
        }
        assert!(pids.is_allocated(a));
    }

    #[test]
    fn test_double_release() {
        let mut pids = PidAllocator::new(8);
        let (pid, _) = pids.allocate().unwrap();
        assert!(pids.release(pid));
        assert!(!pids.release(pid));
        assert_eq!(pids.in_use(), 0);
    }

    #[test]
    fn test_wraps_to_low_pids() {
        let mut pids = PidAllocator::new(4);
        let all: Vec<u16> = core::iter::from_fn(|| pids.allocate().map(|(p, _)| p)).collect();
        assert_eq!(all, vec![1, 2, 3]);
        assert!(pids.release(2));
        assert_eq!(pids.allocate().map(|(p, _)| p), Some(2));
    }
}
