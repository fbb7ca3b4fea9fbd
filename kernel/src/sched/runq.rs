//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 优先级运行队列
//!
//! 每个优先级一条 FIFO 队列，外加一个非空层位图，
//! 选择下一个线程是 O(1) 的（最多扫描 4 个 u64）。
//!
//! 对应 Linux 的 kernel/sched/rt.c 中的 `rt_prio_array`

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::prio::{Prio, RQ_NQS};
use crate::process::thread::Tid;

const WORD_BITS: usize = u64::BITS as usize;
const RQ_WORDS: usize = RQ_NQS / WORD_BITS;

/// 运行队列
///
/// 只保存线程 ID；线程本身由线程表持有。
/// 一个线程最多出现在一层中，且只在 READY 状态时出现。
pub struct RunQueue {
    /// 按优先级分层的就绪队列
    queues: Vec<VecDeque<Tid>>,

    /// 非空层位图，第 p 位对应优先级 p
    status: [u64; RQ_WORDS],

    /// 就绪线程数量
    nr_running: usize,
}

impl RunQueue {
    pub fn new() -> Self {
        let mut queues = Vec::with_capacity(RQ_NQS);
        queues.resize_with(RQ_NQS, VecDeque::new);
        Self {
            queues,
            status: [0; RQ_WORDS],
            nr_running: 0,
        }
    }

    /// 加入优先级 `prio` 层的队尾
    pub fn add(&mut self, tid: Tid, prio: Prio) {
        let q = prio as usize;
        self.queues[q].push_back(tid);
        self.status[q / WORD_BITS] |= 1 << (q % WORD_BITS);
        self.nr_running += 1;
    }

    /// 从优先级 `prio` 层删除线程，返回线程是否在队列中
    pub fn remove(&mut self, tid: Tid, prio: Prio) -> bool {
        let q = prio as usize;
        let Some(pos) = self.queues[q].iter().position(|&t| t == tid) else {
            return false;
        };
        self.queues[q].remove(pos);
        self.nr_running -= 1;
        if self.queues[q].is_empty() {
            self.status[q / WORD_BITS] &= !(1 << (q % WORD_BITS));
        }
        true
    }

    /// 最高的非空优先级
    pub fn highest(&self) -> Option<Prio> {
        (0..RQ_WORDS).rev().find_map(|w| {
            let word = self.status[w];
            if word == 0 {
                None
            } else {
                let bit = WORD_BITS - 1 - word.leading_zeros() as usize;
                Some((w * WORD_BITS + bit) as Prio)
            }
        })
    }

    /// 取出优先级最高、同层最早入队的线程
    pub fn choose(&mut self) -> Option<Tid> {
        let prio = self.highest()?;
        let q = prio as usize;
        let tid = self.queues[q].pop_front()?;
        self.nr_running -= 1;
        if self.queues[q].is_empty() {
            self.status[q / WORD_BITS] &= !(1 << (q % WORD_BITS));
        }
        Some(tid)
    }

    pub fn len(&self) -> usize {
        self.nr_running
    }

    pub fn is_empty(&self) -> bool {
        self.nr_running == 0
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
