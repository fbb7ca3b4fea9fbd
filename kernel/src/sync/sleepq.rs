//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 睡眠队列 (Sleep Queue)
//!
//! 线程在一个等待通道（任意内核对象的地址）上睡眠，其他线程按通道唤醒它。
//! 对应 Linux 的 `wait_event()` / `wake_up()`，但队列不嵌在被等待的对象里，
//! 而是按通道地址哈希到全局的链上。
//!
//! 每个线程自带一个睡眠队列节点：
//! - 第一个在某通道上睡眠的线程把自己的节点挂到链上，作为这个通道的队列
//! - 后来的线程把节点放进该队列的空闲链表
//! - 离开时，最后一个线程拿走队列本身，其他线程各取一个空闲节点
//!
//! 所以睡眠和唤醒都不需要分配节点。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use super::chain_hash;
use crate::config::SLEEPQ_CHAINS;
use crate::errno::Errno;
use crate::kernel::Kernel;
use crate::process::thread::{TdFlags, TdLock, TdSched, Thread, ThreadState, Tid};
use crate::sched::prio::Prio;

/// 等待通道：被等待对象的地址
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitChannel(usize);

impl WaitChannel {
    /// 以对象地址作为等待通道
    #[inline]
    pub fn of<T: ?Sized>(obj: &T) -> Self {
        Self(obj as *const T as *const () as usize)
    }

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// 睡眠方式
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SleepKind {
    /// 不可中断，只能被 signal / broadcast / remove 唤醒
    Normal,
    /// 可被 [`Kernel::sleepq_abort`] 打断
    Interruptible,
    /// 可中断，并且在超时后被唤醒
    Timed,
}

impl SleepKind {
    fn flags(self) -> TdFlags {
        match self {
            SleepKind::Normal => TdFlags::SLEEPY,
            SleepKind::Interruptible => TdFlags::SLEEPY | TdFlags::SLPINTR,
            SleepKind::Timed => TdFlags::SLEEPY | TdFlags::SLPINTR | TdFlags::SLPTIMED,
        }
    }

    #[inline]
    fn interruptible(self) -> bool {
        self != SleepKind::Normal
    }
}

/// 唤醒原因
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum WakeReason {
    Normal,
    Interrupted,
    TimedOut,
}

/// 睡眠队列节点
pub struct SleepQueue {
    /// 作为队列使用时的等待通道
    wchan: Option<WaitChannel>,

    /// 按到达顺序排列的睡眠线程
    blocked: VecDeque<Tid>,

    /// 睡眠线程带来的空闲节点，通过各自的 `free` 串起来
    free: Option<Box<SleepQueue>>,
}

impl SleepQueue {
    pub(crate) fn new() -> Box<Self> {
        Box::new(Self {
            wchan: None,
            blocked: VecDeque::new(),
            free: None,
        })
    }

    fn push_free(&mut self, mut node: Box<SleepQueue>) {
        node.free = self.free.take();
        self.free = Some(node);
    }

    fn pop_free(&mut self) -> Option<Box<SleepQueue>> {
        let mut node = self.free.take()?;
        self.free = node.free.take();
        Some(node)
    }

    /// 正在睡眠的线程数
    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

/// 一条哈希链上正在使用的睡眠队列
pub(crate) struct SleepqChain {
    queues: Vec<Box<SleepQueue>>,
}

impl SleepqChain {
    const fn new() -> Self {
        Self { queues: Vec::new() }
    }

    fn position(&self, wchan: WaitChannel) -> Option<usize> {
        self.queues.iter().position(|sq| sq.wchan == Some(wchan))
    }
}

/// 所有睡眠队列哈希链
pub(crate) struct SleepqChains {
    chains: Vec<Mutex<SleepqChain>>,
}

impl SleepqChains {
    pub(crate) fn new() -> Self {
        Self {
            chains: (0..SLEEPQ_CHAINS).map(|_| Mutex::new(SleepqChain::new())).collect(),
        }
    }

    #[inline]
    fn index(wchan: WaitChannel) -> usize {
        chain_hash(wchan.addr(), SLEEPQ_CHAINS)
    }

    #[inline]
    fn lock(&self, idx: usize) -> MutexGuard<'_, SleepqChain> {
        self.chains[idx].lock()
    }
}

impl Kernel {
    /// 在 `wchan` 上不可中断地睡眠
    ///
    /// 调用者通常先屏蔽中断、检查条件，再调用本函数，
    /// 这样检查和睡眠之间不会丢失唤醒。
    pub fn sleepq_wait(&self, wchan: WaitChannel, wmesg: &'static str) {
        let res = self.sleepq_wait_common(wchan, wmesg, SleepKind::Normal);
        debug_assert!(res.is_ok(), "uninterruptible sleep returned {:?}", res);
    }

    /// 在 `wchan` 上可中断地睡眠
    ///
    /// # 返回
    /// 被 [`Kernel::sleepq_abort`] 打断，或睡眠前已有待处理的信号时返回
    /// `Err(Errno::RestartSys)`
    pub fn sleepq_wait_intr(&self, wchan: WaitChannel, wmesg: &'static str) -> Result<(), Errno> {
        self.sleepq_wait_common(wchan, wmesg, SleepKind::Interruptible)
    }

    /// 在 `wchan` 上最多睡眠 `timeout` 个滴答
    ///
    /// `timeout` 为 0 时等同于 [`Kernel::sleepq_wait_intr`]。
    ///
    /// # 返回
    /// 超时返回 `Err(Errno::TimedOut)`，被打断返回 `Err(Errno::RestartSys)`
    pub fn sleepq_wait_timed(
        &self,
        wchan: WaitChannel,
        wmesg: &'static str,
        timeout: u64,
    ) -> Result<(), Errno> {
        if timeout == 0 {
            return self.sleepq_wait_intr(wchan, wmesg);
        }

        let td = self.thread_self();
        let res = {
            let _intr = self.intr_guard();
            self.callout_setup_relative(&td.slpcallout, timeout);
            self.sleepq_wait_common(wchan, wmesg, SleepKind::Timed)
        };

        // 被提前唤醒时定时器可能还挂着，或者正在 callout 线程里执行
        self.callout_stop(&td.slpcallout);
        self.callout_drain(&td.slpcallout);
        res
    }

    fn sleepq_wait_common(
        &self,
        wchan: WaitChannel,
        wmesg: &'static str,
        kind: SleepKind,
    ) -> Result<(), Errno> {
        let td = self.thread_self();
        let _intr = self.intr_guard();

        if kind.interruptible() && td.flags().contains(TdFlags::NEEDSIGCHK) {
            return Err(Errno::RestartSys);
        }

        let idx = SleepqChains::index(wchan);
        {
            let mut sc = self.sleepq.lock(idx);
            let mut ts = td.sched.lock();
            Self::sq_enter(&td, &mut ts, &mut sc, idx, wchan, wmesg, kind);
        }

        let need_switch = {
            let mut sc = self.sleepq.lock(idx);
            let mut ts = td.sched.lock();
            let prev = td.clear_flags(TdFlags::SLEEPY);
            if !prev.contains(TdFlags::SLEEPY) {
                // 在切走之前就被唤醒了
                false
            } else if kind.interruptible() && td.flags().contains(TdFlags::NEEDSIGCHK) {
                Self::sq_leave(&td, &mut ts, &mut sc, wchan);
                ts.lock = TdLock::Sched;
                td.clear_flags(TdFlags::SLPINTR | TdFlags::SLPTIMED);
                return Err(Errno::RestartSys);
            } else {
                ts.state = ThreadState::Waiting;
                true
            }
        };

        if need_switch {
            log::trace!("sleepq: thread {} sleeps on {:#x} ({})", td.tid(), wchan.addr(), wmesg);
            self.sched_switch();
        }

        // 留下的标志就是唤醒原因
        let flags = td.clear_flags(TdFlags::SLPINTR | TdFlags::SLPTIMED);
        if flags.contains(TdFlags::SLPINTR) {
            Err(Errno::RestartSys)
        } else if flags.contains(TdFlags::SLPTIMED) {
            Err(Errno::TimedOut)
        } else {
            Ok(())
        }
    }

    /// 把当前线程挂到 `wchan` 的队列上
    fn sq_enter(
        td: &Thread,
        ts: &mut TdSched,
        sc: &mut SleepqChain,
        idx: usize,
        wchan: WaitChannel,
        wmesg: &'static str,
        kind: SleepKind,
    ) {
        assert!(ts.wchan.is_none(), "thread {} is already sleeping", td.tid());
        let Some(mut node) = ts.sleepq.take() else {
            panic!("thread {} has no spare sleep queue", td.tid());
        };

        match sc.position(wchan) {
            Some(pos) => {
                let sq = &mut sc.queues[pos];
                sq.blocked.push_back(td.tid());
                sq.push_free(node);
            }
            None => {
                node.wchan = Some(wchan);
                node.blocked.push_back(td.tid());
                sc.queues.push(node);
            }
        }

        ts.wchan = Some(wchan);
        ts.wmesg = wmesg;
        ts.lock = TdLock::Sleepq(idx);
        td.set_flags(kind.flags());
    }

    /// 把线程从 `wchan` 的队列上摘下，并归还一个节点给它
    ///
    /// 线程仍由睡眠队列链管理，由调用者交回调度器。
    fn sq_leave(td: &Thread, ts: &mut TdSched, sc: &mut SleepqChain, wchan: WaitChannel) {
        assert_eq!(
            ts.lock,
            TdLock::Sleepq(SleepqChains::index(wchan)),
            "thread {} is not governed by the chain of {:#x}",
            td.tid(),
            wchan.addr()
        );
        let Some(pos) = sc.position(wchan) else {
            panic!("no sleep queue for channel {:#x}", wchan.addr());
        };

        let sq = &mut sc.queues[pos];
        let Some(i) = sq.blocked.iter().position(|&t| t == td.tid()) else {
            panic!("thread {} is not on sleep queue {:#x}", td.tid(), wchan.addr());
        };
        sq.blocked.remove(i);

        let node = if sq.blocked.is_empty() {
            let mut node = sc.queues.swap_remove(pos);
            assert!(node.free.is_none(), "empty sleep queue still has spare nodes");
            node.wchan = None;
            node
        } else {
            match sq.pop_free() {
                Some(node) => node,
                None => panic!("sleep queue {:#x} ran out of spare nodes", wchan.addr()),
            }
        };

        ts.sleepq = Some(node);
        ts.wchan = None;
        ts.wmesg = "";
    }

    /// 唤醒睡在 `wchan` 上的线程 `td`
    ///
    /// # 返回
    /// 唤醒原因与睡眠方式不匹配时不唤醒，返回 false
    fn sq_wakeup(
        &self,
        td: &Thread,
        ts: &mut TdSched,
        sc: &mut SleepqChain,
        wchan: WaitChannel,
        reason: WakeReason,
    ) -> bool {
        let flags = td.flags();
        match reason {
            WakeReason::Interrupted if !flags.contains(TdFlags::SLPINTR) => return false,
            WakeReason::TimedOut if !flags.contains(TdFlags::SLPTIMED) => return false,
            _ => {}
        }

        Self::sq_leave(td, ts, sc, wchan);

        let other = match reason {
            WakeReason::Normal => TdFlags::SLPINTR | TdFlags::SLPTIMED,
            WakeReason::Interrupted => TdFlags::SLPTIMED,
            WakeReason::TimedOut => TdFlags::SLPINTR,
        };
        let prev = td.clear_flags(other);

        if prev.contains(TdFlags::SLEEPY) {
            // 还没有切走，清掉 SLEEPY 它就不会睡下去
            td.clear_flags(TdFlags::SLEEPY);
            ts.lock = TdLock::Sched;
        } else {
            self.sched_wakeup(td, ts, TdLock::Sleepq(SleepqChains::index(wchan)));
        }

        log::trace!("sleepq: woke thread {} on {:#x} ({:?})", td.tid(), wchan.addr(), reason);
        true
    }

    /// 队列中优先级最高的线程，同优先级取最早到达的
    fn sq_best(&self, sc: &SleepqChain, pos: usize) -> Option<alloc::sync::Arc<Thread>> {
        let mut best: Option<(Prio, alloc::sync::Arc<Thread>)> = None;
        for &tid in sc.queues[pos].blocked.iter() {
            let td = self.thread(tid);
            let prio = td.prio();
            if best.as_ref().map_or(true, |(p, _)| prio > *p) {
                best = Some((prio, td));
            }
        }
        best.map(|(_, td)| td)
    }

    /// 唤醒 `wchan` 上优先级最高的线程
    ///
    /// # 返回
    /// 是否唤醒了线程
    pub fn sleepq_signal(&self, wchan: WaitChannel) -> bool {
        let woke = {
            let _intr = self.intr_guard();
            let idx = SleepqChains::index(wchan);
            let mut sc = self.sleepq.lock(idx);
            match sc.position(wchan).and_then(|pos| self.sq_best(&sc, pos)) {
                Some(td) => {
                    let mut ts = td.sched.lock();
                    self.sq_wakeup(&td, &mut ts, &mut sc, wchan, WakeReason::Normal)
                }
                None => false,
            }
        };
        self.sched_maybe_preempt();
        woke
    }

    /// 唤醒 `wchan` 上的所有线程，按优先级从高到低
    ///
    /// # 返回
    /// 唤醒的线程数
    pub fn sleepq_broadcast(&self, wchan: WaitChannel) -> usize {
        let mut count = 0;
        {
            let _intr = self.intr_guard();
            let idx = SleepqChains::index(wchan);
            let mut sc = self.sleepq.lock(idx);
            while let Some(td) = sc.position(wchan).and_then(|pos| self.sq_best(&sc, pos)) {
                let mut ts = td.sched.lock();
                if self.sq_wakeup(&td, &mut ts, &mut sc, wchan, WakeReason::Normal) {
                    count += 1;
                }
            }
        }
        self.sched_maybe_preempt();
        count
    }

    /// 把线程 `tid` 从 `wchan` 上唤醒；线程不在这个通道上睡眠时什么都不做
    pub fn sleepq_remove(&self, tid: Tid, wchan: WaitChannel) -> bool {
        let woke = {
            let _intr = self.intr_guard();
            self.sq_wake_thread(tid, Some(wchan), WakeReason::Normal)
        };
        self.sched_maybe_preempt();
        woke
    }

    /// 打断线程 `tid` 的可中断睡眠，它的睡眠返回 `Err(Errno::RestartSys)`
    pub fn sleepq_abort(&self, tid: Tid) -> bool {
        let woke = {
            let _intr = self.intr_guard();
            self.sq_wake_thread(tid, None, WakeReason::Interrupted)
        };
        self.sched_maybe_preempt();
        woke
    }

    /// 限时睡眠到期，由线程的 callout 调用
    pub(crate) fn sleepq_timeout(&self, tid: Tid) -> bool {
        let _intr = self.intr_guard();
        self.sq_wake_thread(tid, None, WakeReason::TimedOut)
    }

    fn sq_wake_thread(&self, tid: Tid, expect: Option<WaitChannel>, reason: WakeReason) -> bool {
        let Some(td) = self.thread_find(tid) else {
            return false;
        };

        // 先看线程睡在哪条链上，再按锁顺序重新加锁确认
        let Some(wchan) = td.wchan() else {
            return false;
        };
        if expect.is_some_and(|e| e != wchan) {
            return false;
        }

        let mut sc = self.sleepq.lock(SleepqChains::index(wchan));
        let mut ts = td.sched.lock();
        if ts.wchan != Some(wchan) {
            return false;
        }
        self.sq_wakeup(&td, &mut ts, &mut sc, wchan, reason)
    }

    /// 查询 `wchan` 上睡眠的线程数，没有队列时返回 None
    pub fn sleepq_lookup(&self, wchan: WaitChannel) -> Option<usize> {
        let sc = self.sleepq.lock(SleepqChains::index(wchan));
        sc.position(wchan).map(|pos| sc.queues[pos].len())
    }
}
