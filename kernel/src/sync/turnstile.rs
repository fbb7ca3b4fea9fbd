//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Turnstile：带优先级继承的锁等待队列
//!
//! 线程 A 等待线程 B 持有的锁时，把自己的优先级借给 B；
//! 如果 B 又在等待 C 持有的锁，借用沿着阻塞链一直传递下去。
//! 对应 Linux 的 kernel/locking/rtmutex.c 中的 `rt_mutex_adjust_prio_chain()`。
//!
//! 和睡眠队列一样，turnstile 节点由线程自带：锁第一次出现竞争时，
//! 第一个阻塞的线程贡献自己的节点，之后的线程把节点放进空闲链表。
//! 释放锁时直接把锁交给优先级最高的等待者，并把一个节点还给它。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use spin::{Mutex, MutexGuard};

use super::chain_hash;
use crate::config::TURNSTILE_CHAINS;
use crate::kernel::Kernel;
use crate::process::thread::{TdLock, Thread, ThreadState, Tid};
use crate::sched::prio::Prio;

/// 锁标识：锁对象的地址
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockId(usize);

impl LockId {
    #[inline]
    pub fn of<T: ?Sized>(lock: &T) -> Self {
        Self(lock as *const T as *const () as usize)
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

/// Turnstile 节点
pub struct Turnstile {
    /// 作为等待队列使用时对应的锁
    lock: Option<LockId>,

    /// 锁的持有者
    owner: Option<Tid>,

    /// 等待者及其优先级，优先级从高到低，同优先级按到达顺序
    blocked: VecDeque<(Tid, Prio)>,

    /// 等待者带来的空闲节点
    free: Option<Box<Turnstile>>,
}

impl Turnstile {
    pub(crate) fn new() -> Box<Self> {
        Box::new(Self {
            lock: None,
            owner: None,
            blocked: VecDeque::new(),
            free: None,
        })
    }

    /// 按优先级插入，排在同优先级的等待者之后
    fn insert(&mut self, tid: Tid, prio: Prio) {
        let pos = self
            .blocked
            .iter()
            .position(|&(_, p)| p < prio)
            .unwrap_or(self.blocked.len());
        self.blocked.insert(pos, (tid, prio));
    }

    fn remove(&mut self, tid: Tid) -> bool {
        match self.blocked.iter().position(|&(t, _)| t == tid) {
            Some(i) => {
                self.blocked.remove(i);
                true
            }
            None => false,
        }
    }

    fn push_free(&mut self, mut node: Box<Turnstile>) {
        node.free = self.free.take();
        self.free = Some(node);
    }

    fn pop_free(&mut self) -> Option<Box<Turnstile>> {
        let mut node = self.free.take()?;
        self.free = node.free.take();
        Some(node)
    }

    /// 最高的等待者优先级
    pub fn top_prio(&self) -> Option<Prio> {
        self.blocked.front().map(|&(_, p)| p)
    }

    pub fn owner(&self) -> Option<Tid> {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.blocked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

/// 一条哈希链上正在使用的 turnstile
pub(crate) struct TurnstileChain {
    turnstiles: Vec<Box<Turnstile>>,
}

impl TurnstileChain {
    const fn new() -> Self {
        Self { turnstiles: Vec::new() }
    }

    fn position(&self, lock: LockId) -> Option<usize> {
        self.turnstiles.iter().position(|t| t.lock == Some(lock))
    }
}

/// 所有 turnstile 哈希链
pub(crate) struct TurnstileChains {
    chains: Vec<Mutex<TurnstileChain>>,
}

impl TurnstileChains {
    pub(crate) fn new() -> Self {
        Self {
            chains: (0..TURNSTILE_CHAINS).map(|_| Mutex::new(TurnstileChain::new())).collect(),
        }
    }

    #[inline]
    fn index(lock: LockId) -> usize {
        chain_hash(lock.addr(), TURNSTILE_CHAINS)
    }

    /// 锁住 `lock` 所在的链
    pub(crate) fn chain(&self, lock: LockId) -> MutexGuard<'_, TurnstileChain> {
        self.chains[Self::index(lock)].lock()
    }
}

/// 释放锁时从 turnstile 上摘下的新持有者
pub(crate) struct Handoff {
    lock: LockId,
    pub(crate) new_owner: Tid,
    node: Box<Turnstile>,
    waiters_left: bool,
}

impl Kernel {
    /// 阻塞在 `lock` 上，直到 `owner` 把锁交给当前线程
    ///
    /// 调用者屏蔽了中断并持有 `lock` 所在的链，且已经确认锁被 `owner` 持有。
    /// 返回时当前线程已经是锁的持有者。
    pub(crate) fn turnstile_wait(
        &self,
        mut tc: MutexGuard<'_, TurnstileChain>,
        lock: LockId,
        owner: Tid,
        wmesg: &'static str,
    ) {
        let td = self.thread_self();
        let tid = td.tid();
        let prio = td.prio();
        assert_ne!(owner, tid, "thread {} blocking on its own lock", tid);

        let first = {
            let mut ts = td.sched.lock();
            let Some(mut node) = ts.turnstile.take() else {
                panic!("thread {} has no spare turnstile", tid);
            };

            let first = match tc.position(lock) {
                Some(pos) => {
                    let t = &mut tc.turnstiles[pos];
                    assert_eq!(t.owner, Some(owner), "turnstile owner mismatch");
                    t.insert(tid, prio);
                    t.push_free(node);
                    false
                }
                None => {
                    node.lock = Some(lock);
                    node.owner = Some(owner);
                    node.insert(tid, prio);
                    tc.turnstiles.push(node);
                    true
                }
            };

            ts.blocked = Some(lock);
            ts.state = ThreadState::Blocked;
            ts.lock = TdLock::Turnstile(TurnstileChains::index(lock));
            ts.wmesg = wmesg;
            first
        };

        // 锁第一次出现等待者
        if first {
            self.thread(owner).sched.lock().contested.push(lock);
        }
        drop(tc);

        log::trace!("turnstile: thread {} blocks on {:#x} held by {}", tid, lock.addr(), owner);
        self.propagate_priority(lock, prio);
        self.sched_switch();

        let ts = td.sched.lock();
        assert!(ts.blocked.is_none(), "thread {} resumed while still blocked", tid);
        assert!(ts.turnstile.is_some(), "thread {} resumed without a turnstile", tid);
    }

    /// 沿阻塞链把 `prio` 借给锁的持有者
    ///
    /// 每一步只持有一条链的锁：借出后释放，再去锁持有者所等待的下一个锁。
    fn propagate_priority(&self, mut lock: LockId, prio: Prio) {
        loop {
            let owner = {
                let tc = self.turnstiles.chain(lock);
                let Some(pos) = tc.position(lock) else {
                    return;
                };
                let Some(owner) = tc.turnstiles[pos].owner else {
                    return;
                };
                owner
            };

            let td = self.thread(owner);
            let next = {
                let mut ts = td.sched.lock();
                assert_ne!(
                    ts.state,
                    ThreadState::Waiting,
                    "lock owner {} is sleeping on a wait channel",
                    owner
                );
                if td.prio() >= prio {
                    return;
                }
                self.lend_prio_locked(&td, &mut ts, prio);
                match (ts.state, ts.blocked) {
                    (ThreadState::Blocked, Some(next)) => {
                        assert_eq!(
                            ts.lock,
                            TdLock::Turnstile(TurnstileChains::index(next)),
                            "blocked thread {} is governed by {:?}",
                            owner,
                            ts.lock
                        );
                        next
                    }
                    _ => return,
                }
            };

            // 持有者自己也在等锁：先在那个 turnstile 里调整位置，再继续传递
            self.turnstile_reposition(owner, next, prio);
            lock = next;
        }
    }

    /// 等待者优先级变化后重新排序，返回它现在是否排在最前
    fn turnstile_reposition(&self, tid: Tid, lock: LockId, prio: Prio) -> bool {
        let mut tc = self.turnstiles.chain(lock);
        let Some(pos) = tc.position(lock) else {
            panic!("thread {} blocked on {:#x} without a turnstile", tid, lock.addr());
        };
        let t = &mut tc.turnstiles[pos];
        let found = t.remove(tid);
        assert!(found, "thread {} missing from turnstile {:#x}", tid, lock.addr());
        t.insert(tid, prio);
        t.blocked.front().map(|&(head, _)| head) == Some(tid)
    }

    /// 阻塞线程的优先级从 `old` 变成了当前值
    ///
    /// 在 turnstile 中重新排序；优先级升高并排到最前时继续向持有者传递。
    pub(crate) fn turnstile_adjust(&self, td: &Thread, lock: LockId, old: Prio) {
        assert_eq!(
            td.sched.lock().lock,
            TdLock::Turnstile(TurnstileChains::index(lock)),
            "thread {} is not governed by the turnstile chain of {:#x}",
            td.tid(),
            lock.addr()
        );
        let prio = td.prio();
        let head = self.turnstile_reposition(td.tid(), lock, prio);
        if head && prio > old {
            self.propagate_priority(lock, prio);
        }
    }

    /// 从 `lock` 的 turnstile 上摘下优先级最高的等待者作为新持有者
    ///
    /// 调用者持有链锁，并在释放链锁之前更新锁的持有者字段。
    /// 没有等待者时返回 None。
    pub(crate) fn turnstile_handoff(tc: &mut TurnstileChain, lock: LockId) -> Option<Handoff> {
        let pos = tc.position(lock)?;
        let t = &mut tc.turnstiles[pos];
        let Some((new_owner, _)) = t.blocked.pop_front() else {
            panic!("turnstile {:#x} has no waiters", lock.addr());
        };

        if t.blocked.is_empty() {
            // 最后一个等待者拿走 turnstile 本身
            let mut node = tc.turnstiles.swap_remove(pos);
            assert!(node.free.is_none(), "empty turnstile still has spare nodes");
            node.lock = None;
            node.owner = None;
            Some(Handoff {
                lock,
                new_owner,
                node,
                waiters_left: false,
            })
        } else {
            let Some(node) = t.pop_free() else {
                panic!("turnstile {:#x} ran out of spare nodes", lock.addr());
            };
            t.owner = Some(new_owner);
            Some(Handoff {
                lock,
                new_owner,
                node,
                waiters_left: true,
            })
        }
    }

    /// 完成锁的移交：收回借出的优先级并唤醒新持有者
    ///
    /// 调用者屏蔽了中断，但不持有任何链锁。
    pub(crate) fn turnstile_finish(&self, h: Handoff) {
        let me = self.thread_self();
        {
            let mut ts = me.sched.lock();
            if let Some(i) = ts.contested.iter().position(|&l| l == h.lock) {
                ts.contested.swap_remove(i);
            }
        }

        let td = self.thread(h.new_owner);
        if h.waiters_left {
            td.sched.lock().contested.push(h.lock);
        }

        // 其余有等待者的锁仍然借给我优先级
        if me.is_borrowing() {
            let inherited = self.turnstile_top_loan(&me);
            self.sched_reloan(&me, inherited);
        }

        log::trace!(
            "turnstile: {:#x} handed from {} to {}",
            h.lock.addr(),
            me.tid(),
            h.new_owner
        );

        let mut ts = td.sched.lock();
        assert_eq!(ts.state, ThreadState::Blocked, "new owner {} was not blocked", h.new_owner);
        ts.blocked = None;
        ts.turnstile = Some(h.node);
        self.sched_wakeup(&td, &mut ts, TdLock::Turnstile(TurnstileChains::index(h.lock)));
    }

    /// 线程持有的有等待者的锁中，最高的等待者优先级
    pub(crate) fn turnstile_top_loan(&self, td: &Thread) -> Option<Prio> {
        let mut best: Option<Prio> = None;
        let mut i = 0;
        loop {
            let lock = match td.sched.lock().contested.get(i) {
                Some(&lock) => lock,
                None => break,
            };
            let tc = self.turnstiles.chain(lock);
            if let Some(p) = tc.position(lock).and_then(|pos| tc.turnstiles[pos].top_prio()) {
                best = Some(best.map_or(p, |b| b.max(p)));
            }
            i += 1;
        }
        best
    }

    /// `lock` 的等待者数，没有 turnstile 时返回 None
    pub fn turnstile_lookup(&self, lock: LockId) -> Option<usize> {
        let tc = self.turnstiles.chain(lock);
        tc.position(lock).map(|pos| tc.turnstiles[pos].len())
    }
}
