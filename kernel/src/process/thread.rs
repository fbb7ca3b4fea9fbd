//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 线程控制块与线程状态机
//!
//! 状态转换：
//! ```text
//! INACTIVE -> READY -> RUNNING -> READY    (时间片用完 / 主动让出)
//!                              -> WAITING  (睡眠队列)
//!                              -> BLOCKED  (turnstile)
//!                              -> STOPPED
//!                              -> DEAD     (进入 zombie 链表，等待回收)
//! WAITING / BLOCKED / STOPPED -> READY     (被唤醒)
//! ```
//!
//! 线程由线程表独占持有；运行队列、睡眠队列和 turnstile 里只保存 TID。

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::tid::TID_THREAD0;
use crate::config::{THREAD_NAME_MAX, TIME_SLICE_TICKS};
use crate::kernel::Kernel;
use crate::sched::prio::Prio;
use crate::sync::sleepq::{SleepQueue, WaitChannel};
use crate::sync::turnstile::{LockId, Turnstile};
use crate::time::callout::{Callout, Systime};

/// 线程 ID
pub type Tid = u32;

/// 线程状态
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    /// 刚创建，尚未加入调度
    Inactive = 0,

    /// 在运行队列中等待 CPU
    Ready = 1,

    /// 正在 CPU 上运行
    Running = 2,

    /// 在睡眠队列上等待某个等待通道
    Waiting = 3,

    /// 在 turnstile 上等待锁
    Blocked = 4,

    /// 被停止，不参与调度
    Stopped = 5,

    /// 已退出，等待回收
    Dead = 6,
}

bitflags! {
    /// 线程标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TdFlags: u32 {
        /// 时间片用完
        const SLICEEND   = 1 << 0;
        /// 下一个安全点需要切换
        const NEEDSWITCH = 1 << 1;
        /// 有待处理的异步信号
        const NEEDSIGCHK = 1 << 2;
        /// 正在借用更高的优先级
        const BORROWING  = 1 << 3;
        /// 已进入睡眠队列但还没有切走
        const SLEEPY     = 1 << 4;
        /// 可中断睡眠；被信号唤醒后保留
        const SLPINTR    = 1 << 5;
        /// 限时睡眠；超时唤醒后保留
        const SLPTIMED   = 1 << 6;
    }
}

/// 当前管理线程调度字段的结构
///
/// 线程在不同结构之间移动时随之切换，任一时刻只有一个。
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TdLock {
    /// 调度器（运行队列）
    Sched,
    /// 第 n 条睡眠队列哈希链
    Sleepq(usize),
    /// 第 n 条 turnstile 哈希链
    Turnstile(usize),
}

/// 由线程私有自旋锁保护的调度字段 (td_spin)
pub(crate) struct TdSched {
    pub(crate) state: ThreadState,
    pub(crate) lock: TdLock,

    /// 剩余时间片
    pub(crate) slice: i32,

    /// 等待通道与原因
    pub(crate) wchan: Option<WaitChannel>,
    pub(crate) wmesg: &'static str,

    /// 备用睡眠队列节点；睡眠期间借给睡眠队列
    pub(crate) sleepq: Option<Box<SleepQueue>>,

    /// 备用 turnstile 节点；阻塞期间借给 turnstile
    pub(crate) turnstile: Option<Box<Turnstile>>,

    /// 正在等待的锁
    pub(crate) blocked: Option<LockId>,

    /// 本线程持有且有线程在等待的锁
    pub(crate) contested: Vec<LockId>,

    /// 通过 sched_lend_prio 借出、尚未归还的优先级，按借出顺序
    pub(crate) loans: Vec<Prio>,

    // 统计信息
    pub(crate) nctxsw: u64,
    pub(crate) rtime: Systime,
    pub(crate) slptime: Systime,
    pub(crate) last_rtime: Systime,
    pub(crate) last_slptime: Systime,
}

/// 线程控制块
pub struct Thread {
    tid: Tid,
    name: String,

    pub(crate) sched: Mutex<TdSched>,

    /// 当前（有效）优先级，只在持有 `sched` 时修改
    prio: AtomicU8,

    /// 基础优先级，只在持有 `sched` 时修改
    base_prio: AtomicU8,

    flags: AtomicU32,

    /// 中断屏蔽嵌套深度
    idnest: AtomicU32,

    /// 抢占禁止嵌套深度
    pdnest: AtomicU32,

    /// 限时睡眠使用的 callout
    pub(crate) slpcallout: Arc<Callout>,
}

impl Thread {
    pub(crate) fn new(tid: Tid, name: &str, prio: Prio) -> Self {
        let slpcallout = Callout::new(move |k: &Kernel| {
            k.sleepq_timeout(tid);
        });
        Self {
            tid,
            name: name.chars().take(THREAD_NAME_MAX).collect(),
            sched: Mutex::new(TdSched {
                state: ThreadState::Inactive,
                lock: TdLock::Sched,
                slice: TIME_SLICE_TICKS,
                wchan: None,
                wmesg: "",
                sleepq: Some(SleepQueue::new()),
                turnstile: Some(Turnstile::new()),
                blocked: None,
                contested: Vec::new(),
                loans: Vec::new(),
                nctxsw: 0,
                rtime: 0,
                slptime: 0,
                last_rtime: 0,
                last_slptime: 0,
            }),
            prio: AtomicU8::new(prio),
            base_prio: AtomicU8::new(prio),
            flags: AtomicU32::new(0),
            idnest: AtomicU32::new(0),
            pdnest: AtomicU32::new(0),
            slpcallout,
        }
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 有效优先级
    #[inline]
    pub fn prio(&self) -> Prio {
        self.prio.load(Ordering::Acquire)
    }

    #[inline]
    pub fn base_prio(&self) -> Prio {
        self.base_prio.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store_prio(&self, prio: Prio) {
        self.prio.store(prio, Ordering::Release);
    }

    #[inline]
    pub(crate) fn store_base_prio(&self, prio: Prio) {
        self.base_prio.store(prio, Ordering::Release);
    }

    pub fn state(&self) -> ThreadState {
        self.sched.lock().state
    }

    #[inline]
    pub fn flags(&self) -> TdFlags {
        TdFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// 设置标志，返回设置前的标志
    #[inline]
    pub(crate) fn set_flags(&self, flags: TdFlags) -> TdFlags {
        TdFlags::from_bits_truncate(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// 清除标志，返回清除前的标志
    #[inline]
    pub(crate) fn clear_flags(&self, flags: TdFlags) -> TdFlags {
        TdFlags::from_bits_truncate(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    #[inline]
    pub fn is_borrowing(&self) -> bool {
        self.flags().contains(TdFlags::BORROWING)
    }

    pub fn wchan(&self) -> Option<WaitChannel> {
        self.sched.lock().wchan
    }

    pub fn wmesg(&self) -> &'static str {
        self.sched.lock().wmesg
    }

    pub fn blocked_on(&self) -> Option<LockId> {
        self.sched.lock().blocked
    }

    /// 上下文切换次数
    pub fn nctxsw(&self) -> u64 {
        self.sched.lock().nctxsw
    }

    /// 累计运行与睡眠时间（滴答）
    pub fn times(&self) -> (Systime, Systime) {
        let ts = self.sched.lock();
        (ts.rtime, ts.slptime)
    }

    #[inline]
    pub(crate) fn idnest(&self) -> &AtomicU32 {
        &self.idnest
    }

    #[inline]
    pub(crate) fn pdnest(&self) -> &AtomicU32 {
        &self.pdnest
    }

    /// join 的等待通道：线程控制块自身的地址
    pub(crate) fn join_channel(&self) -> WaitChannel {
        WaitChannel::of(self)
    }
}

/// 线程表：所有线程加上等待回收的 zombie
pub struct ThreadTable {
    all: BTreeMap<Tid, Arc<Thread>>,
    zombies: Vec<Tid>,
}

impl ThreadTable {
    pub const fn new() -> Self {
        Self {
            all: BTreeMap::new(),
            zombies: Vec::new(),
        }
    }

    pub fn insert(&mut self, td: Arc<Thread>) {
        self.all.insert(td.tid(), td);
    }

    pub fn get(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.all.get(&tid).cloned()
    }

    pub fn remove(&mut self, tid: Tid) -> Option<Arc<Thread>> {
        self.all.remove(&tid)
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn nzombies(&self) -> usize {
        self.zombies.len()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// 创建内核线程
    ///
    /// 线程创建后处于 INACTIVE 状态，需要 [`Kernel::sched_add`] 才会运行。
    /// `entry` 返回后线程自动退出。
    ///
    /// 睡眠队列节点、turnstile 节点和内核栈都在这里分配，
    /// 之后阻塞时不再需要分配内存。
    ///
    /// # 返回
    /// 新线程的 TID，TID 耗尽时返回 None
    pub fn thread_create<F>(&'static self, name: &str, prio: Prio, entry: F) -> Option<Tid>
    where
        F: FnOnce(&'static Kernel) + Send + 'static,
    {
        // 顺便回收已经退出的线程
        self.thread_reap();

        let tid = self.tids.alloc()?;
        let td = Arc::new(Thread::new(tid, name, prio));

        self.machine.ctx_init(
            tid,
            Box::new(move || {
                self.thread_start();
                entry(self);
                self.thread_exit();
            }),
        );
        self.threads.lock().insert(td);

        log::debug!("thread: created {} '{}' prio {}", tid, name, prio);
        Some(tid)
    }

    /// 新线程第一次运行时的准备工作
    fn thread_start(&self) {
        let td = self.thread_self();
        log::trace!("thread: {} '{}' starts", td.tid(), td.name());
        if td.idnest().load(Ordering::Relaxed) == 0 {
            self.machine.cpu_intr_enable();
        }
    }

    /// 退出当前线程
    ///
    /// 线程进入 zombie 链表并唤醒所有 join 它的线程，之后由
    /// [`Kernel::thread_reap`] 回收资源。
    pub fn thread_exit(&self) -> ! {
        let td = self.thread_self();
        let tid = td.tid();
        if td.idnest().load(Ordering::Relaxed) > 0 {
            panic!("thread {} exiting with interrupts disabled", tid);
        }

        // 切走之前不允许被抢占
        self.preempt_disable();

        self.threads.lock().zombies.push(tid);

        let chan = td.join_channel();
        self.sleepq_broadcast(chan);

        td.sched.lock().state = ThreadState::Dead;
        log::debug!("thread: {} '{}' exits", tid, td.name());
        drop(td);

        self.sched_switch();
        panic!("thread {} tried to resurrect", tid);
    }

    /// 等待线程退出
    ///
    /// 已经被回收（或从未存在）的线程立即返回。
    pub fn thread_join(&self, tid: Tid) {
        let Some(td) = self.thread_find(tid) else {
            return;
        };
        assert_ne!(tid, self.curthread(), "thread {} joining itself", tid);

        let chan = td.join_channel();
        let _intr = self.intr_guard();
        while td.state() != ThreadState::Dead {
            self.sleepq_wait(chan, "thread_join");
        }
    }

    /// 主动让出 CPU，当前线程回到运行队列
    pub fn thread_yield(&self) {
        if !self.pcpu.sched_active() {
            return;
        }
        {
            let td = self.thread_self();
            td.sched.lock().state = ThreadState::Ready;
        }
        self.sched_switch();
    }

    /// 停止当前线程，直到 [`Kernel::thread_continue`]
    pub fn thread_stop(&self) {
        if !self.pcpu.sched_active() {
            return;
        }
        {
            let td = self.thread_self();
            td.sched.lock().state = ThreadState::Stopped;
            log::debug!("thread: {} stopped", td.tid());
        }
        self.sched_switch();
    }

    /// 恢复一个被停止的线程
    ///
    /// # 返回
    /// 线程确实处于 STOPPED 状态并被唤醒时返回 true
    pub fn thread_continue(&self, tid: Tid) -> bool {
        let Some(td) = self.thread_find(tid) else {
            return false;
        };
        let mut ts = td.sched.lock();
        if ts.state != ThreadState::Stopped {
            return false;
        }
        self.sched_wakeup(&td, &mut ts, TdLock::Sched);
        true
    }

    /// 向线程投递异步信号
    ///
    /// 设置 NEEDSIGCHK，并打断它正在进行的可中断睡眠。
    ///
    /// # 返回
    /// 线程的睡眠被打断时返回 true
    pub fn thread_interrupt(&self, tid: Tid) -> bool {
        let Some(td) = self.thread_find(tid) else {
            return false;
        };
        td.set_flags(TdFlags::NEEDSIGCHK);
        drop(td);
        self.sleepq_abort(tid)
    }

    /// 信号处理完毕，清除 NEEDSIGCHK
    pub fn thread_clear_interrupt(&self, tid: Tid) {
        if let Some(td) = self.thread_find(tid) {
            td.clear_flags(TdFlags::NEEDSIGCHK);
        }
    }

    /// 按 TID 查找线程
    pub fn thread_find(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.threads.lock().get(tid)
    }

    /// 按 TID 查找线程，找不到说明内核状态已经损坏
    pub(crate) fn thread(&self, tid: Tid) -> Arc<Thread> {
        match self.thread_find(tid) {
            Some(td) => td,
            None => panic!("thread {} is not registered", tid),
        }
    }

    /// 当前线程
    pub fn thread_self(&self) -> Arc<Thread> {
        self.thread(self.curthread())
    }

    /// 回收所有 zombie 线程
    pub fn thread_reap(&self) {
        let zombies = core::mem::take(&mut self.threads.lock().zombies);
        for tid in zombies {
            let td = self.threads.lock().remove(tid);
            if let Some(td) = td {
                self.thread_delete(td);
            }
        }
    }

    /// 释放线程资源
    fn thread_delete(&self, td: Arc<Thread>) {
        let tid = td.tid();
        assert_eq!(td.state(), ThreadState::Dead, "deleting live thread {}", tid);
        assert_ne!(tid, TID_THREAD0);

        self.machine.ctx_release(tid);

        self.callout_stop(&td.slpcallout);
        self.callout_drain(&td.slpcallout);

        let mut ts = td.sched.lock();
        assert!(ts.sleepq.is_some(), "thread {} lost its sleep queue", tid);
        assert!(ts.turnstile.is_some(), "thread {} lost its turnstile", tid);
        assert!(ts.contested.is_empty(), "thread {} died holding contested locks", tid);
        ts.sleepq = None;
        ts.turnstile = None;

        log::debug!("thread: reaped {}", tid);
    }
}
