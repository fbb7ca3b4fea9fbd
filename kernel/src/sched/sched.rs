//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器实现
//!
//! 严格按优先级调度，同优先级 FIFO：
//! - 唤醒: sched_add() / sched_wakeup() 把线程放回运行队列，
//!   如果它比当前线程优先级高就给当前线程打上 NEEDSWITCH
//! - 切换: sched_switch() -> sched_choose() -> Machine::ctx_switch()
//! - 抢占: 时钟中断扣减时间片；在安全点（打开抢占、中断返回、
//!   唤醒操作结束）检查 NEEDSWITCH
//!
//! 优先级借用：线程的有效优先级可以被临时抬高 (lend)，
//! 借用结束后回到基础优先级，除非还有更高的借用没有归还。
//!
//! 锁顺序：睡眠队列链 / turnstile 链 / callout 时间轮 -> 线程 sched 锁 -> 运行队列。
//! 线程表锁只在最内层短暂持有。任何自旋锁都不能跨 ctx_switch 持有。

use core::sync::atomic::Ordering;

use crate::config::TIME_SLICE_TICKS;
use crate::kernel::Kernel;
use crate::process::thread::{TdFlags, TdLock, TdSched, Thread, ThreadState, Tid};
use crate::sched::prio::{Prio, PRIO_IDLE};
use crate::sync::turnstile::LockId;

/// 抢占禁止区域，离开作用域时重新打开抢占
///
/// 对应 Linux 的 preempt_disable() / preempt_enable() 配对
pub struct NoPreemptGuard<'a> {
    kernel: &'a Kernel,
}

impl Drop for NoPreemptGuard<'_> {
    fn drop(&mut self) {
        self.kernel.preempt_enable();
    }
}

/// 中断屏蔽区域，离开作用域时恢复
///
/// 对应 Linux 的 local_irq_save() / local_irq_restore() 配对
pub struct IntrGuard<'a> {
    kernel: &'a Kernel,
}

impl Drop for IntrGuard<'_> {
    fn drop(&mut self) {
        self.kernel.intr_enable();
    }
}

impl Kernel {
    /// 把 INACTIVE（或被停止）的线程加入调度
    ///
    /// 不会立即切换；如果新线程优先级更高，当前线程在下一个安全点被抢占。
    pub fn sched_add(&self, tid: Tid) {
        let td = self.thread(tid);
        log::debug!("sched: add thread {} '{}'", tid, td.name());
        let mut ts = td.sched.lock();
        self.sched_wakeup(&td, &mut ts, TdLock::Sched);
    }

    /// 唤醒线程：放回运行队列
    ///
    /// 调用者持有线程的 sched 锁以及 `held` 指明的、当前管理这个线程的结构，
    /// 且线程不是当前线程。线程转回由调度器管理。
    pub(crate) fn sched_wakeup(&self, td: &Thread, ts: &mut TdSched, held: TdLock) {
        assert_eq!(
            ts.lock,
            held,
            "thread {} is governed by {:?}, not {:?}",
            td.tid(),
            ts.lock,
            held
        );
        let cur = self.curthread();
        assert_ne!(td.tid(), cur, "waking up the running thread");
        assert_ne!(ts.state, ThreadState::Running, "thread {} is already running", td.tid());

        let now = self.getsystime();
        if matches!(ts.state, ThreadState::Waiting | ThreadState::Blocked) {
            ts.slptime += now.saturating_sub(ts.last_slptime);
        }

        ts.state = ThreadState::Ready;
        ts.slice = TIME_SLICE_TICKS;
        ts.lock = TdLock::Sched;

        let prio = td.prio();
        self.runq.lock().add(td.tid(), prio);

        // 新就绪的线程优先级更高时，当前线程需要让出 CPU
        if let Some(curtd) = self.thread_find(cur) {
            if prio > curtd.prio() {
                curtd.set_flags(TdFlags::NEEDSWITCH);
            }
        }
    }

    /// 修改线程的有效优先级；READY 线程在运行队列中换层
    ///
    /// 调用者持有线程的 sched 锁。
    pub(crate) fn set_active_prio(&self, td: &Thread, ts: &mut TdSched, prio: Prio) {
        let old = td.prio();
        if old == prio {
            return;
        }

        if ts.state == ThreadState::Ready && !self.is_idle(td.tid()) {
            assert_eq!(ts.lock, TdLock::Sched, "ready thread {} off the scheduler", td.tid());
            let mut rq = self.runq.lock();
            let queued = rq.remove(td.tid(), old);
            assert!(queued, "ready thread {} missing from run queue", td.tid());
            td.store_prio(prio);
            rq.add(td.tid(), prio);
        } else {
            td.store_prio(prio);
        }
    }

    /// 设置线程的基础优先级
    ///
    /// 线程正在借用更高的优先级时只修改基础优先级，借用结束后生效。
    /// 阻塞在 turnstile 上的线程会在等待链表中重新排序。
    pub fn sched_set_prio(&self, tid: Tid, prio: Prio) {
        let td = self.thread(tid);
        let _intr = self.intr_guard();

        let adjust = {
            let mut ts = td.sched.lock();
            let old = td.prio();
            td.store_base_prio(prio);

            if td.is_borrowing() && old > prio {
                return;
            }

            self.set_active_prio(&td, &mut ts, prio);
            Self::blocked_adjustment(&ts, old, prio)
        };

        if let Some((lock, old)) = adjust {
            self.turnstile_adjust(&td, lock, old);
        }
    }

    /// 把 `prio` 借给线程
    ///
    /// 借出的值记在线程上，直到用同样的值 [`Kernel::sched_unlend_prio`]。
    ///
    /// # 参数
    /// * `prio` - 必须高于线程当前的有效优先级
    pub fn sched_lend_prio(&self, tid: Tid, prio: Prio) {
        let td = self.thread(tid);
        let _intr = self.intr_guard();

        let adjust = {
            let mut ts = td.sched.lock();
            let old = td.prio();
            self.lend_prio_locked(&td, &mut ts, prio);
            ts.loans.push(prio);
            Self::blocked_adjustment(&ts, old, prio)
        };

        if let Some((lock, old)) = adjust {
            self.turnstile_adjust(&td, lock, old);
        }
    }

    pub(crate) fn lend_prio_locked(&self, td: &Thread, ts: &mut TdSched, prio: Prio) {
        assert!(
            td.prio() < prio,
            "lending prio {} to thread {} running at {}",
            prio,
            td.tid(),
            td.prio()
        );
        log::trace!("sched: lend prio {} to thread {}", prio, td.tid());
        td.set_flags(TdFlags::BORROWING);
        self.set_active_prio(td, ts, prio);
    }

    /// 收回借给线程的优先级 `prio`
    ///
    /// `prio` 是之前借出的值时，线程回到其余借用中最高的那个；
    /// 否则 `prio` 就是仍然有效的借用，线程改为借用它（不高于基础优先级时
    /// 回到基础优先级）。线程持有的有等待者的锁始终构成借用。
    pub fn sched_unlend_prio(&self, tid: Tid, prio: Prio) {
        let td = self.thread(tid);
        let _intr = self.intr_guard();

        {
            let mut ts = td.sched.lock();
            match ts.loans.iter().rposition(|&p| p == prio) {
                Some(i) => {
                    ts.loans.remove(i);
                }
                None => {
                    ts.loans.clear();
                    if prio > td.base_prio() {
                        ts.loans.push(prio);
                    }
                }
            }
        }

        let inherited = self.turnstile_top_loan(&td);
        self.sched_reloan(&td, inherited);
    }

    /// 按仍然有效的借用重新设置有效优先级
    ///
    /// `inherited` 是线程持有的锁上最高的等待者优先级，调用者在
    /// 拿线程 sched 锁之前算好。
    pub(crate) fn sched_reloan(&self, td: &Thread, inherited: Option<Prio>) {
        let adjust = {
            let mut ts = td.sched.lock();
            let old = td.prio();
            let loan = ts.loans.iter().copied().max().max(inherited);
            self.unlend_prio_locked(td, &mut ts, loan.unwrap_or(PRIO_IDLE));
            Self::blocked_adjustment(&ts, old, td.prio())
        };

        if let Some((lock, old)) = adjust {
            self.turnstile_adjust(td, lock, old);
        }
    }

    /// 不高于基础优先级的 `prio` 结束借用，否则以 `prio` 继续借用
    fn unlend_prio_locked(&self, td: &Thread, ts: &mut TdSched, prio: Prio) {
        let base = td.base_prio();
        if prio <= base {
            log::trace!("sched: thread {} back to base prio {}", td.tid(), base);
            td.clear_flags(TdFlags::BORROWING);
            self.set_active_prio(td, ts, base);
        } else {
            log::trace!("sched: thread {} keeps loan {}", td.tid(), prio);
            td.set_flags(TdFlags::BORROWING);
            self.set_active_prio(td, ts, prio);
        }
    }

    /// 阻塞线程的优先级变化需要通知 turnstile
    fn blocked_adjustment(ts: &TdSched, old: Prio, new: Prio) -> Option<(LockId, Prio)> {
        if ts.state == ThreadState::Blocked && old != new {
            ts.blocked.map(|lock| (lock, old))
        } else {
            None
        }
    }

    /// 选择下一个运行的线程；运行队列为空时选择 idle 线程
    fn sched_choose(&self) -> Tid {
        let next = self.runq.lock().choose();
        let tid = match (next, self.idle_thread()) {
            (Some(tid), _) => tid,
            (None, Some(idle)) => idle,
            (None, None) => panic!("no runnable thread and no idle thread"),
        };

        let td = self.thread(tid);
        let mut ts = td.sched.lock();
        assert_ne!(ts.state, ThreadState::Running, "chosen thread {} is still running", tid);
        assert_eq!(ts.lock, TdLock::Sched, "chosen thread {} is governed by {:?}", tid, ts.lock);
        ts.state = ThreadState::Running;
        ts.last_rtime = self.getsystime();
        tid
    }

    /// 当前线程让出 CPU
    ///
    /// 调用前当前线程的状态已经改成非 RUNNING：READY 的线程重新入队，
    /// WAITING / BLOCKED / STOPPED / DEAD 的线程不入队。
    /// 选中的线程就是自己时不切换。
    pub(crate) fn sched_switch(&self) {
        if !self.pcpu.sched_active() {
            return;
        }

        let (from, to) = {
            let td = self.thread_self();
            let prev = td.clear_flags(TdFlags::SLICEEND | TdFlags::NEEDSWITCH);
            let now = self.getsystime();

            {
                let mut ts = td.sched.lock();
                assert_ne!(ts.state, ThreadState::Running, "switching away from a running thread");
                ts.rtime += now.saturating_sub(ts.last_rtime);

                match (ts.state, ts.lock) {
                    (ThreadState::Ready, TdLock::Sched) => {
                        if prev.contains(TdFlags::SLICEEND) {
                            ts.slice = TIME_SLICE_TICKS;
                        }
                        // idle 线程不进运行队列
                        if !self.is_idle(td.tid()) {
                            self.runq.lock().add(td.tid(), td.prio());
                        }
                    }
                    (ThreadState::Waiting, TdLock::Sleepq(_))
                    | (ThreadState::Blocked, TdLock::Turnstile(_)) => {
                        ts.last_slptime = now;
                    }
                    (ThreadState::Stopped | ThreadState::Dead, TdLock::Sched) => {}
                    (state, lock) => panic!(
                        "thread {} switching away in state {:?} governed by {:?}",
                        td.tid(),
                        state,
                        lock
                    ),
                }
            }

            let next = self.sched_choose();
            if next == td.tid() {
                return;
            }
            td.sched.lock().nctxsw += 1;
            (td.tid(), next)
        };

        if self.pcpu.no_switch.load(Ordering::Acquire) > 0 {
            panic!("switching context in interrupt context is forbidden");
        }

        #[cfg(feature = "debug_log")]
        log::trace!("sched: switch {} -> {}", from, to);
        self.machine.cpu_intr_disable();
        self.pcpu.set_curthread(to);
        self.machine.ctx_switch(from, to);

        // 重新被调度：恢复本线程的中断屏蔽状态
        self.cpu_intr_restore();
    }

    fn cpu_intr_restore(&self) {
        let td = self.thread_self();
        if td.idnest().load(Ordering::Relaxed) == 0 {
            self.machine.cpu_intr_enable();
        } else {
            self.machine.cpu_intr_disable();
        }
    }

    /// 时钟滴答：扣减当前线程的时间片
    ///
    /// 在中断上下文调用。idle 线程没有时间片。
    pub fn sched_clock(&self) {
        assert!(self.intr_disabled(), "sched_clock outside interrupt context");
        let td = self.thread_self();
        if self.is_idle(td.tid()) {
            return;
        }
        let mut ts = td.sched.lock();
        ts.slice -= 1;
        if ts.slice <= 0 {
            td.set_flags(TdFlags::NEEDSWITCH | TdFlags::SLICEEND);
        }
    }

    /// 安全点：当前线程被标记 NEEDSWITCH 时让出 CPU
    ///
    /// 抢占被禁止或中断被屏蔽时什么都不做。
    pub fn sched_maybe_preempt(&self) {
        if !self.pcpu.sched_active() {
            return;
        }
        {
            let td = self.thread_self();
            if td.pdnest().load(Ordering::Relaxed) > 0 || td.idnest().load(Ordering::Relaxed) > 0 {
                return;
            }
            if !td.flags().contains(TdFlags::NEEDSWITCH) {
                return;
            }
            td.sched.lock().state = ThreadState::Ready;
        }
        self.sched_switch();
    }

    /// 禁止抢占（可嵌套）
    pub fn preempt_disable(&self) {
        self.thread_self().pdnest().fetch_add(1, Ordering::Relaxed);
    }

    /// 打开抢占；嵌套归零且需要切换时立即切换
    pub fn preempt_enable(&self) {
        let prev = self.thread_self().pdnest().fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "unbalanced preempt_enable");
        self.sched_maybe_preempt();
    }

    pub fn preempt_disabled(&self) -> bool {
        self.thread_self().pdnest().load(Ordering::Relaxed) > 0
    }

    /// 在作用域内禁止抢占
    pub fn no_preemption(&self) -> NoPreemptGuard<'_> {
        self.preempt_disable();
        NoPreemptGuard { kernel: self }
    }

    /// 屏蔽中断（可嵌套，嵌套深度按线程记录）
    pub fn intr_disable(&self) {
        let td = self.thread_self();
        if td.idnest().fetch_add(1, Ordering::Relaxed) == 0 {
            self.machine.cpu_intr_disable();
        }
    }

    /// 解除一层中断屏蔽
    pub fn intr_enable(&self) {
        let td = self.thread_self();
        let prev = td.idnest().fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "unbalanced intr_enable");
        if prev == 1 {
            self.machine.cpu_intr_enable();
        }
    }

    pub fn intr_disabled(&self) -> bool {
        self.thread_self().idnest().load(Ordering::Relaxed) > 0
    }

    /// 在作用域内屏蔽中断
    pub fn intr_guard(&self) -> IntrGuard<'_> {
        self.intr_disable();
        IntrGuard { kernel: self }
    }

    /// idle 线程主循环
    pub(crate) fn idle_loop(&self) -> ! {
        loop {
            self.machine.cpu_idle();
            // 醒来说明有中断到达，看看是否有线程就绪
            self.thread_self().set_flags(TdFlags::NEEDSWITCH);
            self.sched_maybe_preempt();
        }
    }
}
