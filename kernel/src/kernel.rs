//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度核心上下文
//!
//! [`Kernel`] 收拢了所有调度与同步状态：运行队列、线程表、睡眠队列与
//! turnstile 哈希链、callout 时间轮和时钟。启动代码创建它并转成
//! `&'static` 引用，之后所有线程都通过这个引用进入调度核心。

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::Machine;
use crate::process::thread::{Thread, ThreadState, ThreadTable, Tid};
use crate::process::tid::{TidAllocator, TID_THREAD0};
use crate::sched::prio::{prio_kthread, PRIO_IDLE, PRIO_THREAD0};
use crate::sched::runq::RunQueue;
use crate::sync::sleepq::SleepqChains;
use crate::sync::turnstile::TurnstileChains;
use crate::time::callout::CalloutWheel;

const NO_THREAD: Tid = Tid::MAX;

/// 每 CPU 数据
pub struct PerCpu {
    /// 当前运行的线程
    curthread: AtomicU32,

    /// idle 线程
    idle_thread: AtomicU32,

    /// 中断处理嵌套深度；非零时禁止上下文切换
    pub(crate) no_switch: AtomicU32,

    /// 调度器是否已经启动
    sched_active: AtomicBool,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            curthread: AtomicU32::new(TID_THREAD0),
            idle_thread: AtomicU32::new(NO_THREAD),
            no_switch: AtomicU32::new(0),
            sched_active: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn curthread(&self) -> Tid {
        self.curthread.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_curthread(&self, tid: Tid) {
        self.curthread.store(tid, Ordering::Release);
    }

    #[inline]
    pub fn idle_thread(&self) -> Option<Tid> {
        match self.idle_thread.load(Ordering::Acquire) {
            NO_THREAD => None,
            tid => Some(tid),
        }
    }

    #[inline]
    pub fn sched_active(&self) -> bool {
        self.sched_active.load(Ordering::Acquire)
    }
}

/// 调度核心上下文
pub struct Kernel {
    pub(crate) machine: &'static dyn Machine,
    pub(crate) pcpu: PerCpu,
    pub(crate) runq: Mutex<RunQueue>,
    pub(crate) threads: Mutex<ThreadTable>,
    pub(crate) tids: TidAllocator,
    pub(crate) sleepq: SleepqChains,
    pub(crate) turnstiles: TurnstileChains,
    pub(crate) callout: CalloutWheel,
    pub(crate) ticks: AtomicU64,
}

impl Kernel {
    /// 创建调度核心
    ///
    /// 调用者成为 thread0，处于 RUNNING 状态。此时调度器尚未启动，
    /// 上下文切换不会发生，直到 [`Kernel::start`]。
    pub fn new(machine: &'static dyn Machine) -> Self {
        let thread0 = Arc::new(Thread::new(TID_THREAD0, "thread0", PRIO_THREAD0));
        thread0.sched.lock().state = ThreadState::Running;

        let mut threads = ThreadTable::new();
        threads.insert(thread0);

        Self {
            machine,
            pcpu: PerCpu::new(),
            runq: Mutex::new(RunQueue::new()),
            threads: Mutex::new(threads),
            tids: TidAllocator::new(),
            sleepq: SleepqChains::new(),
            turnstiles: TurnstileChains::new(),
            callout: CalloutWheel::new(),
            ticks: AtomicU64::new(0),
        }
    }

    /// 创建调度核心并启动调度器
    pub fn boot(machine: &'static dyn Machine) -> &'static Kernel {
        let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(machine)));
        kernel.start();
        kernel
    }

    /// 启动调度器
    ///
    /// 创建 idle 线程和 callout 线程并打开调度。
    pub fn start(&'static self) {
        assert!(!self.pcpu.sched_active(), "scheduler started twice");

        let Some(idle) = self.thread_create("idle-thread", PRIO_IDLE, |k| k.idle_loop()) else {
            panic!("failed to create idle thread");
        };
        self.pcpu.idle_thread.store(idle, Ordering::Release);

        let Some(callout) = self.thread_create("callout", prio_kthread(0), |k| k.callout_thread())
        else {
            panic!("failed to create callout thread");
        };
        self.sched_add(callout);

        self.pcpu.sched_active.store(true, Ordering::Release);
        log::info!(
            "{} {}: scheduler started (idle {}, callout {})",
            crate::config::KERNEL_NAME,
            crate::config::KERNEL_VERSION,
            idle,
            callout
        );
    }

    /// 当前线程的 TID
    #[inline]
    pub fn curthread(&self) -> Tid {
        self.pcpu.curthread()
    }

    /// idle 线程的 TID（调度器启动前为 None）
    #[inline]
    pub fn idle_thread(&self) -> Option<Tid> {
        self.pcpu.idle_thread()
    }

    #[inline]
    pub(crate) fn is_idle(&self, tid: Tid) -> bool {
        self.pcpu.idle_thread() == Some(tid)
    }

    /// 注册的线程数（含 zombie）
    pub fn nthreads(&self) -> usize {
        self.threads.lock().len()
    }
}
