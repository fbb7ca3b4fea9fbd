//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 时钟与定时器
//!
//! 系统时间以时钟滴答计数，每秒 [`HZ`] 个滴答。
//! 对应 Linux 的 jiffies 与 kernel/time/timer.c

pub mod callout;

use core::sync::atomic::Ordering;

pub use callout::{Callout, CalloutFlags, Systime};

use crate::config::HZ;
use crate::kernel::Kernel;

/// 毫秒转换为滴答，不足一个滴答按一个计
#[inline]
pub const fn ms_to_ticks(ms: u64) -> Systime {
    (ms * HZ).div_ceil(1000)
}

#[inline]
pub const fn ticks_to_ms(ticks: Systime) -> u64 {
    ticks * 1000 / HZ
}

impl Kernel {
    /// 当前系统时间（滴答）
    #[inline]
    pub fn getsystime(&self) -> Systime {
        self.ticks.load(Ordering::Acquire)
    }

    /// 时钟中断处理
    ///
    /// 由平台的定时器中断调用，每个滴答一次：
    /// 推进系统时间、扣减时间片、处理到期的 callout。
    /// 处理期间禁止上下文切换，返回前在安全点检查抢占。
    pub fn clock_intr(&self) {
        self.intr_disable();
        self.pcpu.no_switch.fetch_add(1, Ordering::AcqRel);

        let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        self.sched_clock();
        self.callout_process(now);

        self.pcpu.no_switch.fetch_sub(1, Ordering::AcqRel);
        self.intr_enable();

        self.sched_maybe_preempt();
    }
}
