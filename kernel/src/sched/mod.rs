//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器模块
//!
//! - `prio`: 优先级类别
//! - `runq`: 位图加速的优先级运行队列
//! - `sched`: 唤醒、优先级借用、上下文切换、时间片与抢占
//!
//! 调度入口: sched_maybe_preempt() / thread_yield() -> sched_switch() -> Machine::ctx_switch()

pub mod prio;
pub mod runq;
pub mod sched;

pub use prio::{prio_kthread, prio_uthread, Prio, PRIO_IDLE, PRIO_THREAD0};
pub use runq::RunQueue;
pub use sched::{IntrGuard, NoPreemptGuard};
