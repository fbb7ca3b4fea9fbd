//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 线程优先级
//!
//! 数值越大优先级越高：
//! - 0: idle 线程专用
//! - 1..=127: 用户线程
//! - 128..=255: 内核线程

/// 优先级
pub type Prio = u8;

/// 运行队列层数（每个优先级一层）
pub const RQ_NQS: usize = 256;

/// idle 线程优先级
pub const PRIO_IDLE: Prio = 0;

/// 启动线程 (thread0) 的优先级：最低的非 idle 优先级
pub const PRIO_THREAD0: Prio = 1;

/// 用户线程最高优先级
pub const PRIO_UTHREAD_MAX: Prio = 127;

/// 内核线程最低优先级
pub const PRIO_KTHREAD_MIN: Prio = 128;

/// 内核线程最高优先级
pub const PRIO_KTHREAD_MAX: Prio = 255;

/// 第 n 档内核线程优先级，`prio_kthread(0)` 最高
pub const fn prio_kthread(n: u8) -> Prio {
    assert!(n <= PRIO_KTHREAD_MAX - PRIO_KTHREAD_MIN);
    PRIO_KTHREAD_MAX - n
}

/// 第 n 档用户线程优先级，`prio_uthread(0)` 最高
pub const fn prio_uthread(n: u8) -> Prio {
    assert!(n < PRIO_UTHREAD_MAX);
    PRIO_UTHREAD_MAX - n
}
