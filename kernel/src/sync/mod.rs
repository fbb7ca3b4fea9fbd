//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 同步原语
//!
//! - `sleepq` - 睡眠队列：按等待通道睡眠与唤醒（对应 Linux 的 wait queue）
//! - `turnstile` - 带优先级继承的锁等待队列（对应 Linux 的 rt_mutex waiter 树）
//! - `mutex` - 建立在 turnstile 上的睡眠互斥锁
//! - `condvar` - 建立在睡眠队列上的条件变量
//!
//! 睡眠队列和 turnstile 都按地址哈希到固定数量的链上，每条链一把自旋锁。

pub mod condvar;
pub mod mutex;
pub mod sleepq;
pub mod turnstile;

pub use condvar::CondVar;
pub use mutex::{Mutex, MutexGuard};
pub use sleepq::{SleepKind, WaitChannel};
pub use turnstile::LockId;

/// 地址哈希到 `nchains` 条链之一
///
/// 低 8 位在对齐的对象里几乎不变，把高位折叠下来。
#[inline]
pub(crate) const fn chain_hash(addr: usize, nchains: usize) -> usize {
    ((addr >> 8) ^ addr) & (nchains - 1)
}

const _: () = assert!(crate::config::SLEEPQ_CHAINS.is_power_of_two());
const _: () = assert!(crate::config::TURNSTILE_CHAINS.is_power_of_two());
