//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Rux 抢占式线程调度与同步核心
//!
//! 组成（依赖顺序，叶子在前）：
//! - [`process::thread`] - 线程与线程状态机
//! - [`sched`] - 优先级运行队列与调度器
//! - [`sync::turnstile`] - 优先级继承的锁阻塞队列
//! - [`sync::sleepq`] - 等待通道睡眠队列
//! - [`time::callout`] - 时钟驱动的 callout 时间轮
//!
//! 所有全局调度状态都收在 [`Kernel`] 上下文对象中，由启动代码创建，
//! 体系结构相关的上下文切换与中断屏蔽通过 [`arch::Machine`] 注入。

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate log;

pub mod arch;
pub mod config;
pub mod errno;
pub mod kernel;
pub mod process;
pub mod sched;
pub mod sync;
pub mod time;

#[cfg(test)]
mod tests;

pub use errno::Errno;
pub use kernel::Kernel;
pub use process::thread::{Thread, ThreadState, Tid};
pub use sched::prio::Prio;
