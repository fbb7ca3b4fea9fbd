//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 架构相关接口
//!
//! 调度核心不直接依赖任何一种 CPU：上下文切换、中断屏蔽和 idle 等待
//! 都由平台实现 [`Machine`] 后注入到 [`crate::Kernel`]。
//!
//! 对应 Linux 的 arch/*/include/asm/switch_to.h 与 irqflags.h

use alloc::boxed::Box;

use crate::process::thread::Tid;

/// 新线程的入口
///
/// 平台在线程第一次被切换到时调用它；入口不会返回到平台代码
/// （内核在入口末尾调用 `thread_exit`）。
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// 平台抽象
///
/// 所有方法都在单个逻辑 CPU 上调用。中断屏蔽的嵌套计数由内核按线程维护，
/// 这里的 `cpu_intr_*` 只需要操作硬件状态。
pub trait Machine: Send + Sync {
    /// 屏蔽本 CPU 的中断（对应 local_irq_disable）
    fn cpu_intr_disable(&self);

    /// 打开本 CPU 的中断（对应 local_irq_enable）
    fn cpu_intr_enable(&self);

    /// 中断当前是否被屏蔽
    fn cpu_intr_disabled(&self) -> bool;

    /// 为线程准备初始上下文和内核栈
    ///
    /// 线程第一次被 `ctx_switch` 选中时开始执行 `entry`。
    fn ctx_init(&self, tid: Tid, entry: ThreadEntry);

    /// 保存 `from` 的上下文并恢复 `to`
    ///
    /// 调用时中断已屏蔽。返回时 `from` 已经重新被调度。
    fn ctx_switch(&self, from: Tid, to: Tid);

    /// 释放线程的内核栈（线程回收时调用）
    fn ctx_release(&self, tid: Tid);

    /// 等待下一个中断（对应 wfi / hlt）
    fn cpu_idle(&self);
}
