//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 调度与同步核心使用的错误代码
//!
//! 和 include/uapi/asm-generic/errno.h 以及 include/linux/errno.h 一致

/// 错误代码
///
/// 阻塞原语只会产生少数几种错误，调用者据此决定是否重试：
/// ```ignore
/// match kernel.sleepq_wait_intr(chan, "pipe") {
///     Ok(()) => { /* 被正常唤醒 */ }
///     Err(Errno::RestartSys) => return Err(Errno::RestartSys), // 交给上层重启系统调用
///     Err(e) => return Err(e),
/// }
/// ```
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    /// Connection timed out (ETIMEDOUT, 110)
    TimedOut = 110,

    /// 内核内部错误码：等待被信号打断，系统调用应当重启 (ERESTARTSYS, 512)
    RestartSys = 512,
}

impl Errno {
    /// 获取错误代码的正数值
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}
