//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 条件变量 (Condition Variable)
//!
//! 对应 POSIX 的 `pthread_cond_t`，建立在睡眠队列上：
//! 条件变量自身的地址就是等待通道。
//!
//! - wait() 释放锁并睡眠，被唤醒后重新加锁
//! - signal() 唤醒优先级最高的等待者
//! - broadcast() 唤醒所有等待者

use super::mutex::Mutex;
use super::sleepq::WaitChannel;
use crate::errno::Errno;
use crate::kernel::Kernel;

/// 条件变量
///
/// # 使用示例
/// ```ignore
/// kernel.mtx_lock(&mutex);
/// while !condition_is_met() {
///     kernel.cv_wait(&cond, &mutex);  // 释放锁并等待
/// }
/// // ... 临界区 ...
/// kernel.mtx_unlock(&mutex);
///
/// // 在另一个线程中：
/// kernel.mtx_lock(&mutex);
/// // ... 修改条件 ...
/// kernel.cv_signal(&cond);  // 或 cv_broadcast()
/// kernel.mtx_unlock(&mutex);
/// ```
pub struct CondVar {
    name: &'static str,
}

impl CondVar {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    fn wchan(&self) -> WaitChannel {
        WaitChannel::of(self)
    }
}

impl Kernel {
    /// 等待条件满足（不可中断）
    ///
    /// 调用者持有 `m`；释放锁和开始睡眠之间不会丢失唤醒。
    pub fn cv_wait(&self, cv: &CondVar, m: &Mutex) {
        {
            let _intr = self.intr_guard();
            self.mtx_unlock(m);
            self.sleepq_wait(cv.wchan(), cv.name);
        }
        self.mtx_lock(m);
    }

    /// 可中断地等待条件满足
    ///
    /// 无论结果如何，返回时都重新持有 `m`。
    pub fn cv_wait_intr(&self, cv: &CondVar, m: &Mutex) -> Result<(), Errno> {
        let res = {
            let _intr = self.intr_guard();
            self.mtx_unlock(m);
            self.sleepq_wait_intr(cv.wchan(), cv.name)
        };
        self.mtx_lock(m);
        res
    }

    /// 最多等待 `timeout` 个滴答
    pub fn cv_wait_timed(&self, cv: &CondVar, m: &Mutex, timeout: u64) -> Result<(), Errno> {
        let res = {
            let _intr = self.intr_guard();
            self.mtx_unlock(m);
            self.sleepq_wait_timed(cv.wchan(), cv.name, timeout)
        };
        self.mtx_lock(m);
        res
    }

    /// 唤醒一个等待者
    pub fn cv_signal(&self, cv: &CondVar) -> bool {
        self.sleepq_signal(cv.wchan())
    }

    /// 唤醒所有等待者
    pub fn cv_broadcast(&self, cv: &CondVar) -> usize {
        self.sleepq_broadcast(cv.wchan())
    }
}
