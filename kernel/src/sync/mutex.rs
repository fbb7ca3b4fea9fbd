//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 睡眠互斥锁
//!
//! 无竞争时一次 CAS 完成加锁；有竞争时在 turnstile 上阻塞，
//! 并把优先级借给持有者。解锁时锁直接交给优先级最高的等待者。
//!
//! 对应 Linux 的 `struct rt_mutex`

use core::sync::atomic::{AtomicU32, Ordering};

use super::turnstile::LockId;
use crate::kernel::Kernel;
use crate::process::thread::Tid;

const UNOWNED: u32 = u32::MAX;

/// 睡眠互斥锁
///
/// 锁本身只有一个持有者字段；等待者挂在按锁地址哈希的 turnstile 上。
/// 持有期间不能在睡眠队列上睡眠。
pub struct Mutex {
    owner: AtomicU32,
    name: &'static str,
}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self {
            owner: AtomicU32::new(UNOWNED),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 当前持有者
    pub fn owner(&self) -> Option<Tid> {
        match self.owner.load(Ordering::Acquire) {
            UNOWNED => None,
            tid => Some(tid),
        }
    }

    #[inline]
    pub fn lock_id(&self) -> LockId {
        LockId::of(self)
    }

    fn try_acquire(&self, tid: Tid) -> Result<(), Tid> {
        self.owner
            .compare_exchange(UNOWNED, tid, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
    }
}

/// [`Kernel::mtx_guard`] 返回的 RAII 守卫
pub struct MutexGuard<'a> {
    kernel: &'a Kernel,
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.kernel.mtx_unlock(self.mutex);
    }
}

impl Kernel {
    /// 加锁，锁被占用时阻塞
    pub fn mtx_lock(&self, m: &Mutex) {
        let tid = self.curthread();
        assert_ne!(m.owner(), Some(tid), "recursive lock of mutex '{}'", m.name);

        if m.try_acquire(tid).is_ok() {
            return;
        }

        let _intr = self.intr_guard();
        let lock = m.lock_id();
        let tc = self.turnstiles.chain(lock);

        // 持有者可能在我们拿到链锁之前释放了锁
        match m.try_acquire(tid) {
            Ok(()) => return,
            Err(owner) => self.turnstile_wait(tc, lock, owner, m.name),
        }

        assert_eq!(m.owner(), Some(tid), "mutex '{}' was not handed over", m.name);
    }

    /// 尝试加锁，不阻塞
    pub fn mtx_try_lock(&self, m: &Mutex) -> bool {
        m.try_acquire(self.curthread()).is_ok()
    }

    /// 解锁；有等待者时把锁交给优先级最高的那个
    pub fn mtx_unlock(&self, m: &Mutex) {
        let tid = self.curthread();
        assert_eq!(m.owner(), Some(tid), "unlocking mutex '{}' not owned by {}", m.name, tid);

        {
            let _intr = self.intr_guard();
            let lock = m.lock_id();
            let handoff = {
                let mut tc = self.turnstiles.chain(lock);
                let h = Self::turnstile_handoff(&mut tc, lock);
                let next = h.as_ref().map_or(UNOWNED, |h| h.new_owner);
                m.owner.store(next, Ordering::Release);
                h
            };
            if let Some(h) = handoff {
                self.turnstile_finish(h);
            }
        }

        self.sched_maybe_preempt();
    }

    /// 当前线程是否持有锁
    pub fn mtx_owned(&self, m: &Mutex) -> bool {
        m.owner() == Some(self.curthread())
    }

    /// 加锁并返回守卫，守卫离开作用域时解锁
    pub fn mtx_guard<'a>(&'a self, m: &'a Mutex) -> MutexGuard<'a> {
        self.mtx_lock(m);
        MutexGuard {
            kernel: self,
            mutex: m,
        }
    }
}
