//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Callout 时间轮
//!
//! 延迟执行与周期执行的内核回调。待触发的 callout 挂在
//! `CALLOUT_BUCKETS` 个时间桶之一上（桶号 = 目标时间 mod 桶数）。
//! 时钟中断只把到期的 callout 移到委派链表并唤醒 callout 线程，
//! 回调在 callout 线程里执行，中断是打开的。
//!
//! 对应 Linux 的 kernel/time/timer.c 中的 timer wheel
//!
//! 如果两次处理之间过去了超过一整圈的滴答，本次处理扫描所有的桶，
//! 这时同一批到期的 callout 之间不保证按目标时间的先后执行。

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::Mutex;

use crate::config::CALLOUT_BUCKETS;
use crate::kernel::Kernel;
use crate::sync::sleepq::WaitChannel;

/// 系统时间，单位是时钟滴答
pub type Systime = u64;

const NBUCKETS: Systime = CALLOUT_BUCKETS as Systime;

bitflags! {
    /// Callout 状态标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CalloutFlags: u32 {
        /// 挂在时间桶上等待到期
        const PENDING = 1 << 0;
        /// 已到期，在委派链表上或者回调正在执行
        const ACTIVE  = 1 << 1;
        /// 被 callout_stop() 取消，回调里不能再重新设置
        const STOPPED = 1 << 2;
    }
}

pub(crate) struct CalloutState {
    time: Systime,
    interval: Option<Systime>,
    flags: CalloutFlags,
}

/// 定时回调
pub struct Callout {
    func: Box<dyn Fn(&Kernel) + Send + Sync>,
    state: Mutex<CalloutState>,
}

impl Callout {
    pub fn new<F>(func: F) -> Arc<Self>
    where
        F: Fn(&Kernel) + Send + Sync + 'static,
    {
        Arc::new(Self {
            func: Box::new(func),
            state: Mutex::new(CalloutState {
                time: 0,
                interval: None,
                flags: CalloutFlags::empty(),
            }),
        })
    }

    pub fn flags(&self) -> CalloutFlags {
        self.state.lock().flags
    }

    pub fn is_pending(&self) -> bool {
        self.flags().contains(CalloutFlags::PENDING)
    }

    pub fn is_active(&self) -> bool {
        self.flags().contains(CalloutFlags::ACTIVE)
    }

    /// 目标时间
    pub fn time(&self) -> Systime {
        self.state.lock().time
    }

    /// 周期，非周期 callout 为 None
    pub fn interval(&self) -> Option<Systime> {
        self.state.lock().interval
    }

    /// drain 等待的通道
    fn wchan(&self) -> WaitChannel {
        WaitChannel::of(self)
    }
}

pub(crate) struct WheelInner {
    buckets: Vec<VecDeque<Arc<Callout>>>,

    /// 已到期、等待 callout 线程执行
    delegated: VecDeque<Arc<Callout>>,

    /// 上一次处理的时间
    last: Systime,
}

impl WheelInner {
    fn new() -> Self {
        let mut buckets = Vec::with_capacity(CALLOUT_BUCKETS);
        buckets.resize_with(CALLOUT_BUCKETS, VecDeque::new);
        Self {
            buckets,
            delegated: VecDeque::new(),
            last: 0,
        }
    }

    #[inline]
    fn bucket(time: Systime) -> usize {
        (time % NBUCKETS) as usize
    }

    /// 挂到目标时间对应的桶上；已经过去的时间推迟到下一个滴答
    fn insert(&mut self, co: &Arc<Callout>, st: &mut CalloutState, time: Systime) {
        let time = time.max(self.last + 1);
        st.time = time;
        st.flags.insert(CalloutFlags::PENDING);
        self.buckets[Self::bucket(time)].push_back(co.clone());
    }

    fn remove(&mut self, co: &Arc<Callout>, time: Systime) -> bool {
        let bucket = &mut self.buckets[Self::bucket(time)];
        match bucket.iter().position(|c| Arc::ptr_eq(c, co)) {
            Some(i) => {
                bucket.remove(i);
                true
            }
            None => false,
        }
    }

    /// 把到 `now` 为止到期的 callout 移到委派链表
    ///
    /// 扫描从上次处理时间所在的桶到 `now` 所在的桶；
    /// 间隔超过一整圈时扫描所有的桶。
    fn expire(&mut self, now: Systime) -> bool {
        let first = Self::bucket(self.last);
        let last = if now.wrapping_sub(self.last) >= NBUCKETS {
            Self::bucket(self.last.wrapping_sub(1))
        } else {
            Self::bucket(now)
        };

        let WheelInner {
            buckets, delegated, ..
        } = self;

        let mut b = first;
        loop {
            buckets[b].retain(|co| {
                let mut st = co.state.lock();
                if st.time > now {
                    return true;
                }
                st.flags.remove(CalloutFlags::PENDING);
                st.flags.insert(CalloutFlags::ACTIVE);
                delegated.push_back(co.clone());
                false
            });
            if b == last {
                break;
            }
            b = (b + 1) % CALLOUT_BUCKETS;
        }

        self.last = now;
        !self.delegated.is_empty()
    }
}

/// Callout 时间轮
pub(crate) struct CalloutWheel {
    inner: Mutex<WheelInner>,
}

impl CalloutWheel {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(WheelInner::new()),
        }
    }
}

impl Kernel {
    fn callout_chan(&self) -> WaitChannel {
        WaitChannel::of(&self.callout)
    }

    fn callout_arm(&self, co: &Arc<Callout>, time: Systime, interval: Option<Systime>) {
        let mut w = self.callout.inner.lock();
        let mut st = co.state.lock();
        assert!(
            !st.flags.intersects(CalloutFlags::PENDING | CalloutFlags::ACTIVE),
            "callout registered twice"
        );
        st.interval = interval;
        st.flags.remove(CalloutFlags::STOPPED);
        w.insert(co, &mut st, time);
    }

    /// 在绝对时间 `time` 触发
    pub fn callout_setup(&self, co: &Arc<Callout>, time: Systime) {
        self.callout_arm(co, time, None);
    }

    /// 在 `ticks` 个滴答之后触发
    pub fn callout_setup_relative(&self, co: &Arc<Callout>, ticks: Systime) {
        let time = self.getsystime() + ticks;
        self.callout_arm(co, time, None);
    }

    /// `ticks` 个滴答之后第一次触发，之后每 `interval` 个滴答触发一次
    pub fn callout_setup_periodic(&self, co: &Arc<Callout>, ticks: Systime, interval: Systime) {
        assert!(interval > 0, "periodic callout with zero interval");
        let time = self.getsystime() + ticks;
        self.callout_arm(co, time, Some(interval));
    }

    /// 在回调中重新设置目标时间
    ///
    /// # 返回
    /// callout 已经被 stop 时不再设置，返回 false
    pub fn callout_reschedule(&self, co: &Arc<Callout>, time: Systime) -> bool {
        let mut w = self.callout.inner.lock();
        let mut st = co.state.lock();
        assert!(
            st.flags.contains(CalloutFlags::ACTIVE),
            "callout rescheduled outside of its callback"
        );
        if st.flags.contains(CalloutFlags::STOPPED) {
            return false;
        }
        if st.flags.contains(CalloutFlags::PENDING) {
            let old = st.time;
            w.remove(co, old);
        }
        w.insert(co, &mut st, time);
        true
    }

    /// 取消 callout
    ///
    /// # 返回
    /// callout 在桶上等待、且回调没有在执行时返回 true
    pub fn callout_stop(&self, co: &Arc<Callout>) -> bool {
        let mut w = self.callout.inner.lock();
        let mut st = co.state.lock();
        st.flags.insert(CalloutFlags::STOPPED);
        st.interval = None;

        if !st.flags.contains(CalloutFlags::PENDING) {
            return false;
        }
        let found = w.remove(co, st.time);
        assert!(found, "pending callout missing from its bucket");
        st.flags.remove(CalloutFlags::PENDING);
        !st.flags.contains(CalloutFlags::ACTIVE)
    }

    /// 等待 callout 执行完毕
    ///
    /// 周期 callout 必须先 stop。
    ///
    /// # 返回
    /// callout 既不在等待也没有执行时立即返回 false
    pub fn callout_drain(&self, co: &Arc<Callout>) -> bool {
        {
            let st = co.state.lock();
            assert!(st.interval.is_none(), "draining a periodic callout");
            if !st.flags.intersects(CalloutFlags::PENDING | CalloutFlags::ACTIVE) {
                return false;
            }
        }

        let _intr = self.intr_guard();
        loop {
            let busy = co
                .state
                .lock()
                .flags
                .intersects(CalloutFlags::PENDING | CalloutFlags::ACTIVE);
            if !busy {
                break;
            }
            self.sleepq_wait(co.wchan(), "callout_drain");
        }
        true
    }

    /// 处理到期的 callout，在时钟中断中调用
    pub fn callout_process(&self, now: Systime) {
        let expired = self.callout.inner.lock().expire(now);
        if expired {
            self.sleepq_signal(self.callout_chan());
        }
    }

    /// Callout 线程主循环
    pub(crate) fn callout_thread(&self) -> ! {
        loop {
            let co = {
                let _intr = self.intr_guard();
                loop {
                    let next = self.callout.inner.lock().delegated.pop_front();
                    match next {
                        Some(co) => break co,
                        None => self.sleepq_wait(self.callout_chan(), "callout"),
                    }
                }
            };

            {
                let st = co.state.lock();
                assert!(st.flags.contains(CalloutFlags::ACTIVE), "delegated callout not active");
                assert!(!st.flags.contains(CalloutFlags::PENDING), "delegated callout still pending");
            }

            (co.func)(self);

            let idle = {
                let _intr = self.intr_guard();
                let mut w = self.callout.inner.lock();
                let mut st = co.state.lock();
                st.flags.remove(CalloutFlags::ACTIVE);

                if let Some(interval) = st.interval {
                    if !st.flags.intersects(CalloutFlags::STOPPED | CalloutFlags::PENDING) {
                        // 错过的周期不补，从现在起的下一个滴答继续
                        let next = st.time + interval;
                        w.insert(&co, &mut st, next);
                    }
                }
                !st.flags.contains(CalloutFlags::PENDING)
            };

            if idle {
                self.sleepq_broadcast(co.wchan());
            }
        }
    }
}
