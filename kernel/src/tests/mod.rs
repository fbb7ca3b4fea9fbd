//! 场景测试
//!
//! 在宿主机上运行调度核心：[`BatonMachine`] 为每个内核线程创建一个宿主线程，
//! 上下文切换就是交接一根"接力棒"，任一时刻只有持棒的线程在运行。
//! 测试函数自身所在的宿主线程就是 thread0。
//!
//! idle 线程的 `cpu_idle()` 投递一次时钟中断，所以只要所有线程都在等待，
//! 系统时间就会前进，超时和 callout 都能按滴答触发。
//!
//! 运行测试：
//! ```bash
//! cargo test --package rux-sched
//! ```

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};

use log::{LevelFilter, Log, Metadata, Record};

use crate::arch::{Machine, ThreadEntry};
use crate::kernel::Kernel;
use crate::process::thread::Tid;
use crate::process::tid::TID_THREAD0;

mod scheduler;
mod sleep_wakeup;

/// idle 线程最多空转的滴答数，超过说明测试死锁了
const IDLE_TICK_LIMIT: u64 = 100_000;

/// 被回收的线程从 ctx_switch 中展开退出时携带的负载
struct Released;

struct Baton {
    running: Tid,
    released: HashSet<Tid>,
}

struct Shared {
    baton: Mutex<Baton>,
    cv: Condvar,
}

impl Shared {
    /// 等待轮到 `tid` 运行；线程已被回收时返回 false
    fn wait_for(&self, tid: Tid) -> bool {
        let mut baton = self.baton.lock().unwrap();
        loop {
            if baton.running == tid {
                return true;
            }
            if baton.released.contains(&tid) {
                return false;
            }
            baton = self.cv.wait(baton).unwrap();
        }
    }

    fn pass_to(&self, tid: Tid) {
        self.baton.lock().unwrap().running = tid;
        self.cv.notify_all();
    }
}

/// 接力棒式的测试平台
pub struct BatonMachine {
    shared: Arc<Shared>,
    intr_disabled: AtomicBool,
    kernel: spin::Once<&'static Kernel>,
    idle_ticks: AtomicU64,
}

impl BatonMachine {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                baton: Mutex::new(Baton {
                    running: TID_THREAD0,
                    released: HashSet::new(),
                }),
                cv: Condvar::new(),
            }),
            intr_disabled: AtomicBool::new(false),
            kernel: spin::Once::new(),
            idle_ticks: AtomicU64::new(0),
        }
    }

    fn attach(&self, kernel: &'static Kernel) {
        self.kernel.call_once(|| kernel);
    }
}

impl Machine for BatonMachine {
    fn cpu_intr_disable(&self) {
        self.intr_disabled.store(true, Ordering::SeqCst);
    }

    fn cpu_intr_enable(&self) {
        self.intr_disabled.store(false, Ordering::SeqCst);
    }

    fn cpu_intr_disabled(&self) -> bool {
        self.intr_disabled.load(Ordering::SeqCst)
    }

    fn ctx_init(&self, tid: Tid, entry: ThreadEntry) {
        let shared = self.shared.clone();
        std::thread::Builder::new()
            .name(format!("kthread-{}", tid))
            .spawn(move || {
                if !shared.wait_for(tid) {
                    return;
                }
                let res = panic::catch_unwind(AssertUnwindSafe(entry));
                if let Err(payload) = res {
                    if payload.is::<Released>() {
                        return;
                    }
                    eprintln!("kernel thread {} panicked", tid);
                    std::process::abort();
                }
            })
            .unwrap();
    }

    fn ctx_switch(&self, from: Tid, to: Tid) {
        self.shared.pass_to(to);
        if !self.shared.wait_for(from) {
            // 已经退出并被回收，宿主线程到此结束
            panic::resume_unwind(Box::new(Released));
        }
    }

    fn ctx_release(&self, tid: Tid) {
        self.shared.baton.lock().unwrap().released.insert(tid);
        self.shared.cv.notify_all();
    }

    fn cpu_idle(&self) {
        if self.idle_ticks.fetch_add(1, Ordering::SeqCst) > IDLE_TICK_LIMIT {
            eprintln!("idle for {} ticks, every thread is stuck", IDLE_TICK_LIMIT);
            std::process::abort();
        }
        if let Some(kernel) = self.kernel.get() {
            kernel.clock_intr();
        }
    }
}

/// 创建并启动一个调度核心，调用者成为 thread0
pub fn boot() -> (&'static Kernel, &'static BatonMachine) {
    let machine: &'static BatonMachine = Box::leak(Box::new(BatonMachine::new()));
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(machine)));
    machine.attach(kernel);
    kernel.start();
    (kernel, machine)
}

/// 把对象转成 `'static` 引用，供内核线程共享
pub fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

/// 把内核日志收集起来，测试按通道地址筛选自己关心的记录
struct CaptureLogger;

static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());
static LOGGER: CaptureLogger = CaptureLogger;
static LOGGER_INIT: Once = Once::new();

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if record.target().starts_with("rux_sched") {
            CAPTURED.lock().unwrap().push(format!("{}", record.args()));
        }
    }

    fn flush(&self) {}
}

/// 开始收集日志，返回此后可以用 [`logged`] 读到的记录
pub fn capture_log() {
    LOGGER_INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Trace);
    });
}

/// 已收集的日志中包含 `pat` 的行，按记录顺序
pub fn logged(pat: &str) -> Vec<String> {
    CAPTURED
        .lock()
        .unwrap()
        .iter()
        .filter(|line| line.contains(pat))
        .cloned()
        .collect()
}

/// 线程间共享的执行记录
#[derive(Clone)]
pub struct Trace<T: Clone + Send>(Arc<Mutex<Vec<T>>>);

impl<T: Clone + Send> Trace<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn push(&self, v: T) {
        self.0.lock().unwrap().push(v);
    }

    pub fn get(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

#[test]
fn test_boot() {
    let (k, m) = boot();
    assert_eq!(k.curthread(), TID_THREAD0);
    assert!(k.idle_thread().is_some());
    // thread0、idle、callout
    assert_eq!(k.nthreads(), 3);
    assert!(!m.cpu_intr_disabled());

    // 让 callout 线程跑起来，它会在自己的通道上睡下
    k.thread_yield();
    assert_eq!(k.curthread(), TID_THREAD0);
}
