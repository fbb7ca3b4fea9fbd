// 测试：睡眠队列的睡眠与唤醒
//
// 测试内容：
// 1. signal 唤醒优先级最高的线程，同优先级先到先醒
// 2. broadcast 按优先级从高到低唤醒所有线程
// 3. 等待通道只在有线程睡眠时存在
// 4. sleepq_remove 只唤醒睡在指定通道上的线程
// 5. 可中断睡眠被打断后返回 ERESTARTSYS，不可中断睡眠不受影响
// 6. 限时睡眠超时返回 ETIMEDOUT
// 7. 睡眠的线程由睡眠队列链管理，只能通过睡眠队列唤醒

use super::{boot, capture_log, leak, logged, Trace};
use crate::errno::Errno;
use crate::process::thread::{TdLock, ThreadState};
use crate::sync::WaitChannel;

#[test]
fn test_signal_wakes_highest_priority() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let trace = Trace::new();

    for prio in [3u8, 7, 5] {
        let trace = trace.clone();
        let t = k
            .thread_create("sleeper", prio, move |k| {
                k.sleepq_wait(chan, "test");
                trace.push(prio);
            })
            .unwrap();
        k.sched_add(t);
    }
    k.thread_yield();
    assert_eq!(k.sleepq_lookup(chan), Some(3));

    assert!(k.sleepq_signal(chan));
    assert_eq!(trace.get(), [7]);
    assert_eq!(k.sleepq_lookup(chan), Some(2));

    assert_eq!(k.sleepq_broadcast(chan), 2);
    assert_eq!(trace.get(), [7, 5, 3]);
    assert_eq!(k.sleepq_lookup(chan), None);
}

#[test]
fn test_signal_ties_by_arrival() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let trace = Trace::new();

    for name in ["first", "second"] {
        let trace = trace.clone();
        let t = k
            .thread_create(name, 20, move |k| {
                k.sleepq_wait(chan, "test");
                trace.push(name);
            })
            .unwrap();
        k.sched_add(t);
    }
    k.thread_yield();

    k.sleepq_signal(chan);
    assert_eq!(trace.get(), ["first"]);
    k.sleepq_signal(chan);
    assert_eq!(trace.get(), ["first", "second"]);
    assert!(!k.sleepq_signal(chan));
}

#[test]
fn test_broadcast_wakes_in_priority_order() {
    capture_log();
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let mut tids = Vec::new();
    for prio in [10u8, 30, 20] {
        let t = k
            .thread_create("sleeper", prio, move |k| k.sleepq_wait(chan, "test"))
            .unwrap();
        k.sched_add(t);
        tids.push(t);
    }
    k.thread_yield();

    // 禁止抢占，观察被唤醒线程在运行队列里的状态
    let _g = k.no_preemption();
    assert_eq!(k.sleepq_broadcast(chan), 3);
    for &t in &tids {
        let td = k.thread_find(t).unwrap();
        assert_eq!(td.state(), ThreadState::Ready);
        assert_eq!(td.wchan(), None);
    }
    assert_eq!(k.sleepq_lookup(chan), None);

    // 唤醒顺序：30、20、10
    let woke = logged("sleepq: woke thread")
        .into_iter()
        .filter(|line| line.contains(&format!(" on {:#x} (", chan.addr())))
        .collect::<Vec<_>>();
    let expected = [tids[1], tids[2], tids[0]]
        .iter()
        .map(|t| format!("sleepq: woke thread {} on {:#x} (Normal)", t, chan.addr()))
        .collect::<Vec<_>>();
    assert_eq!(woke, expected);
}

#[test]
fn test_channel_lifecycle() {
    let (k, _) = boot();
    k.thread_yield();

    let a = WaitChannel::of(leak(0u8));
    let b = WaitChannel::of(leak(0u8));
    assert_eq!(k.sleepq_lookup(a), None);

    let mut tids = Vec::new();
    for chan in [a, a, b] {
        let t = k
            .thread_create("sleeper", 20, move |k| k.sleepq_wait(chan, "test"))
            .unwrap();
        k.sched_add(t);
        tids.push(t);
    }
    k.thread_yield();

    assert_eq!(k.sleepq_lookup(a), Some(2));
    assert_eq!(k.sleepq_lookup(b), Some(1));
    let td = k.thread_find(tids[0]).unwrap();
    assert_eq!(td.state(), ThreadState::Waiting);
    assert_eq!(td.wchan(), Some(a));
    assert_eq!(td.wmesg(), "test");

    k.sleepq_signal(a);
    assert_eq!(k.sleepq_lookup(a), Some(1));
    k.sleepq_signal(a);
    assert_eq!(k.sleepq_lookup(a), None);
    assert_eq!(k.sleepq_lookup(b), Some(1));

    // 通道重新出现
    let t = k
        .thread_create("again", 20, move |k| k.sleepq_wait(a, "again"))
        .unwrap();
    k.sched_add(t);
    k.thread_yield();
    assert_eq!(k.sleepq_lookup(a), Some(1));

    k.sleepq_broadcast(a);
    k.sleepq_broadcast(b);
    assert_eq!(k.sleepq_lookup(a), None);
    assert_eq!(k.sleepq_lookup(b), None);
}

#[test]
fn test_remove_checks_channel() {
    let (k, _) = boot();
    k.thread_yield();

    let a = WaitChannel::of(leak(0u8));
    let b = WaitChannel::of(leak(0u8));
    let trace = Trace::new();

    let t = {
        let trace = trace.clone();
        k.thread_create("sleeper", 20, move |k| {
            k.sleepq_wait(a, "test");
            trace.push("woke");
        })
        .unwrap()
    };
    k.sched_add(t);
    k.thread_yield();

    assert!(!k.sleepq_remove(t, b));
    assert!(trace.get().is_empty());
    assert!(k.sleepq_remove(t, a));
    assert_eq!(trace.get(), ["woke"]);
    assert!(!k.sleepq_remove(t, a));
}

#[test]
fn test_interruptible_sleep_is_aborted() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let trace = Trace::new();

    let t = {
        let trace = trace.clone();
        k.thread_create("sleeper", 20, move |k| {
            trace.push(k.sleepq_wait_intr(chan, "intr"));
            // 信号没有处理之前，再次睡眠立即返回
            trace.push(k.sleepq_wait_intr(chan, "intr"));
            k.thread_clear_interrupt(k.curthread());
            trace.push(k.sleepq_wait_intr(chan, "intr"));
        })
        .unwrap()
    };
    k.sched_add(t);
    k.thread_yield();
    assert_eq!(k.sleepq_lookup(chan), Some(1));

    assert!(k.thread_interrupt(t));
    assert_eq!(trace.get(), [Err(Errno::RestartSys), Err(Errno::RestartSys)]);
    assert_eq!(k.sleepq_lookup(chan), Some(1));

    k.sleepq_signal(chan);
    assert_eq!(
        trace.get(),
        [Err(Errno::RestartSys), Err(Errno::RestartSys), Ok(())]
    );
}

#[test]
fn test_uninterruptible_sleep_ignores_abort() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let trace = Trace::new();

    let t = {
        let trace = trace.clone();
        k.thread_create("sleeper", 20, move |k| {
            k.sleepq_wait(chan, "normal");
            trace.push("woke");
        })
        .unwrap()
    };
    k.sched_add(t);
    k.thread_yield();

    assert!(!k.thread_interrupt(t));
    assert!(!k.sleepq_abort(t));
    assert!(trace.get().is_empty());
    assert_eq!(k.thread_find(t).unwrap().state(), ThreadState::Waiting);

    k.sleepq_signal(chan);
    assert_eq!(trace.get(), ["woke"]);
}

#[test]
fn test_timed_sleep() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let trace = Trace::new();

    let t = {
        let trace = trace.clone();
        k.thread_create("sleeper", 20, move |k| {
            let start = k.getsystime();
            let res = k.sleepq_wait_timed(chan, "timed", 5);
            trace.push((res, k.getsystime() - start));
        })
        .unwrap()
    };
    k.sched_add(t);
    k.thread_join(t);

    let result = trace.get();
    assert_eq!(result.len(), 1);
    assert_eq!(result[0].0, Err(Errno::TimedOut));
    assert!(result[0].1 >= 5);
    assert_eq!(k.sleepq_lookup(chan), None);
}

#[test]
fn test_timed_sleep_woken_early() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let trace = Trace::new();

    let t = {
        let trace = trace.clone();
        k.thread_create("sleeper", 20, move |k| {
            trace.push(k.sleepq_wait_timed(chan, "timed", 1000));
        })
        .unwrap()
    };
    k.sched_add(t);
    k.thread_yield();

    let td = k.thread_find(t).unwrap();
    assert!(td.slpcallout.is_pending());

    k.sleepq_signal(chan);
    assert_eq!(trace.get(), [Ok(())]);
    assert!(!td.slpcallout.is_pending());
    assert!(!td.slpcallout.is_active());
}

#[test]
fn test_sleeping_thread_governed_by_chain() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let t = k
        .thread_create("sleeper", 20, move |k| k.sleepq_wait(chan, "test"))
        .unwrap();
    k.sched_add(t);
    k.thread_yield();

    let td = k.thread_find(t).unwrap();
    assert!(matches!(td.sched.lock().lock, TdLock::Sleepq(_)));

    let _g = k.no_preemption();
    k.sleepq_signal(chan);
    assert_eq!(td.state(), ThreadState::Ready);
    assert_eq!(td.sched.lock().lock, TdLock::Sched);
}

#[test]
#[should_panic(expected = "is governed by")]
fn test_scheduler_cannot_wake_sleeping_thread() {
    let (k, _) = boot();
    k.thread_yield();

    let chan = WaitChannel::of(leak(0u8));
    let t = k
        .thread_create("sleeper", 20, move |k| k.sleepq_wait(chan, "test"))
        .unwrap();
    k.sched_add(t);
    k.thread_yield();

    let td = k.thread_find(t).unwrap();
    let mut ts = td.sched.lock();
    k.sched_wakeup(&td, &mut ts, TdLock::Sched);
}
