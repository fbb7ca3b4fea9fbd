// 测试：优先级调度器
//
// 测试内容：
// 1. 严格按优先级选择，同优先级 FIFO
// 2. 时间片用完后同优先级轮转
// 3. 禁止抢占期间不切换，打开抢占时立即切换
// 4. 中断屏蔽嵌套
// 5. 借用优先级与归还，嵌套借用
// 6. 中断上下文中切换是致命错误

use core::sync::atomic::Ordering;

use super::{boot, Trace};
use crate::config::TIME_SLICE_TICKS;
use crate::process::thread::ThreadState;
use crate::sync::WaitChannel;

#[test]
fn test_priority_order_and_fifo() {
    let (k, _) = boot();
    let trace = Trace::new();

    for (name, prio) in [("t1", 30), ("t2", 50), ("t3", 50), ("t4", 40), ("t5", 50)] {
        let trace = trace.clone();
        let tid = k.thread_create(name, prio, move |_| trace.push(name)).unwrap();
        k.sched_add(tid);
    }
    assert!(trace.get().is_empty(), "sched_add must not switch immediately");

    k.thread_yield();
    assert_eq!(trace.get(), ["t2", "t3", "t5", "t4", "t1"]);
}

#[test]
fn test_higher_priority_marks_preemption() {
    let (k, _) = boot();
    k.thread_yield();

    let trace = Trace::new();
    let t = {
        let trace = trace.clone();
        k.thread_create("high", 100, move |_| trace.push("high")).unwrap()
    };
    k.sched_add(t);
    assert!(trace.get().is_empty());

    // 任何一个安全点都会切换
    k.sched_maybe_preempt();
    assert_eq!(trace.get(), ["high"]);
}

#[test]
fn test_time_slice_round_robin() {
    let (k, _) = boot();
    let trace = Trace::new();

    for name in ["a", "b"] {
        let trace = trace.clone();
        let tid = k
            .thread_create(name, 50, move |k| {
                for _ in 0..3 {
                    trace.push(name);
                    // 模拟线程运行期间到来的时钟中断
                    for _ in 0..TIME_SLICE_TICKS {
                        k.clock_intr();
                    }
                }
            })
            .unwrap();
        k.sched_add(tid);
    }

    k.thread_yield();
    assert_eq!(trace.get(), ["a", "b", "a", "b", "a", "b"]);
}

#[test]
fn test_slice_not_exhausted_keeps_running() {
    let (k, _) = boot();
    let trace = Trace::new();

    for name in ["a", "b"] {
        let trace = trace.clone();
        let tid = k
            .thread_create(name, 50, move |k| {
                trace.push(name);
                for _ in 0..TIME_SLICE_TICKS - 1 {
                    k.clock_intr();
                }
                trace.push(name);
            })
            .unwrap();
        k.sched_add(tid);
    }

    k.thread_yield();
    assert_eq!(trace.get(), ["a", "a", "b", "b"]);
}

#[test]
fn test_no_preemption_guard() {
    let (k, _) = boot();
    k.thread_yield();

    let trace = Trace::new();
    {
        let _guard = k.no_preemption();
        assert!(k.preempt_disabled());

        let trace = trace.clone();
        let t = k.thread_create("high", 100, move |_| trace.push("high")).unwrap();
        k.sched_add(t);

        // 空通道上的 signal 是一个安全点，但抢占被禁止
        k.sleepq_signal(WaitChannel::from_addr(0x1000));
        k.sched_maybe_preempt();
    }
    assert!(!k.preempt_disabled());
    assert_eq!(trace.get(), ["high"]);
}

#[test]
fn test_intr_nesting() {
    let (k, m) = boot();
    use crate::arch::Machine;

    k.intr_disable();
    k.intr_disable();
    assert!(k.intr_disabled());
    assert!(m.cpu_intr_disabled());

    k.intr_enable();
    assert!(k.intr_disabled());
    assert!(m.cpu_intr_disabled());

    k.intr_enable();
    assert!(!k.intr_disabled());
    assert!(!m.cpu_intr_disabled());

    {
        let _g = k.intr_guard();
        assert!(m.cpu_intr_disabled());
    }
    assert!(!m.cpu_intr_disabled());
}

#[test]
fn test_intr_disabled_blocks_preemption() {
    let (k, _) = boot();
    k.thread_yield();

    let trace = Trace::new();
    let t = {
        let trace = trace.clone();
        k.thread_create("high", 100, move |_| trace.push("high")).unwrap()
    };
    k.sched_add(t);

    k.intr_disable();
    k.sched_maybe_preempt();
    assert!(trace.get().is_empty());
    // 打开中断本身不是安全点
    k.intr_enable();
    assert!(trace.get().is_empty());

    k.sched_maybe_preempt();
    assert_eq!(trace.get(), ["high"]);
}

#[test]
fn test_lend_unlend_round_trip() {
    let (k, _) = boot();
    k.thread_yield();

    let t = k.thread_create("t", 30, |_| {}).unwrap();
    k.sched_add(t);
    let td = k.thread_find(t).unwrap();
    let before = (td.prio(), td.is_borrowing());

    k.sched_lend_prio(t, 45);
    assert_eq!(td.prio(), 45);
    assert_eq!(td.base_prio(), 30);
    assert!(td.is_borrowing());
    assert_eq!(td.state(), ThreadState::Ready);

    k.sched_unlend_prio(t, 45);
    assert_eq!((td.prio(), td.is_borrowing()), before);

    k.thread_yield();
    assert_eq!(td.state(), ThreadState::Dead);
}

#[test]
fn test_nested_lend_unlend() {
    let (k, _) = boot();
    let t = k.thread_create("t", 30, |_| {}).unwrap();
    let td = k.thread_find(t).unwrap();

    k.sched_lend_prio(t, 45);
    let outer = (td.prio(), td.is_borrowing());
    assert_eq!(outer, (45, true));

    // 归还内层借用后回到外层借用
    k.sched_lend_prio(t, 50);
    assert_eq!(td.prio(), 50);
    k.sched_unlend_prio(t, 50);
    assert_eq!((td.prio(), td.is_borrowing()), outer);

    k.sched_unlend_prio(t, 45);
    assert_eq!((td.prio(), td.is_borrowing()), (30, false));
}

#[test]
fn test_unlend_keeps_lower_outstanding_loan() {
    let (k, _) = boot();
    let t = k.thread_create("t", 30, |_| {}).unwrap();
    let td = k.thread_find(t).unwrap();

    // 归还时声明仍然有效的借用 40
    k.sched_lend_prio(t, 50);
    k.sched_unlend_prio(t, 40);
    assert_eq!((td.prio(), td.is_borrowing()), (40, true));

    k.sched_unlend_prio(t, 40);
    assert_eq!((td.prio(), td.is_borrowing()), (30, false));

    // 不高于基础优先级的值直接结束借用
    k.sched_lend_prio(t, 50);
    k.sched_unlend_prio(t, 20);
    assert_eq!((td.prio(), td.is_borrowing()), (30, false));
}

#[test]
fn test_lend_moves_ready_thread() {
    let (k, _) = boot();
    k.thread_yield();
    let trace = Trace::new();

    let mut tids = Vec::new();
    for (name, prio) in [("a", 40), ("b", 30)] {
        let trace = trace.clone();
        let tid = k.thread_create(name, prio, move |_| trace.push(name)).unwrap();
        k.sched_add(tid);
        tids.push(tid);
    }

    // b 借到更高的优先级后先于 a 运行
    k.sched_lend_prio(tids[1], 50);
    k.thread_yield();
    assert_eq!(trace.get(), ["b", "a"]);
}

#[test]
fn test_set_prio_while_borrowing() {
    let (k, _) = boot();
    k.thread_yield();

    let t = k.thread_create("t", 30, |_| {}).unwrap();
    let td = k.thread_find(t).unwrap();

    k.sched_lend_prio(t, 45);
    k.sched_set_prio(t, 35);
    assert_eq!(td.prio(), 45, "base change must not drop a loan");
    assert_eq!(td.base_prio(), 35);

    k.sched_unlend_prio(t, 45);
    assert_eq!(td.prio(), 35);
    assert!(!td.is_borrowing());

    k.sched_set_prio(t, 20);
    assert_eq!(td.prio(), 20);

    k.sched_add(t);
    k.thread_yield();
}

#[test]
fn test_context_switch_stats() {
    let (k, _) = boot();
    k.thread_yield();

    let t = k
        .thread_create("t", 50, |k| {
            k.thread_yield();
            k.thread_yield();
        })
        .unwrap();
    k.sched_add(t);
    let td = k.thread_find(t).unwrap();
    let me = k.thread_self();
    let before = me.nctxsw();

    k.thread_yield();
    assert_eq!(td.state(), ThreadState::Dead);
    // 同优先级没有别的线程，让出时选中的还是自己
    assert_eq!(td.nctxsw(), 1);
    assert_eq!(me.nctxsw(), before + 1);
}

#[test]
#[should_panic(expected = "interrupt context")]
fn test_switch_in_interrupt_context_panics() {
    let (k, _) = boot();
    k.thread_yield();

    let t = k.thread_create("t", 50, |_| {}).unwrap();
    k.sched_add(t);
    k.pcpu.no_switch.fetch_add(1, Ordering::SeqCst);
    k.thread_yield();
}
