//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 线程 ID 管理
//!
//! - TID 0: thread0（启动线程）
//! - TID 1+: 按创建顺序单调分配，不复用

use core::sync::atomic::{AtomicU32, Ordering};

use super::thread::Tid;
use crate::config::TID_MAX;

/// 启动线程的 TID
pub const TID_THREAD0: Tid = 0;

/// TID 分配器
pub struct TidAllocator {
    next: AtomicU32,
}

impl TidAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(TID_THREAD0 + 1),
        }
    }

    /// 分配一个新的 TID，耗尽时返回 None
    pub fn alloc(&self) -> Option<Tid> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |tid| {
                if tid >= TID_MAX {
                    None
                } else {
                    Some(tid + 1)
                }
            })
            .ok()
    }
}

impl Default for TidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
