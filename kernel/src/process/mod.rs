//! 线程管理模块
//!
//! - `thread`: 线程控制块与线程状态机，创建/退出/join/回收
//! - `tid`: 线程 ID 分配

pub mod thread;
pub mod tid;

pub use thread::{TdFlags, Thread, ThreadState, ThreadTable, Tid};
