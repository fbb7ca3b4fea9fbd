//! Rux 调度核心配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 内核名称
pub const KERNEL_NAME: &str = "Rux";

/// 内核版本
pub const KERNEL_VERSION: &str = "0.1.0";

// ============================================================
// 调度器配置
// ============================================================

/// 时间片滴答数
pub const TIME_SLICE_TICKS: i32 = 10;

/// 时钟频率（每秒滴答数）
pub const HZ: u64 = 1000;

/// 线程 ID 上限
pub const TID_MAX: u32 = 32768;

/// 线程名最大长度
pub const THREAD_NAME_MAX: usize = 32;

// ============================================================
// 同步原语配置
// ============================================================

/// 睡眠队列哈希链数量
pub const SLEEPQ_CHAINS: usize = 256;

/// turnstile 哈希链数量
pub const TURNSTILE_CHAINS: usize = 256;

// ============================================================
// 定时器配置
// ============================================================

/// callout 时间轮桶数量
pub const CALLOUT_BUCKETS: usize = 64;
