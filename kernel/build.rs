//! Rux 调度核心构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml（或 menuconfig 生成的 build/.config）
//! 2. 生成 src/config.rs 中的调度/同步常量

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;

/// 解析 build/.config 文件（`section_key=value` 格式）
fn parse_dot_config(content: &str) -> toml::Value {
    let mut sections: HashMap<String, toml::map::Map<String, toml::Value>> = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        // 第一个下划线之前是 section
        let Some((section, config_key)) = key.trim().split_once('_') else {
            continue;
        };

        let value = value.trim();
        let parsed = if value == "true" {
            toml::Value::Boolean(true)
        } else if value == "false" {
            toml::Value::Boolean(false)
        } else if let Ok(int_val) = value.parse::<i64>() {
            toml::Value::Integer(int_val)
        } else {
            toml::Value::String(value.trim_matches('"').to_string())
        };

        sections
            .entry(section.to_string())
            .or_default()
            .insert(config_key.to_string(), parsed);
    }

    let mut root = toml::map::Map::new();
    for (name, table) in sections {
        root.insert(name, toml::Value::Table(table));
    }
    toml::Value::Table(root)
}

fn get_str<'a>(config: &'a toml::Value, section: &str, key: &str, default: &'a str) -> &'a str {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or(default)
}

fn get_int(config: &toml::Value, section: &str, key: &str, default: i64) -> i64 {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .unwrap_or(default)
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let kernel_toml = manifest_dir.join("../Kernel.toml");
    let dot_config = manifest_dir.join("../build/.config");

    println!("cargo:rerun-if-changed={}", kernel_toml.display());
    println!("cargo:rerun-if-changed={}", dot_config.display());

    // 优先使用 menuconfig 生成的 build/.config，回退到 Kernel.toml
    let config = if let Ok(content) = fs::read_to_string(&dot_config) {
        println!("cargo:warning=Using build/.config configuration");
        parse_dot_config(&content)
    } else if let Ok(content) = fs::read_to_string(&kernel_toml) {
        toml::from_str(&content).expect("Kernel.toml 解析失败")
    } else {
        // 没有配置文件时全部使用默认值
        toml::Value::Table(toml::map::Map::new())
    };

    let name = get_str(&config, "general", "name", "Rux");
    let version = get_str(&config, "general", "version", "0.1.0");
    println!("cargo:rustc-env=CARGO_KERNEL_NAME={}", name);
    println!("cargo:rustc-env=CARGO_KERNEL_VERSION={}", version);

    generate_config_code(&config, &manifest_dir);
}

fn generate_config_code(config: &toml::Value, manifest_dir: &PathBuf) {
    let buckets = get_int(config, "callout", "buckets", 64);
    if buckets <= 0 || (buckets & (buckets - 1)) != 0 {
        panic!("callout.buckets 必须是 2 的幂");
    }

    let code = format!(
        r#"//! Rux 调度核心配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 内核名称
pub const KERNEL_NAME: &str = "{}";

/// 内核版本
pub const KERNEL_VERSION: &str = "{}";

// ============================================================
// 调度器配置
// ============================================================

/// 时间片滴答数
pub const TIME_SLICE_TICKS: i32 = {};

/// 时钟频率（每秒滴答数）
pub const HZ: u64 = {};

/// 线程 ID 上限
pub const TID_MAX: u32 = {};

/// 线程名最大长度
pub const THREAD_NAME_MAX: usize = {};

// ============================================================
// 同步原语配置
// ============================================================

/// 睡眠队列哈希链数量
pub const SLEEPQ_CHAINS: usize = {};

/// turnstile 哈希链数量
pub const TURNSTILE_CHAINS: usize = {};

// ============================================================
// 定时器配置
// ============================================================

/// callout 时间轮桶数量
pub const CALLOUT_BUCKETS: usize = {};
"#,
        get_str(config, "general", "name", "Rux"),
        get_str(config, "general", "version", "0.1.0"),
        get_int(config, "scheduler", "time_slice_ticks", 10),
        get_int(config, "scheduler", "hz", 1000),
        get_int(config, "scheduler", "tid_max", 32768),
        get_int(config, "scheduler", "thread_name_max", 32),
        get_int(config, "sync", "sleepq_chains", 256),
        get_int(config, "sync", "turnstile_chains", 256),
        buckets,
    );

    // 内容不变时不重写，避免触发无意义的重新编译
    let config_path = manifest_dir.join("src/config.rs");
    if fs::read_to_string(&config_path).ok().as_deref() != Some(code.as_str()) {
        fs::write(&config_path, code).expect("无法写入 src/config.rs");
    }
}
