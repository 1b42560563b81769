//! run 命令

use super::load_fleet;
use anyhow::{Context, Result};
use clap::Args;
use fieldlink_driver::{DriverManager, PoolMetricsSnapshot};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 运行设备群
#[derive(Args, Debug)]
pub struct RunCommand {
    /// 设备群描述文件（TOML）
    pub fleet: PathBuf,

    /// 只校验配置，不打开链路
    #[arg(long)]
    pub check: bool,

    /// 指标日志周期（秒，0 表示不输出）
    #[arg(long, default_value_t = 0)]
    pub metrics_interval: u64,

    /// 退出时以 JSON 打印各设备指标
    #[arg(long)]
    pub json: bool,
}

impl RunCommand {
    pub fn execute(self) -> Result<()> {
        let fleet = load_fleet(&self.fleet)?;
        if self.check {
            println!(
                "{}: {} devices OK",
                self.fleet.display(),
                fleet.devices.len()
            );
            for device in &fleet.devices {
                println!(
                    "  {:<16} {:<40} {} instructions{}",
                    device.name,
                    device.channel.key(),
                    device.instruction_set.instructions.len(),
                    if device.enabled { "" } else { " (disabled)" }
                );
            }
            return Ok(());
        }

        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        ctrlc::set_handler(move || {
            r.store(false, Ordering::SeqCst);
        })
        .context("安装 Ctrl-C 处理器失败")?;

        let manager = DriverManager::new(fleet);
        manager.on_status_changed(|change| {
            info!("{}: {} -> {}", change.device, change.old, change.new);
        });
        manager.open().context("打开设备群失败")?;
        info!("Running {} devices, press Ctrl-C to stop", manager.devices().len());

        let interval = Duration::from_secs(self.metrics_interval);
        let mut last_report = Instant::now();
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
            if !interval.is_zero() && last_report.elapsed() >= interval {
                last_report = Instant::now();
                for (device, snapshot) in collect_metrics(&manager) {
                    info!(
                        "{}: executed={} failed={:.1}% rejected={:.1}% discarded={}",
                        device,
                        snapshot.executed,
                        snapshot.failure_rate(),
                        snapshot.rejection_rate(),
                        snapshot.discarded
                    );
                }
            }
        }

        let metrics = collect_metrics(&manager);
        manager.close();
        if self.json {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        } else if metrics.values().any(|m| m.failed > 0) {
            warn!("Some devices reported failures during this run");
        }
        Ok(())
    }
}

fn collect_metrics(manager: &DriverManager) -> BTreeMap<String, PoolMetricsSnapshot> {
    manager
        .devices()
        .iter()
        .filter_map(|device| {
            let pool = manager.pool(device.name())?;
            Some((device.name().to_string(), pool.metrics().snapshot()))
        })
        .collect()
}
