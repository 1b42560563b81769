//! 命令实现

pub mod run;
pub mod send;

pub use run::RunCommand;
pub use send::SendCommand;

use anyhow::{Context, Result};
use fieldlink_driver::FleetDescription;
use std::path::Path;

/// 加载并校验设备群描述
pub fn load_fleet(path: &Path) -> Result<FleetDescription> {
    FleetDescription::load(path).with_context(|| format!("加载设备群描述失败: {}", path.display()))
}
