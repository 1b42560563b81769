//! send 命令

use super::load_fleet;
use anyhow::{Context, Result, bail};
use clap::Args;
use fieldlink_driver::{
    DriverManager, InstructionContext, InstructionDescription, KEY_PAYLOAD, KEY_REPLY, Value,
};
use std::path::PathBuf;
use std::time::Duration;

/// 发送单条指令
#[derive(Args, Debug)]
pub struct SendCommand {
    /// 设备群描述文件（TOML）
    pub fleet: PathBuf,

    /// 设备名
    pub device: String,

    /// 指令名
    pub instruction: String,

    /// 请求负载（十六进制）
    #[arg(short, long, default_value = "")]
    pub payload: String,

    /// 应答超时（毫秒）
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,
}

impl SendCommand {
    pub fn execute(self) -> Result<()> {
        let payload = hex::decode(self.payload.trim()).context("负载不是有效的十六进制")?;
        let fleet = load_fleet(&self.fleet)?;
        if fleet.device(&self.device).is_none() {
            bail!("设备不存在: {}", self.device);
        }

        let manager = DriverManager::new(fleet);
        manager.open().context("打开设备群失败")?;

        let mut description = InstructionDescription::new(self.instruction.as_str())
            .with_context(InstructionContext::new().with(KEY_PAYLOAD, payload));
        if let Some(ms) = self.timeout_ms {
            description = description.with_timeout(Duration::from_millis(ms));
        }
        let result = manager.execute(&self.device, description);
        manager.close();

        let Some(context) = result? else {
            bail!("{} 未在超时内应答", self.device);
        };
        if let Some(exception) = context.exception() {
            bail!(
                "设备返回错误状态 0x{:02X}: {}",
                exception.code,
                exception.message
            );
        }
        match context.get(KEY_REPLY) {
            Some(Value::Bytes(reply)) => println!("{}", hex::encode(reply)),
            Some(other) => println!("{:?}", other),
            None => println!("(no reply)"),
        }
        Ok(())
    }
}
