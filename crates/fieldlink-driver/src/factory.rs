//! 指令集工厂
//!
//! 管理器按 `InstructionSetDescription::factory` 查找工厂构建设备的指令集。
//! 内置 `"frame"` 工厂，把配置中的指令条目转换为 [`FrameInstruction`]。

use crate::config::InstructionSetDescription;
use crate::error::{ConfigError, DriverError};
use crate::frame_instruction::FrameInstruction;
use crate::instruction::Instruction;
use crate::instruction_set::InstructionSet;
use std::sync::Arc;
use std::time::Duration;

/// 指令集工厂
pub trait InstructionSetFactory: Send + Sync {
    /// 为设备构建指令集
    fn build(
        &self,
        device: &str,
        description: &InstructionSetDescription,
    ) -> Result<InstructionSet, DriverError>;
}

impl<F> InstructionSetFactory for F
where
    F: Fn(&str, &InstructionSetDescription) -> Result<InstructionSet, DriverError> + Send + Sync,
{
    fn build(
        &self,
        device: &str,
        description: &InstructionSetDescription,
    ) -> Result<InstructionSet, DriverError> {
        self(device, description)
    }
}

/// 内置帧协议工厂
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameSetFactory;

impl InstructionSetFactory for FrameSetFactory {
    fn build(
        &self,
        device: &str,
        description: &InstructionSetDescription,
    ) -> Result<InstructionSet, DriverError> {
        let layout = description
            .layout
            .to_layout()
            .map_err(|e| ConfigError::InvalidInstruction {
                name: format!("{}/layout", device),
                reason: e.to_string(),
            })?;
        let instructions = description
            .instructions
            .iter()
            .map(|entry| {
                let mut instruction = FrameInstruction::new(&entry.name, layout, entry.command)
                    .version(entry.version)
                    .expects_reply(entry.expects_reply)
                    .check_frame_id(entry.check_frame_id);
                if let Some(ms) = entry.timeout_ms {
                    instruction = instruction.timeout(Duration::from_millis(ms));
                }
                Arc::new(instruction) as Arc<dyn Instruction>
            })
            .collect();
        Ok(InstructionSet::new(device, layout, instructions))
    }
}
