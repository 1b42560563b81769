//! 指令集
//!
//! 静态指令在构造时确定；动态指令以"覆盖层"形式整体替换，不原地修改。
//!
//! 每次替换覆盖层都会递增代数（generation），旧覆盖层移入回收列表。
//! 执行中的指令持有 [`ExecutionGuard`]，记录它开始时所在的覆盖层；
//! 回收时只释放没有执行中指令的旧覆盖层。回收每 6 秒检查一次。

use crate::instruction::{Instruction, InstructionSession};
use arc_swap::ArcSwapOption;
use fieldlink_protocol::FrameLayout;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// 旧覆盖层回收周期
pub const RECLAIM_INTERVAL: Duration = Duration::from_secs(6);

/// 动态指令覆盖层
struct Overlay {
    generation: u64,
    instructions: Vec<Arc<dyn Instruction>>,
    in_flight: AtomicUsize,
}

impl Overlay {
    fn find(&self, name: &str) -> Option<&Arc<dyn Instruction>> {
        self.instructions.iter().find(|i| i.name() == name)
    }
}

/// 执行凭证
///
/// 存活期间，所属覆盖层不会被回收。静态指令的凭证不关联任何覆盖层。
pub struct ExecutionGuard {
    overlay: Option<Arc<Overlay>>,
}

impl ExecutionGuard {
    pub(crate) fn detached() -> Self {
        Self { overlay: None }
    }

    fn enter(overlay: Arc<Overlay>) -> Self {
        overlay.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            overlay: Some(overlay),
        }
    }

    /// 开始执行时的覆盖层代数（静态指令为 `None`）
    pub fn generation(&self) -> Option<u64> {
        self.overlay.as_ref().map(|o| o.generation)
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if let Some(overlay) = &self.overlay {
            overlay.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// 指令集
pub struct InstructionSet {
    name: String,
    layout: FrameLayout,
    instructions: Vec<Arc<dyn Instruction>>,
    dynamic: ArcSwapOption<Overlay>,
    /// 已替换、可能仍在执行中的覆盖层；同时串行化覆盖层替换
    retired: Mutex<Vec<Arc<Overlay>>>,
    generation: AtomicU64,
    last_reclaim: Mutex<Instant>,
    reclaim_interval: Duration,
}

impl InstructionSet {
    pub fn new(
        name: impl Into<String>,
        layout: FrameLayout,
        instructions: Vec<Arc<dyn Instruction>>,
    ) -> Self {
        Self {
            name: name.into(),
            layout,
            instructions,
            dynamic: ArcSwapOption::empty(),
            retired: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            last_reclaim: Mutex::new(Instant::now()),
            reclaim_interval: RECLAIM_INTERVAL,
        }
    }

    /// 修改回收周期（默认 [`RECLAIM_INTERVAL`]）
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 帧布局（设备按它重组入站字节流）
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// 静态 + 动态指令名
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instructions.iter().map(|i| i.name().to_string()).collect();
        if let Some(overlay) = self.dynamic.load_full() {
            names.extend(overlay.instructions.iter().map(|i| i.name().to_string()));
        }
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// 按名称查找，静态优先
    pub fn find(&self, name: &str) -> Option<(Arc<dyn Instruction>, ExecutionGuard)> {
        if let Some(instruction) = self.instructions.iter().find(|i| i.name() == name) {
            return Some((instruction.clone(), ExecutionGuard::detached()));
        }
        let overlay = self.dynamic.load_full()?;
        let instruction = overlay.find(name)?.clone();
        Some((instruction, ExecutionGuard::enter(overlay)))
    }

    /// 找出第一条匹配该帧的指令：先静态，再动态
    pub fn match_frame(
        &self,
        session: &InstructionSession,
        frame: &[u8],
    ) -> Option<(Arc<dyn Instruction>, ExecutionGuard)> {
        if let Some(instruction) = self.instructions.iter().find(|i| i.matches(session, frame)) {
            return Some((instruction.clone(), ExecutionGuard::detached()));
        }
        let overlay = self.dynamic.load_full()?;
        let instruction = overlay
            .instructions
            .iter()
            .find(|i| i.matches(session, frame))?
            .clone();
        Some((instruction, ExecutionGuard::enter(overlay)))
    }

    /// 追加动态指令（同名替换），返回新覆盖层的代数
    pub fn add_dynamic(&self, instructions: Vec<Arc<dyn Instruction>>) -> u64 {
        let mut retired = self.retired.lock();
        let mut merged: Vec<Arc<dyn Instruction>> = self
            .dynamic
            .load_full()
            .map(|o| o.instructions.clone())
            .unwrap_or_default();
        for instruction in instructions {
            merged.retain(|i| i.name() != instruction.name());
            merged.push(instruction);
        }
        self.swap_overlay(&mut retired, Some(merged))
    }

    /// 整体替换动态指令
    pub fn set_dynamic(&self, instructions: Vec<Arc<dyn Instruction>>) -> u64 {
        let mut retired = self.retired.lock();
        self.swap_overlay(&mut retired, Some(instructions))
    }

    /// 清除动态指令
    ///
    /// 旧覆盖层进入回收列表，执行中的指令不受影响。
    pub fn clear_dynamic_instructions(&self) -> u64 {
        let mut retired = self.retired.lock();
        self.swap_overlay(&mut retired, None)
    }

    fn swap_overlay(
        &self,
        retired: &mut Vec<Arc<Overlay>>,
        instructions: Option<Vec<Arc<dyn Instruction>>>,
    ) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let next = instructions.map(|instructions| {
            Arc::new(Overlay {
                generation,
                instructions,
                in_flight: AtomicUsize::new(0),
            })
        });
        if let Some(old) = self.dynamic.swap(next) {
            debug!(
                "{}: overlay generation {} retired ({} instructions)",
                self.name,
                old.generation,
                old.instructions.len()
            );
            retired.push(old);
        }
        if self.last_reclaim.lock().elapsed() >= self.reclaim_interval {
            self.reclaim_locked(retired);
        }
        generation
    }

    /// 当前动态指令数
    pub fn dynamic_len(&self) -> usize {
        self.dynamic
            .load_full()
            .map(|o| o.instructions.len())
            .unwrap_or(0)
    }

    /// 等待回收的旧覆盖层数
    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// 当前覆盖层代数
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// 立即回收没有执行中指令的旧覆盖层，返回回收数量
    pub fn reclaim(&self) -> usize {
        let mut retired = self.retired.lock();
        self.reclaim_locked(&mut retired)
    }

    fn reclaim_locked(&self, retired: &mut Vec<Arc<Overlay>>) -> usize {
        let before = retired.len();
        retired.retain(|overlay| overlay.in_flight.load(Ordering::Acquire) > 0);
        *self.last_reclaim.lock() = Instant::now();
        let freed = before - retired.len();
        if freed > 0 {
            debug!("{}: reclaimed {} retired overlays", self.name, freed);
        }
        freed
    }

    /// 距上次回收超过回收周期时回收
    ///
    /// 指令池每个周期调用；没有指令池的设备在收发时调用。
    pub fn maybe_reclaim(&self) -> usize {
        if self.last_reclaim.lock().elapsed() < self.reclaim_interval {
            return 0;
        }
        self.reclaim()
    }

    /// 复制出独立的指令集（只含静态指令，动态状态不共享）
    pub fn fork(&self) -> InstructionSet {
        InstructionSet::new(
            self.name.clone(),
            self.layout,
            self.instructions.iter().map(|i| i.duplicate()).collect(),
        )
        .with_reclaim_interval(self.reclaim_interval)
    }
}
