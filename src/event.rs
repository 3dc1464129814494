//! Events delivered by the sanitizer runtime.
//!
//! The event bus serializes callbacks; an event is never delivered while a
//! trace batch is in flight. Tools consume the subset of events they care
//! about and ignore the rest.

use crate::model::MemAccessRecord;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelLaunch {
    pub kernel_name: String,
    pub device_id: i32,
    pub kernel_pc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelEnd {
    pub kernel_name: String,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemAlloc {
    pub addr: u64,
    pub size: u64,
    pub alloc_type: i32,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemFree {
    pub addr: u64,
    pub size: u64,
    pub alloc_type: i32,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemCopy {
    pub dst_addr: u64,
    pub src_addr: u64,
    pub size: u64,
    pub is_async: bool,
    pub direction: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemSet {
    pub addr: u64,
    pub size: u64,
    pub value: u32,
    pub is_async: bool,
}

/// Tensor-allocator allocation. Treated exactly like [`MemAlloc`] for
/// region and shadow-arena bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenAlloc {
    pub addr: u64,
    pub size: i64,
    pub total_allocated: i64,
    pub total_reserved: i64,
    pub device_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenFree {
    pub addr: u64,
    pub size: i64,
    pub total_allocated: i64,
    pub total_reserved: i64,
    pub device_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpStart {
    pub op_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpEnd {
    pub op_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    KernelLaunch(KernelLaunch),
    KernelEnd(KernelEnd),
    MemAlloc(MemAlloc),
    MemFree(MemFree),
    MemCopy(MemCopy),
    MemSet(MemSet),
    TenAlloc(TenAlloc),
    TenFree(TenFree),
    OpStart(OpStart),
    OpEnd(OpEnd),
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::KernelLaunch(_) => "kernel_launch",
            Self::KernelEnd(_) => "kernel_end",
            Self::MemAlloc(_) => "mem_alloc",
            Self::MemFree(_) => "mem_free",
            Self::MemCopy(_) => "mem_copy",
            Self::MemSet(_) => "mem_set",
            Self::TenAlloc(_) => "ten_alloc",
            Self::TenFree(_) => "ten_free",
            Self::OpStart(_) => "op_start",
            Self::OpEnd(_) => "op_end",
        }
    }
}

/// One analysis tool on the event bus.
///
/// The PC-dependency engine is one variant among several peer tools that
/// share the same ingestion surface; which one runs is selected by
/// [`ToolKind`] at engine construction.
pub trait Tool {
    /// Handle one event. Events the tool does not care about are ignored.
    fn on_event(&mut self, event: Event);

    /// Analyze one trace batch.
    fn on_batch(&mut self, records: &[MemAccessRecord]) -> color_eyre::eyre::Result<()>;

    /// Flush any remaining state to the output sinks.
    fn on_flush(&mut self) -> color_eyre::eyre::Result<()>;
}

/// Compile-time tool selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolKind {
    #[default]
    PcDependency,
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PcDependency => write!(f, "pc_dependency_analysis"),
        }
    }
}
