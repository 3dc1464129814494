//! C-style ingestion entry points.
//!
//! The sanitizer runtime drives one process-wide engine through thin free
//! functions. Callbacks are serialized by the caller: no callback may
//! interleave with an in-flight [`gpu_data_analysis`] call.

use crate::config::Options;
use crate::engine::PcDependencyEngine;
use crate::event::{
    Event, KernelEnd, KernelLaunch, MemAlloc, MemCopy, MemFree, MemSet, OpEnd, OpStart, TenAlloc,
    TenFree, Tool,
};
use crate::model::MemAccessRecord;
use crate::sync::Mutex;
use once_cell::sync::Lazy;

/// Catalogued result of one ingestion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    Error = 1,
    NotImplemented = 2,
    /// `cudaFree(nullptr)` is a no-op upstream; reported, not an error.
    FreeNullPointer = 3,
}

static ENGINE: Lazy<Mutex<Option<PcDependencyEngine>>> = Lazy::new(|| Mutex::new(None));

/// Create the process-wide engine. Idempotent: a live engine is kept.
pub fn init(options: Options) -> ResultCode {
    let mut engine = ENGINE.lock();
    if engine.is_some() {
        log::warn!("engine already initialized");
        return ResultCode::Success;
    }
    match PcDependencyEngine::new(options) {
        Ok(new_engine) => {
            *engine = Some(new_engine);
            ResultCode::Success
        }
        Err(err) => {
            log::error!("engine initialization failed: {err}");
            ResultCode::Error
        }
    }
}

/// [`init`] with options read from the environment.
pub fn init_from_env() -> ResultCode {
    init(Options::from_env())
}

/// Flush and tear down the process-wide engine.
pub fn terminate() -> ResultCode {
    let mut engine = ENGINE.lock();
    match engine.take() {
        Some(mut engine) => match engine.on_flush() {
            Ok(()) => ResultCode::Success,
            Err(err) => {
                log::error!("flush on terminate failed: {err}");
                ResultCode::Error
            }
        },
        None => {
            log::warn!("terminate without a live engine");
            ResultCode::Error
        }
    }
}

fn dispatch(event: Event) -> ResultCode {
    match &mut *ENGINE.lock() {
        Some(engine) => {
            engine.on_event(event);
            ResultCode::Success
        }
        None => {
            log::warn!("dropping {} event: engine not initialized", event.kind());
            ResultCode::Error
        }
    }
}

pub fn alloc_callback(ptr: u64, size: u64, alloc_type: i32, device_id: i32) -> ResultCode {
    dispatch(Event::MemAlloc(MemAlloc {
        addr: ptr,
        size,
        alloc_type,
        device_id,
    }))
}

pub fn free_callback(ptr: u64, size: u64, alloc_type: i32, device_id: i32) -> ResultCode {
    if ptr == 0 {
        return ResultCode::FreeNullPointer;
    }
    dispatch(Event::MemFree(MemFree {
        addr: ptr,
        size,
        alloc_type,
        device_id,
    }))
}

pub fn memcpy_callback(
    dst: u64,
    src: u64,
    size: u64,
    is_async: bool,
    direction: u32,
) -> ResultCode {
    dispatch(Event::MemCopy(MemCopy {
        dst_addr: dst,
        src_addr: src,
        size,
        is_async,
        direction,
    }))
}

pub fn memset_callback(dst: u64, size: u64, value: u32, is_async: bool) -> ResultCode {
    dispatch(Event::MemSet(MemSet {
        addr: dst,
        size,
        value,
        is_async,
    }))
}

pub fn kernel_launch_callback(kernel_name: &str, device_id: i32, kernel_pc: u64) -> ResultCode {
    dispatch(Event::KernelLaunch(KernelLaunch {
        kernel_name: kernel_name.to_string(),
        device_id,
        kernel_pc,
    }))
}

pub fn kernel_end_callback(kernel_name: &str, device_id: i32) -> ResultCode {
    dispatch(Event::KernelEnd(KernelEnd {
        kernel_name: kernel_name.to_string(),
        device_id,
    }))
}

pub fn tensor_malloc_callback(
    ptr: u64,
    alloc_size: i64,
    total_allocated: i64,
    total_reserved: i64,
    device_id: i32,
) -> ResultCode {
    dispatch(Event::TenAlloc(TenAlloc {
        addr: ptr,
        size: alloc_size,
        total_allocated,
        total_reserved,
        device_id,
    }))
}

pub fn tensor_free_callback(
    ptr: u64,
    alloc_size: i64,
    total_allocated: i64,
    total_reserved: i64,
    device_id: i32,
) -> ResultCode {
    dispatch(Event::TenFree(TenFree {
        addr: ptr,
        size: alloc_size,
        total_allocated,
        total_reserved,
        device_id,
    }))
}

pub fn operator_start_callback(op_name: &str) -> ResultCode {
    dispatch(Event::OpStart(OpStart {
        op_name: op_name.to_string(),
    }))
}

pub fn operator_end_callback(op_name: &str) -> ResultCode {
    dispatch(Event::OpEnd(OpEnd {
        op_name: op_name.to_string(),
    }))
}

/// Analyze one trace batch handed over as a borrowed record slice.
pub fn analyze(records: &[MemAccessRecord]) -> ResultCode {
    match &mut *ENGINE.lock() {
        Some(engine) => match engine.on_batch(records) {
            Ok(()) => ResultCode::Success,
            Err(err) => {
                log::error!("batch analysis failed: {err}");
                ResultCode::Error
            }
        },
        None => {
            log::warn!("dropping trace batch: engine not initialized");
            ResultCode::Error
        }
    }
}

/// Analyze one trace batch delivered as a raw buffer.
///
/// # Safety
///
/// `data` must point to `record_count` valid, properly aligned
/// [`MemAccessRecord`]s that stay alive and untouched until this call
/// returns.
pub unsafe fn gpu_data_analysis(data: *const MemAccessRecord, record_count: u64) -> ResultCode {
    if data.is_null() {
        log::error!("null trace buffer");
        return ResultCode::Error;
    }
    let records = unsafe { std::slice::from_raw_parts(data, record_count as usize) };
    analyze(records)
}

/// Range queries are served by sibling tools, not by this one.
pub fn query_active_ranges() -> ResultCode {
    ResultCode::NotImplemented
}

pub fn query_active_tensors() -> ResultCode {
    ResultCode::NotImplemented
}
