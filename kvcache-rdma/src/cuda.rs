//! CUDA IPC handles for same-host transfers.
//!
//! The store opens the handle in its own process and copies directly
//! to or from the caller's device memory.

#![cfg(feature = "cuda")]

use cudarc::driver::sys;
use kvcache::protocol::{IPC_HANDLE_SIZE, IpcMemHandle};
use kvcache::{KvError, Result};
use std::sync::Arc;

/// Exports device allocations on one GPU as IPC handles.
pub struct CudaIpc {
    ctx: Arc<cudarc::driver::CudaContext>,
}

impl CudaIpc {
    pub fn new(device_ordinal: u32) -> Result<Self> {
        let ctx = cudarc::driver::CudaContext::new(device_ordinal as usize).map_err(|e| {
            KvError::device(format!(
                "failed to create CUDA context for GPU {device_ordinal}: {e}"
            ))
        })?;
        Ok(Self { ctx })
    }

    /// IPC handle for the allocation containing `device_ptr`.
    ///
    /// # Safety
    ///
    /// `device_ptr` must point into a live allocation made with
    /// `cuMemAlloc` on this device.
    pub unsafe fn ipc_handle_for(&self, device_ptr: u64) -> Result<IpcMemHandle> {
        self.bind()?;
        let mut raw: sys::CUipcMemHandle = unsafe { std::mem::zeroed() };
        unsafe { sys::cuIpcGetMemHandle(&mut raw, device_ptr as sys::CUdeviceptr) }
            .result()
            .map_err(|e| KvError::device(format!("cuIpcGetMemHandle({device_ptr:#x}) failed: {e}")))?;

        let mut handle = [0u8; IPC_HANDLE_SIZE];
        for (dst, src) in handle.iter_mut().zip(raw.reserved.iter()) {
            *dst = *src as u8;
        }
        Ok(IpcMemHandle(handle))
    }

    /// Base address and size of the allocation containing `device_ptr`.
    /// Block offsets sent with an IPC handle are relative to this base.
    ///
    /// # Safety
    ///
    /// Same requirement as [`ipc_handle_for`](Self::ipc_handle_for).
    pub unsafe fn allocation_range(&self, device_ptr: u64) -> Result<(u64, usize)> {
        self.bind()?;
        let mut base: sys::CUdeviceptr = 0;
        let mut size: usize = 0;
        unsafe {
            sys::cuMemGetAddressRange_v2(&mut base, &mut size, device_ptr as sys::CUdeviceptr)
        }
        .result()
        .map_err(|e| {
            KvError::device(format!("cuMemGetAddressRange({device_ptr:#x}) failed: {e}"))
        })?;
        Ok((base as u64, size))
    }

    fn bind(&self) -> Result<()> {
        self.ctx
            .bind_to_thread()
            .map_err(|e| KvError::device(format!("CUDA bind_to_thread failed: {e}")))
    }
}
