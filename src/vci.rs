//! ControlCAN-style vendor DLL transport.
//!
//! Binds the `VCI_*` entry points of a ControlCAN-compatible dynamic
//! library and exposes the device behind [`CanTransport`]. The vendor API
//! has no readiness primitive, so `wait_readable` polls the device's
//! pending-frame counter with a short sleep, interruptible via the wake
//! flag.

use libloading::Library;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::CanError;
use crate::frame::{CanFrame, CanReceiveData};
use crate::transport::{CanTransport, WaitStatus};

const VCI_SUCCESS: i32 = 1;
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[repr(C)]
#[derive(Debug, Default, Clone)]
pub struct VciCanObj {
    pub id: u32,
    pub time_stamp: u32,
    pub time_flag: u8,
    pub send_type: u8,
    pub remote_flag: u8,
    pub extern_flag: u8,
    pub data_len: u8,
    pub data: [u8; 8],
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Debug, Default)]
pub struct VciInitConfig {
    pub acc_code: u32,
    pub acc_mask: u32,
    pub reserved: u32,
    pub filter: u8,
    pub timing0: u8,
    pub timing1: u8,
    pub mode: u8,
}

/// Function-pointer table over the vendor library. The `Library` is kept
/// alive for as long as any pointer may be called.
pub struct VciLibrary {
    _lib: Library,
    vci_open_device: unsafe extern "C" fn(u32, u32, u32) -> i32,
    vci_close_device: unsafe extern "C" fn(u32, u32) -> i32,
    vci_init_can: unsafe extern "C" fn(u32, u32, u32, *const VciInitConfig) -> i32,
    vci_start_can: unsafe extern "C" fn(u32, u32, u32) -> i32,
    vci_receive: unsafe extern "C" fn(u32, u32, u32, *mut VciCanObj, u32, i32) -> i32,
    vci_transmit: unsafe extern "C" fn(u32, u32, u32, *const VciCanObj, u32) -> i32,
    vci_get_receive_num: unsafe extern "C" fn(u32, u32, u32) -> i32,
}

impl VciLibrary {
    pub fn load(dll_name: &str) -> Result<Arc<Self>, CanError> {
        let lib = unsafe { Library::new(dll_name) }
            .map_err(|e| CanError::Transport(format!("cannot load {dll_name}: {e}")))?;
        macro_rules! symbol {
            ($name:literal) => {
                *unsafe { lib.get($name) }.map_err(|e| {
                    CanError::Transport(format!(
                        "missing symbol {}: {e}",
                        String::from_utf8_lossy($name)
                    ))
                })?
            };
        }
        let vci_open_device = symbol!(b"VCI_OpenDevice");
        let vci_close_device = symbol!(b"VCI_CloseDevice");
        let vci_init_can = symbol!(b"VCI_InitCAN");
        let vci_start_can = symbol!(b"VCI_StartCAN");
        let vci_receive = symbol!(b"VCI_Receive");
        let vci_transmit = symbol!(b"VCI_Transmit");
        let vci_get_receive_num = symbol!(b"VCI_GetReceiveNum");
        Ok(Arc::new(Self {
            _lib: lib,
            vci_open_device,
            vci_close_device,
            vci_init_can,
            vci_start_can,
            vci_receive,
            vci_transmit,
            vci_get_receive_num,
        }))
    }
}

/// One opened channel of a ControlCAN device.
pub struct VciTransport {
    lib: Arc<VciLibrary>,
    dev_type: u32,
    dev_index: u32,
    channel: u32,
    wake_flag: AtomicBool,
}

impl VciTransport {
    /// Open the device, initialize the channel with the given bit-timing
    /// register pair, and start it.
    pub fn open(
        lib: Arc<VciLibrary>,
        dev_type: u32,
        dev_index: u32,
        channel: u32,
        timing: (u8, u8),
    ) -> Result<Arc<Self>, CanError> {
        let status = unsafe { (lib.vci_open_device)(dev_type, dev_index, 0) };
        if status != VCI_SUCCESS {
            return Err(CanError::Transport(format!(
                "device open failed, status {status}"
            )));
        }
        let config = VciInitConfig {
            acc_code: 0,
            acc_mask: 0xFFFF_FFFF,
            reserved: 0,
            filter: 1,
            timing0: timing.0,
            timing1: timing.1,
            mode: 0,
        };
        let status = unsafe { (lib.vci_init_can)(dev_type, dev_index, channel, &config) };
        if status != VCI_SUCCESS {
            unsafe { (lib.vci_close_device)(dev_type, dev_index) };
            return Err(CanError::Transport(format!(
                "channel {channel} init failed, status {status}"
            )));
        }
        let status = unsafe { (lib.vci_start_can)(dev_type, dev_index, channel) };
        if status != VCI_SUCCESS {
            unsafe { (lib.vci_close_device)(dev_type, dev_index) };
            return Err(CanError::Transport(format!(
                "channel {channel} start failed, status {status}"
            )));
        }
        Ok(Arc::new(Self {
            lib,
            dev_type,
            dev_index,
            channel,
            wake_flag: AtomicBool::new(false),
        }))
    }

    fn pending_frames(&self) -> i32 {
        unsafe { (self.lib.vci_get_receive_num)(self.dev_type, self.dev_index, self.channel) }
    }

    fn decode(obj: &VciCanObj) -> Result<CanReceiveData, CanError> {
        let extended = obj.extern_flag != 0;
        let frame = if obj.remote_flag != 0 {
            CanFrame::new_remote(obj.id, extended, obj.data_len)?
        } else {
            let len = (obj.data_len as usize).min(obj.data.len());
            CanFrame::new(obj.id, extended, &obj.data[..len])?
        };
        // Device timestamps tick in 0.1 ms units when time_flag is set.
        let timestamp = if obj.time_flag != 0 {
            Duration::from_micros(obj.time_stamp as u64 * 100)
        } else {
            Duration::ZERO
        };
        Ok(CanReceiveData::with_timestamp(frame, timestamp))
    }

    fn encode(frame: &CanFrame) -> Result<VciCanObj, CanError> {
        if frame.is_fd() {
            return Err(CanError::NotSupported(
                "CAN-FD frames on a ControlCAN device",
            ));
        }
        let mut obj = VciCanObj {
            id: frame.id(),
            remote_flag: frame.is_remote() as u8,
            extern_flag: frame.is_extended() as u8,
            data_len: frame.dlc(),
            ..VciCanObj::default()
        };
        obj.data[..frame.data().len()].copy_from_slice(frame.data());
        Ok(obj)
    }
}

impl CanTransport for VciTransport {
    fn wait_readable(&self, timeout: Duration) -> Result<WaitStatus, CanError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.wake_flag.swap(false, Ordering::SeqCst) {
                return Ok(WaitStatus::TimedOut);
            }
            let pending = self.pending_frames();
            if pending < 0 {
                return Err(CanError::Transport(format!(
                    "receive counter query failed, status {pending}"
                )));
            }
            if pending > 0 {
                return Ok(WaitStatus::Ready);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitStatus::TimedOut);
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    fn wake(&self) {
        self.wake_flag.store(true, Ordering::SeqCst);
    }

    fn drain_batch(&self, max: usize) -> Result<Vec<CanReceiveData>, CanError> {
        let mut buffer = vec![VciCanObj::default(); max];
        // Timeout 0: return only what is already buffered in the device.
        let received = unsafe {
            (self.lib.vci_receive)(
                self.dev_type,
                self.dev_index,
                self.channel,
                buffer.as_mut_ptr(),
                max as u32,
                0,
            )
        };
        if received < 0 {
            return Err(CanError::Transport(format!(
                "receive failed, status {received}"
            )));
        }
        buffer
            .iter()
            .take(received as usize)
            .map(Self::decode)
            .collect()
    }

    fn write_frame(&self, frame: &CanFrame) -> Result<(), CanError> {
        let obj = Self::encode(frame)?;
        let sent = unsafe {
            (self.lib.vci_transmit)(self.dev_type, self.dev_index, self.channel, &obj, 1)
        };
        if sent != 1 {
            return Err(CanError::Transport(format!(
                "transmit failed, status {sent}"
            )));
        }
        Ok(())
    }
}

impl Drop for VciTransport {
    fn drop(&mut self) {
        unsafe {
            (self.lib.vci_close_device)(self.dev_type, self.dev_index);
        }
    }
}
