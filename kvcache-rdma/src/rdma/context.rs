//! Verbs resources shared by one connection: device, protection domain,
//! completion channel and completion queue.

use kvcache::{ClientConfig, KvError, Result};
use std::ffi::CStr;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::ptr;

/// Port attributes captured when the context is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub lid: u16,
    /// `ibv_mtu` enum value.
    pub active_mtu: u32,
    pub gid_tbl_len: i32,
}

struct Device(*mut ibverbs_sys::ibv_context);

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_close_device(self.0);
        }
    }
}

struct ProtectionDomain(*mut ibverbs_sys::ibv_pd);

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_dealloc_pd(self.0);
        }
    }
}

struct CompChannel(*mut ibverbs_sys::ibv_comp_channel);

impl Drop for CompChannel {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_comp_channel(self.0);
        }
    }
}

struct CompletionQueue(*mut ibverbs_sys::ibv_cq);

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            ibverbs_sys::ibv_destroy_cq(self.0);
        }
    }
}

/// Device-level resources of one connection.
///
/// Fields drop in declaration order, so the CQ goes before its channel and
/// everything goes before the device. Queue pairs and memory regions hold an
/// `Arc` to this context and are always released first.
pub struct RdmaContext {
    cq: CompletionQueue,
    channel: CompChannel,
    pd: ProtectionDomain,
    device: Device,
    dev_name: String,
    ib_port: u8,
    port: PortInfo,
    gid_index: u8,
    gid: [u8; 16],
}

unsafe impl Send for RdmaContext {}
unsafe impl Sync for RdmaContext {}

impl RdmaContext {
    /// Open the configured device and allocate PD, channel and CQ.
    ///
    /// The CQ holds `max_outstanding + recv_depth` entries so a full send
    /// queue and a full receive queue can complete together.
    pub fn open(config: &ClientConfig) -> Result<Self> {
        let (device, dev_name) = open_device(config.dev_name.as_deref())?;

        let pd = unsafe { ibverbs_sys::ibv_alloc_pd(device.0) };
        if pd.is_null() {
            return Err(KvError::device(format!("{dev_name}: ibv_alloc_pd failed")));
        }
        let pd = ProtectionDomain(pd);

        let port = query_port(device.0, config.ib_port)
            .map_err(|e| KvError::device(format!("{dev_name}: {e}")))?;
        let (gid_index, gid) = select_gid(device.0, config.ib_port, port, config.gid_index)?;

        let channel = unsafe { ibverbs_sys::ibv_create_comp_channel(device.0) };
        if channel.is_null() {
            return Err(KvError::device(format!(
                "{dev_name}: ibv_create_comp_channel failed"
            )));
        }
        let channel = CompChannel(channel);
        set_nonblocking(unsafe { (*channel.0).fd })?;

        let depth = config.max_outstanding + config.recv_depth;
        let depth = c_int::try_from(depth)
            .map_err(|_| KvError::Config(format!("completion queue depth {depth} too large")))?;
        let cq = unsafe {
            ibverbs_sys::ibv_create_cq(device.0, depth, ptr::null_mut(), channel.0, 0)
        };
        if cq.is_null() {
            return Err(KvError::device(format!(
                "{dev_name}: ibv_create_cq({depth}) failed"
            )));
        }
        let cq = CompletionQueue(cq);

        tracing::info!(
            device = %dev_name,
            port = config.ib_port,
            gid_index,
            active_mtu = port.active_mtu,
            cq_depth = depth,
            "RDMA context opened"
        );

        Ok(Self {
            cq,
            channel,
            pd,
            device,
            dev_name,
            ib_port: config.ib_port,
            port,
            gid_index,
            gid,
        })
    }

    pub fn dev_name(&self) -> &str {
        &self.dev_name
    }

    pub fn ib_port(&self) -> u8 {
        self.ib_port
    }

    pub fn port(&self) -> PortInfo {
        self.port
    }

    pub fn gid_index(&self) -> u8 {
        self.gid_index
    }

    pub fn gid(&self) -> [u8; 16] {
        self.gid
    }

    /// Non-blocking fd of the completion channel.
    pub fn channel_fd(&self) -> RawFd {
        unsafe { (*self.channel.0).fd }
    }

    pub(crate) fn pd(&self) -> *mut ibverbs_sys::ibv_pd {
        self.pd.0
    }

    pub(crate) fn cq(&self) -> *mut ibverbs_sys::ibv_cq {
        self.cq.0
    }

    /// Ask for an event on the channel when the next completion arrives.
    pub(crate) fn arm_cq(&self) -> Result<()> {
        let rc = unsafe {
            let cq = self.cq.0;
            let ctx = (*cq).context;
            let ops = &mut (*ctx).ops;
            ops.req_notify_cq.as_mut().expect("req_notify_cq missing")(cq, 0)
        };
        if rc != 0 {
            return Err(KvError::device(format!("ibv_req_notify_cq failed (rc={rc})")));
        }
        Ok(())
    }

    /// Consume one pending channel event, if any. Returns `false` when the
    /// channel had nothing to read.
    pub(crate) fn take_cq_event(&self) -> Result<bool> {
        let mut ev_cq: *mut ibverbs_sys::ibv_cq = ptr::null_mut();
        let mut ev_ctx: *mut std::ffi::c_void = ptr::null_mut();
        let rc = unsafe {
            ibverbs_sys::ibv_get_cq_event(self.channel.0, &mut ev_cq, &mut ev_ctx)
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(KvError::device_with_source("ibv_get_cq_event failed", err));
        }
        unsafe { ibverbs_sys::ibv_ack_cq_events(ev_cq, 1) };
        Ok(true)
    }

    /// Drain up to `wcs.len()` completions. Returns how many were filled.
    pub(crate) fn poll_cq(&self, wcs: &mut [ibverbs_sys::ibv_wc]) -> Result<usize> {
        let n = unsafe {
            let cq = self.cq.0;
            let ctx = (*cq).context;
            let ops = &mut (*ctx).ops;
            ops.poll_cq.as_mut().expect("poll_cq missing")(
                cq,
                wcs.len() as c_int,
                wcs.as_mut_ptr(),
            )
        };
        if n < 0 {
            return Err(KvError::device(format!("poll_cq failed (rc={n})")));
        }
        Ok(n as usize)
    }
}

impl std::fmt::Debug for RdmaContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmaContext")
            .field("dev_name", &self.dev_name)
            .field("ib_port", &self.ib_port)
            .field("port", &self.port)
            .field("gid_index", &self.gid_index)
            .finish()
    }
}

/// Names of every RDMA device on this host.
pub fn device_names() -> Vec<String> {
    let mut names = Vec::new();
    unsafe {
        let mut num_devices: c_int = 0;
        let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
        if dev_list.is_null() {
            return names;
        }
        for i in 0..num_devices.max(0) as usize {
            let dev = *dev_list.add(i);
            names.push(
                CStr::from_ptr(ibverbs_sys::ibv_get_device_name(dev))
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        ibverbs_sys::ibv_free_device_list(dev_list);
    }
    names
}

fn open_device(wanted: Option<&str>) -> Result<(Device, String)> {
    unsafe {
        let mut num_devices: c_int = 0;
        let dev_list = ibverbs_sys::ibv_get_device_list(&mut num_devices);
        if dev_list.is_null() || num_devices == 0 {
            if !dev_list.is_null() {
                ibverbs_sys::ibv_free_device_list(dev_list);
            }
            return Err(KvError::device("no RDMA devices found"));
        }

        let mut chosen = None;
        let mut seen = Vec::new();
        for i in 0..num_devices as usize {
            let dev = *dev_list.add(i);
            let name = CStr::from_ptr(ibverbs_sys::ibv_get_device_name(dev))
                .to_string_lossy()
                .into_owned();
            if wanted.is_none_or(|w| w == name) {
                chosen = Some((dev, name));
                break;
            }
            seen.push(name);
        }

        let Some((dev, name)) = chosen else {
            ibverbs_sys::ibv_free_device_list(dev_list);
            return Err(KvError::device(format!(
                "RDMA device {:?} not found (have {})",
                wanted.unwrap_or_default(),
                seen.join(", ")
            )));
        };

        let ctx = ibverbs_sys::ibv_open_device(dev);
        ibverbs_sys::ibv_free_device_list(dev_list);
        if ctx.is_null() {
            return Err(KvError::device(format!("{name}: ibv_open_device failed")));
        }
        Ok((Device(ctx), name))
    }
}

fn query_port(ctx: *mut ibverbs_sys::ibv_context, port: u8) -> Result<PortInfo> {
    let mut port_attr = ibverbs_sys::ibv_port_attr::default();
    let errno = unsafe {
        ibverbs_sys::ibv_query_port(
            ctx,
            port,
            &mut port_attr as *mut ibverbs_sys::ibv_port_attr as *mut _,
        )
    };
    if errno != 0 {
        return Err(KvError::device_with_source(
            format!("ibv_query_port({port}) failed"),
            std::io::Error::from_raw_os_error(errno),
        ));
    }
    // GID table contents are only valid in these states.
    match port_attr.state {
        ibverbs_sys::ibv_port_state::IBV_PORT_ACTIVE
        | ibverbs_sys::ibv_port_state::IBV_PORT_ARMED => {}
        other => {
            return Err(KvError::device(format!(
                "port {port} is not ACTIVE or ARMED (state {other:?})"
            )));
        }
    }
    Ok(PortInfo {
        lid: port_attr.lid,
        active_mtu: port_attr.active_mtu as u32,
        gid_tbl_len: port_attr.gid_tbl_len,
    })
}

fn query_gid(ctx: *mut ibverbs_sys::ibv_context, port: u8, index: u8) -> Result<[u8; 16]> {
    unsafe {
        let mut gid: ibverbs_sys::ibv_gid = std::mem::zeroed();
        let rc = ibverbs_sys::ibv_query_gid(ctx, port, index as c_int, &mut gid);
        if rc != 0 {
            return Err(KvError::device(format!(
                "ibv_query_gid(port {port}, index {index}) failed (rc={rc})"
            )));
        }
        Ok(gid.raw)
    }
}

fn select_gid(
    ctx: *mut ibverbs_sys::ibv_context,
    port: u8,
    info: PortInfo,
    configured: Option<u32>,
) -> Result<(u8, [u8; 16])> {
    if let Some(index) = configured {
        let index = u8::try_from(index)
            .ok()
            .filter(|i| i32::from(*i) < info.gid_tbl_len)
            .ok_or_else(|| {
                KvError::Config(format!(
                    "gid_index {index} outside GID table of {} entries",
                    info.gid_tbl_len
                ))
            })?;
        return Ok((index, query_gid(ctx, port, index)?));
    }

    let len = info.gid_tbl_len.clamp(0, 256) as usize;
    let mut table = Vec::with_capacity(len);
    for index in 0..len {
        // Unpopulated slots fail to query on some drivers.
        table.push(query_gid(ctx, port, index as u8).unwrap_or([0; 16]));
    }
    let index = first_roce_v2_gid(&table).ok_or_else(|| {
        KvError::device(format!(
            "no IPv4-mapped (RoCEv2) GID on port {port}; set gid_index explicitly"
        ))
    })?;
    tracing::debug!(index, "selected RoCEv2 GID");
    Ok((index as u8, table[index]))
}

/// `::ffff:a.b.c.d`
pub(crate) fn is_ipv4_mapped(gid: &[u8; 16]) -> bool {
    gid[..10].iter().all(|b| *b == 0) && gid[10] == 0xff && gid[11] == 0xff
}

pub(crate) fn first_roce_v2_gid(table: &[[u8; 16]]) -> Option<usize> {
    table.iter().position(is_ipv4_mapped)
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(KvError::device_with_source(
                "failed to make completion channel non-blocking",
                std::io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}
