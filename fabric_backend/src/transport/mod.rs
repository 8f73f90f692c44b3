// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The transport session (§4.B): a singleton-per-instance fabric/domain/
//! endpoint/address-vector/completion-queue tuple, wrapped so the rest of
//! the crate never touches `sys` directly.
//!
//! Grounded on `rpc_protocol::server::ring::RpcServer`: one struct owns
//! the kernel/library resource (there, an `IoUring`; here, the libfabric
//! object graph), and a small set of methods centralizes the "try again"
//! retry loop the way `RpcServer::try_submit_and_wait` does for
//! `io_uring_enter`.

pub mod sys;

use std::ffi::CString;
use std::os::raw::c_void;

use log::{debug, trace, warn};

use crate::action::BufferRef;
use crate::error::{Error, Result};
use crate::registry::RegistrationHandle;

/// Consecutive `EAGAIN`s tolerated before yielding the thread once, per
/// Design Note "Busy-wait on try again": latency-friendly under light
/// contention, but doesn't peg a core at 100% indefinitely.
const EAGAIN_YIELD_THRESHOLD: u32 = 4096;

/// A completion read off the receive CQ: the round the sender tagged its
/// write with (spec §3: "Completion record").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub round: u32,
}

/// Owns the fabric/domain/endpoint/AV/CQ tuple for this process. There is
/// exactly one `Session` per `Instance` (§5: process-global, accessed only
/// from the executor thread).
pub struct Session {
    /// Head of the list `fi_getinfo` returned; kept only so `Drop` can
    /// free the whole list with `fi_freeinfo`, regardless of which node
    /// in it `select_info` picked.
    info_list: *mut sys::fi_info,
    fabric: *mut sys::fid_fabric,
    domain: *mut sys::fid_domain,
    ep: *mut sys::fid_ep,
    av: *mut sys::fid_av,
    cq_recv: *mut sys::fid_cq,
    cq_send: *mut sys::fid_cq,
}

// SAFETY: a `Session` is only ever touched from the single executor
// thread for a given process (§5); libfabric objects are fine to move
// between threads as long as they aren't used concurrently from two.
unsafe impl Send for Session {}

impl Session {
    /// Opens the fabric session, requesting the capabilities §4.B
    /// requires: reliable-datagram endpoint semantics, tagged RMA writes
    /// with immediate data, and a receive CQ format that surfaces that
    /// immediate data (`FI_CQ_FORMAT_DATA`).
    ///
    /// `home_host`/`home_port` are passed through to `fi_getinfo` as
    /// `node`/`service`, matching `backend-fabric.c`'s own call: this
    /// chooses the first provider that supports RMA *and can reach the
    /// master node*, not merely the first provider available locally.
    ///
    /// This happens before bootstrap rendezvous assigns a rank (§4.A step
    /// 1: "each process opens its local endpoint first, then exchanges
    /// the resulting address"), so this session carries no rank of its
    /// own; `Instance::mylid()` is the one place that's tracked.
    pub fn open(home_host: &str, home_port: u16) -> Result<Self> {
        let hints = Self::build_hints();

        let node = to_cstring(home_host);
        let service = to_cstring(&home_port.to_string());

        let mut info_list: *mut sys::fi_info = std::ptr::null_mut();
        let rc = unsafe {
            sys::fi_getinfo(
                sys::fi_version(sys::FI_VERSION_MAJOR, sys::FI_VERSION_MINOR),
                node.as_ptr(),
                service.as_ptr(),
                0,
                &hints,
                &mut info_list,
            )
        };
        if rc != 0 {
            return Err(Error::Configuration(format!(
                "fi_getinfo failed with code {rc}: no suitable libfabric provider"
            )));
        }

        // The original walks the returned list looking for a candidate
        // whose endpoint type and capabilities actually match the hints,
        // logging rejected candidates rather than trusting the first
        // entry (see DESIGN.md §9.1 item 1).
        let info = Self::select_info(info_list)?;

        let mut fabric: *mut sys::fid_fabric = std::ptr::null_mut();
        let rc = unsafe { sys::fi_fabric((*info).fabric_attr, &mut fabric, std::ptr::null_mut()) };
        if rc != 0 {
            unsafe { sys::fi_freeinfo(info_list) };
            return Err(Error::Configuration(format!("fi_fabric failed: {rc}")));
        }

        let mut domain: *mut sys::fid_domain = std::ptr::null_mut();
        let rc = unsafe { sys::fi_domain(fabric, info, &mut domain, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_domain failed: {rc}")));
        }

        let mut ep: *mut sys::fid_ep = std::ptr::null_mut();
        let rc = unsafe { sys::fi_endpoint(domain, info, &mut ep, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_endpoint failed: {rc}")));
        }

        let av_attr = sys::fi_av_attr {
            ty: 0,
            rx_ctx_bits: 0,
            count: 0,
            ep_per_node: 0,
            name: std::ptr::null(),
            flags: 0,
        };
        let mut av: *mut sys::fid_av = std::ptr::null_mut();
        let rc = unsafe { sys::fi_av_open(domain, &av_attr, &mut av, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_av_open failed: {rc}")));
        }

        let cq_recv = Self::open_cq(domain)?;
        let cq_send = Self::open_cq(domain)?;

        // Separate send/recv CQs (§4.B) so wait actions only ever consume
        // completions belonging to their own direction.
        let rc = unsafe { sys::fi_ep_bind(ep, av as *mut sys::fid, 0) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_ep_bind(av) failed: {rc}")));
        }
        let rc = unsafe { sys::fi_ep_bind(ep, cq_recv as *mut sys::fid, sys::FI_RECV) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_ep_bind(cq_recv) failed: {rc}")));
        }
        let rc = unsafe { sys::fi_ep_bind(ep, cq_send as *mut sys::fid, sys::FI_SEND) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_ep_bind(cq_send) failed: {rc}")));
        }

        let rc = unsafe { sys::fi_enable(ep) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_enable failed: {rc}")));
        }

        Ok(Self {
            info_list,
            fabric,
            domain,
            ep,
            av,
            cq_recv,
            cq_send,
        })
    }

    fn build_hints() -> sys::fi_info {
        // A zeroed `fi_info` with just the fields §4.B pins down; the
        // remaining fields are left null/zero, which libfabric treats as
        // "don't care" for `fi_getinfo` hints.
        let mut hints: sys::fi_info = unsafe { std::mem::zeroed() };
        hints.caps = sys::FI_MSG | sys::FI_RMA | sys::FI_SEND | sys::FI_RECV | sys::FI_WRITE | sys::FI_REMOTE_WRITE | sys::FI_REMOTE_CQ_DATA;
        hints.addr_format = sys::FI_FORMAT_UNSPEC;

        let ep_attr = Box::new(sys::fi_ep_attr {
            ty: sys::FI_EP_RDM,
            protocol: 0,
            protocol_version: 0,
            max_msg_size: 0,
            mem_tag_format: 0,
        });
        hints.ep_attr = Box::into_raw(ep_attr);
        hints
    }

    fn open_cq(domain: *mut sys::fid_domain) -> Result<*mut sys::fid_cq> {
        let attr = sys::fi_cq_attr {
            size: 0,
            flags: 0,
            format: sys::FI_CQ_FORMAT_DATA,
            wait_obj: sys::FI_WAIT_UNSPEC,
            signaling_vector: 0,
            wait_cond: 0,
            wait_set: std::ptr::null_mut(),
        };
        let mut cq: *mut sys::fid_cq = std::ptr::null_mut();
        let rc = unsafe { sys::fi_cq_open(domain, &attr, &mut cq, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(Error::Configuration(format!("fi_cq_open failed: {rc}")));
        }
        Ok(cq)
    }

    /// Walk the `fi_getinfo` result list for a candidate that actually
    /// matches an RDM, RMA-with-immediate-data endpoint, logging any
    /// rejected entries rather than assuming the head of the list is
    /// suitable (DESIGN.md §9.1 item 1).
    fn select_info(list: *mut sys::fi_info) -> Result<*mut sys::fi_info> {
        let mut cur = list;
        while !cur.is_null() {
            let info = unsafe { &*cur };
            let ep_ok = !info.ep_attr.is_null() && unsafe { (*info.ep_attr).ty } == sys::FI_EP_RDM;
            let caps_ok = info.caps & sys::FI_REMOTE_CQ_DATA != 0;
            if ep_ok && caps_ok {
                return Ok(cur);
            }
            debug!(
                "rejecting fi_info candidate: ep_ok={ep_ok} caps_ok={caps_ok} caps={:#x}",
                info.caps
            );
            cur = info.next;
        }
        Err(Error::Configuration(
            "no libfabric provider offers an RDM endpoint with FI_REMOTE_CQ_DATA".into(),
        ))
    }

    /// This process's opaque endpoint address, of whatever length the
    /// provider chooses (spec §4.A: "L is discovered at runtime").
    pub fn own_address(&self) -> Result<Vec<u8>> {
        let mut len: libc::size_t = 0;
        let rc = unsafe { sys::fi_getname(self.ep as *mut sys::fid, std::ptr::null_mut(), &mut len) };
        // fi_getname is expected to return -FI_ETOOSMALL (or similar) on
        // the sizing call; any other negative code with len still 0 is a
        // real failure.
        if rc == 0 && len == 0 {
            return Err(Error::Transport("fi_getname returned zero-length address".into()));
        }

        let mut buf = vec![0u8; len];
        let rc = unsafe {
            sys::fi_getname(self.ep as *mut sys::fid, buf.as_mut_ptr() as *mut c_void, &mut len)
        };
        if rc != 0 {
            return Err(Error::Transport(format!("fi_getname failed: {rc}")));
        }
        buf.truncate(len);
        Ok(buf)
    }

    /// Insert a `world_size * address_length` table of peer addresses
    /// into the address vector, in rank order, returning the `fi_addr_t`
    /// libfabric assigned to each rank (spec §4.A step 5).
    pub fn insert_av(&self, table: &[u8], world_size: u32, address_length: usize) -> Result<Vec<u64>> {
        let mut fi_addrs = vec![0u64; world_size as usize];
        let rc = unsafe {
            sys::fi_av_insert(
                self.av,
                table.as_ptr() as *const c_void,
                world_size as libc::size_t,
                fi_addrs.as_mut_ptr(),
                0,
                std::ptr::null_mut(),
            )
        };
        if rc < 0 {
            return Err(Error::Transport(format!("fi_av_insert failed: {rc}")));
        }
        if rc as u32 != world_size {
            warn!(
                "fi_av_insert inserted {rc} of {world_size} addresses (address_length={address_length})"
            );
        }
        Ok(fi_addrs)
    }

    /// Register `buf` for remote write access, keyed by `key` (the rank
    /// of the expected sender, per §4.C).
    pub fn register(&self, buf: BufferRef, key: u64) -> Result<RegistrationHandle> {
        let mut mr: *mut sys::fid_mr = std::ptr::null_mut();
        let rc = unsafe {
            sys::fi_mr_reg(
                self.domain,
                buf.ptr as *const c_void,
                buf.len,
                sys::FI_REMOTE_WRITE,
                0,
                key,
                0,
                &mut mr,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(Error::ResourceExhausted(format!(
                "fi_mr_reg failed for buffer of {} bytes with key {key}: {rc}",
                buf.len
            )));
        }
        let actual_key = unsafe { sys::fi_mr_key(mr) };
        Ok(RegistrationHandle::new(mr as usize, buf, actual_key))
    }

    pub fn deregister(&self, handle: RegistrationHandle) -> Result<()> {
        let mr = handle.raw() as *mut sys::fid_mr;
        let rc = unsafe { sys::fi_close(mr as *mut sys::fid) };
        if rc != 0 {
            return Err(Error::Transport(format!("fi_close(mr) failed: {rc}")));
        }
        Ok(())
    }

    /// Issue an RMA write carrying `round` as immediate data. `flags`
    /// distinguishes the async path (bare `FI_REMOTE_CQ_DATA`) from the
    /// synchronous fallback (`FI_DELIVERY_COMPLETE | FI_FENCE |
    /// FI_REMOTE_CQ_DATA`, per §4.E).
    pub fn post_write_data(
        &self,
        buf: &[u8],
        dest_fi_addr: u64,
        remote_key: u64,
        round: u32,
        flags: u64,
    ) -> Result<()> {
        let mut attempts: u32 = 0;
        loop {
            let rc = unsafe {
                sys::fi_writedata(
                    self.ep,
                    buf.as_ptr() as *const c_void,
                    buf.len(),
                    std::ptr::null_mut(),
                    round as u64,
                    flags,
                    dest_fi_addr,
                    0,
                    remote_key,
                    std::ptr::null_mut(),
                )
            };
            if rc == 0 {
                return Ok(());
            }
            if rc == sys::FI_EAGAIN as isize {
                attempts += 1;
                Self::maybe_yield(attempts);
                continue;
            }
            return Err(Error::Transport(format!("fi_writedata failed: {rc}")));
        }
    }

    /// Block until one receive-side completion is available, retrying
    /// transient "try again" results forever per §5 ("forever or
    /// try-again semantics").
    pub fn poll_recv(&self) -> Result<Completion> {
        let mut entry: sys::fi_cq_data_entry = unsafe { std::mem::zeroed() };
        let mut attempts: u32 = 0;
        loop {
            let rc = unsafe {
                sys::fi_cq_read(
                    self.cq_recv,
                    &mut entry as *mut _ as *mut c_void,
                    1,
                )
            };
            if rc == 1 {
                trace!("recv completion: round={}", entry.data);
                return Ok(Completion { round: entry.data as u32 });
            }
            if rc == sys::FI_EAGAIN as isize {
                attempts += 1;
                Self::maybe_yield(attempts);
                continue;
            }
            // Negative, non-EAGAIN: a fatal completion landed in the
            // error queue; decode it via the dedicated error reader.
            return Err(self.read_cq_error(self.cq_recv));
        }
    }

    /// Block until one send-side completion is available. The tag is
    /// unused by `FabSendWait` (§4.E), so only success/failure matters.
    pub fn poll_send(&self) -> Result<()> {
        let mut entry: sys::fi_cq_data_entry = unsafe { std::mem::zeroed() };
        let mut attempts: u32 = 0;
        loop {
            let rc = unsafe {
                sys::fi_cq_read(self.cq_send, &mut entry as *mut _ as *mut c_void, 1)
            };
            if rc == 1 {
                return Ok(());
            }
            if rc == sys::FI_EAGAIN as isize {
                attempts += 1;
                Self::maybe_yield(attempts);
                continue;
            }
            return Err(self.read_cq_error(self.cq_send));
        }
    }

    /// Decode a fatal completion-queue error via the dedicated
    /// `fi_cq_readerr` path, surfacing the provider's own error string
    /// (DESIGN.md §9.1 item 2) instead of a bare return code.
    fn read_cq_error(&self, cq: *mut sys::fid_cq) -> Error {
        let mut err_entry: sys::fi_cq_err_entry = unsafe { std::mem::zeroed() };
        let rc = unsafe { sys::fi_cq_readerr(cq, &mut err_entry, 0) };
        if rc != 1 {
            return Error::Transport("completion queue reported an error, but fi_cq_readerr found nothing".into());
        }

        let mut msg_buf = vec![0 as libc::c_char; 256];
        let msg_ptr = unsafe {
            sys::fi_cq_strerror(
                cq,
                err_entry.prov_errno,
                err_entry.err_data as *const c_void,
                msg_buf.as_mut_ptr(),
                msg_buf.len(),
            )
        };
        let message = if msg_ptr.is_null() {
            format!("provider error {}", err_entry.prov_errno)
        } else {
            let c_str = unsafe { std::ffi::CStr::from_ptr(msg_ptr) };
            c_str.to_string_lossy().into_owned()
        };

        Error::Transport(format!(
            "completion error (err={}, prov_errno={}): {message}",
            err_entry.err, err_entry.prov_errno
        ))
    }

    fn maybe_yield(attempts: u32) {
        if attempts % EAGAIN_YIELD_THRESHOLD == 0 {
            std::thread::yield_now();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        unsafe {
            if !self.ep.is_null() {
                let _ = sys::fi_close(self.ep as *mut sys::fid);
            }
            if !self.av.is_null() {
                let _ = sys::fi_close(self.av as *mut sys::fid);
            }
            if !self.cq_recv.is_null() {
                let _ = sys::fi_close(self.cq_recv as *mut sys::fid);
            }
            if !self.cq_send.is_null() {
                let _ = sys::fi_close(self.cq_send as *mut sys::fid);
            }
            if !self.domain.is_null() {
                let _ = sys::fi_close(self.domain as *mut sys::fid);
            }
            if !self.fabric.is_null() {
                let _ = sys::fi_close(self.fabric as *mut sys::fid);
            }
            if !self.info_list.is_null() {
                sys::fi_freeinfo(self.info_list);
            }
        }
    }
}

/// libfabric host/service strings are plain C strings; every call site
/// that needs one goes through this to avoid repeating the
/// `CString::new(..).unwrap()` dance.
fn to_cstring(s: &str) -> CString {
    CString::new(s).expect("host/service string must not contain interior NUL bytes")
}
