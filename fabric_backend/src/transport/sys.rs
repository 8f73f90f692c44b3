// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Narrow `extern "C"` surface onto libfabric (OFI).
//!
//! No existing crate wraps libfabric, so this module declares only the
//! subset of `<rdma/fabric.h>`/`<rdma/fi_domain.h>`/`<rdma/fi_cm.h>`/
//! `<rdma/fi_rma.h>`/`<rdma/fi_eq.h>` needed by `transport::Session`,
//! the same posture the teacher takes toward raw `io_uring`/socket
//! interfaces in `rpc_protocol::server::ring`: thin `unsafe` bindings,
//! wrapped one layer up into a safe API.
//!
//! Struct layouts mirror the subset of the real libfabric headers this
//! backend touches; fields this backend never reads (nic info, auth key,
//! extended attrs) are omitted rather than padded out, since this module
//! only needs to describe the memory layout providers actually populate
//! for the calls below.

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_void, size_t, ssize_t};

pub const FI_VERSION_MAJOR: u32 = 1;
pub const FI_VERSION_MINOR: u32 = 9;

pub const fn fi_version(major: u32, minor: u32) -> u32 {
    (major << 16) | minor
}

// Capability bits (subset of `<rdma/fabric.h>`).
pub const FI_MSG: u64 = 1 << 1;
pub const FI_RMA: u64 = 1 << 2;
pub const FI_SEND: u64 = 1 << 10;
pub const FI_RECV: u64 = 1 << 11;
pub const FI_WRITE: u64 = 1 << 14;
pub const FI_REMOTE_WRITE: u64 = 1 << 16;
pub const FI_REMOTE_CQ_DATA: u64 = 1 << 24;

// Operation flags (`<rdma/fi_eq.h>`, `<rdma/fi_rma.h>`).
pub const FI_DELIVERY_COMPLETE: u64 = 1 << 28;
pub const FI_FENCE: u64 = 1 << 25;
pub const FI_COMPLETION: u64 = 1 << 31;

// Endpoint type (`fi_ep_attr.type`).
pub const FI_EP_RDM: u32 = 2;

// Address format (`fi_info.addr_format`).
pub const FI_FORMAT_UNSPEC: u32 = 0;

// CQ format (`fi_cq_attr.format`).
pub const FI_CQ_FORMAT_DATA: c_int = 3;
pub const FI_CQ_FORMAT_UNSPEC: c_int = 0;

// CQ wait object (`fi_cq_attr.wait_obj`).
pub const FI_WAIT_UNSPEC: c_int = 0;

// Memory-registration access flags (`fi_mr_reg`).
pub const FI_REMOTE_READ: u64 = 1 << 17;

/// `fi_fabric_attr` (trimmed to the fields this backend reads back after
/// `fi_getinfo`).
#[repr(C)]
pub struct fi_fabric_attr {
    pub fabric: *mut fid_fabric,
    pub name: *mut c_char,
    pub prov_name: *mut c_char,
    pub prov_version: u32,
    pub api_version: u32,
}

#[repr(C)]
pub struct fi_domain_attr {
    pub domain: *mut fid_domain,
    pub name: *mut c_char,
    pub threading: c_int,
    pub control_progress: c_int,
    pub data_progress: c_int,
    pub mr_mode: c_int,
}

#[repr(C)]
pub struct fi_ep_attr {
    pub ty: u32,
    pub protocol: u32,
    pub protocol_version: u32,
    pub max_msg_size: size_t,
    pub mem_tag_format: u64,
}

#[repr(C)]
pub struct fi_tx_attr {
    pub caps: u64,
    pub mode: u64,
    pub op_flags: u64,
    pub size: size_t,
}

#[repr(C)]
pub struct fi_rx_attr {
    pub caps: u64,
    pub mode: u64,
    pub op_flags: u64,
    pub size: size_t,
}

/// `fi_info` (`<rdma/fabric.h>`): a node in the linked list `fi_getinfo`
/// returns, one entry per matching provider/endpoint combination.
#[repr(C)]
pub struct fi_info {
    pub next: *mut fi_info,
    pub caps: u64,
    pub mode: u64,
    pub addr_format: u32,
    pub src_addrlen: size_t,
    pub dest_addrlen: size_t,
    pub src_addr: *mut c_void,
    pub dest_addr: *mut c_void,
    pub fabric_attr: *mut fi_fabric_attr,
    pub domain_attr: *mut fi_domain_attr,
    pub ep_attr: *mut fi_ep_attr,
    pub tx_attr: *mut fi_tx_attr,
    pub rx_attr: *mut fi_rx_attr,
}

#[repr(C)]
pub struct fi_av_attr {
    pub ty: c_int,
    pub rx_ctx_bits: c_int,
    pub count: size_t,
    pub ep_per_node: size_t,
    pub name: *const c_char,
    pub flags: u64,
}

#[repr(C)]
pub struct fi_cq_attr {
    pub size: size_t,
    pub flags: u64,
    pub format: c_int,
    pub wait_obj: c_int,
    pub signaling_vector: c_int,
    pub wait_cond: c_int,
    pub wait_set: *mut c_void,
}

/// `fi_cq_data_entry` — the completion format this backend requires
/// (`FI_CQ_FORMAT_DATA`), carrying the round tag in `data`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct fi_cq_data_entry {
    pub op_context: *mut c_void,
    pub flags: u64,
    pub len: size_t,
    pub buf: *mut c_void,
    pub data: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct fi_cq_err_entry {
    pub op_context: *mut c_void,
    pub flags: u64,
    pub len: size_t,
    pub buf: *mut c_void,
    pub data: u64,
    pub tag: u64,
    pub olen: size_t,
    pub err: c_int,
    pub prov_errno: c_int,
    pub err_data: *mut c_void,
    pub err_data_size: size_t,
}

// Opaque fabric object identifiers. These are never constructed on the
// Rust side; they are only ever reached through pointers libfabric hands
// back, so the extern-type idiom (a zero-size private field) is enough.
#[repr(C)]
pub struct fid_fabric {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_domain {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_ep {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_av {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_cq {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid_mr {
    _private: [u8; 0],
}
#[repr(C)]
pub struct fid {
    _private: [u8; 0],
}

#[link(name = "fabric")]
extern "C" {
    pub fn fi_getinfo(
        version: u32,
        node: *const c_char,
        service: *const c_char,
        flags: u64,
        hints: *const fi_info,
        info: *mut *mut fi_info,
    ) -> c_int;

    pub fn fi_freeinfo(info: *mut fi_info);

    pub fn fi_fabric(
        attr: *const fi_fabric_attr,
        fabric: *mut *mut fid_fabric,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_domain(
        fabric: *mut fid_fabric,
        info: *const fi_info,
        domain: *mut *mut fid_domain,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_endpoint(
        domain: *mut fid_domain,
        info: *const fi_info,
        ep: *mut *mut fid_ep,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_av_open(
        domain: *mut fid_domain,
        attr: *const fi_av_attr,
        av: *mut *mut fid_av,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_cq_open(
        domain: *mut fid_domain,
        attr: *const fi_cq_attr,
        cq: *mut *mut fid_cq,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_ep_bind(ep: *mut fid_ep, bfid: *mut fid, flags: u64) -> c_int;
    pub fn fi_enable(ep: *mut fid_ep) -> c_int;
    pub fn fi_close(fid: *mut fid) -> c_int;

    pub fn fi_getname(fid: *mut fid, addr: *mut c_void, addrlen: *mut size_t) -> c_int;

    pub fn fi_av_insert(
        av: *mut fid_av,
        addr: *const c_void,
        count: size_t,
        fi_addr: *mut u64,
        flags: u64,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_mr_reg(
        domain: *mut fid_domain,
        buf: *const c_void,
        len: size_t,
        access: u64,
        offset: u64,
        requested_key: u64,
        flags: u64,
        mr: *mut *mut fid_mr,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_mr_key(mr: *mut fid_mr) -> u64;

    /// RMA write carrying `data` as remote CQ immediate data, with `flags`
    /// controlling delivery semantics (`FI_DELIVERY_COMPLETE | FI_FENCE |
    /// FI_REMOTE_CQ_DATA` on the synchronous fallback path; plain
    /// `FI_REMOTE_CQ_DATA` on the async path).
    pub fn fi_writedata(
        ep: *mut fid_ep,
        buf: *const c_void,
        len: size_t,
        desc: *mut c_void,
        data: u64,
        flags: u64,
        dest_addr: u64,
        addr: u64,
        key: u64,
        context: *mut c_void,
    ) -> ssize_t;

    pub fn fi_cq_read(cq: *mut fid_cq, buf: *mut c_void, count: size_t) -> ssize_t;

    pub fn fi_cq_readerr(cq: *mut fid_cq, buf: *mut fi_cq_err_entry, flags: u64) -> ssize_t;

    pub fn fi_cq_strerror(
        cq: *mut fid_cq,
        prov_errno: c_int,
        err_data: *const c_void,
        buf: *mut c_char,
        len: size_t,
    ) -> *const c_char;
}

/// `-EAGAIN`, libfabric's "try again" sentinel returned from both issue
/// calls (`fi_writedata`) and completion reads (`fi_cq_read`) when there
/// is momentarily no progress to report.
pub const FI_EAGAIN: ssize_t = -(libc::EAGAIN as ssize_t);
