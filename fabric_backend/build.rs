// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Locates the system `libfabric` (OFI) install and links against it.
//!
//! There is no existing crate that wraps libfabric's C API, so
//! `src/transport/sys.rs` declares the handful of `fi_*` entry points we
//! need directly and this build script only has to make sure the linker
//! can find `libfabric.so`/`.a`.

fn main() {
    match pkg_config::Config::new().atleast_version("1.9").probe("libfabric") {
        Ok(_) => return,
        Err(e) => {
            println!("cargo:warning=pkg-config could not locate libfabric ({e}); falling back to -lfabric");
        }
    }

    // Fall back to a bare `-lfabric` so builds on systems without a
    // libfabric.pc file (but with the shared library on the default
    // linker search path) still succeed.
    println!("cargo:rustc-link-lib=dylib=fabric");
}
