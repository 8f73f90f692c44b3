// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end bootstrap rendezvous over real loopback TCP sockets, one
//! thread per simulated process. Grounded on the teacher's pattern of
//! driving `rpc_protocol::client`/`server` pairs over a real `pipe()` (or
//! here, loopback TCP) socket in its own integration tests rather than
//! mocking the transport.

use std::time::Duration;

use fabric_backend::bootstrap::bootstrap;
use fabric_backend::instance::Config;

/// All `world_size` processes resolve `127.0.0.1` as local, so whichever
/// thread wins the race to `bind()` becomes the master and the rest fall
/// back to the peer path — this is the intended, and only, way the
/// protocol handles co-located processes (spec §4.A / bootstrap.rs).
#[test]
fn three_rank_rendezvous_assigns_distinct_ranks() {
    let world_size: u32 = 3;
    let port = 28901;

    let handles: Vec<_> = (0..world_size)
        .map(|i| {
            std::thread::spawn(move || {
                let config = Config {
                    home_host: "127.0.0.1".to_string(),
                    home_port: port,
                    world_size,
                    async_mode: true,
                };
                // Each process's "opaque endpoint address" stands in for
                // what a real `Session::own_address()` would return;
                // distinct per thread so the table is checkable.
                let own_address = vec![i as u8; 4];
                bootstrap(&config, &own_address, Some(Duration::from_secs(5)))
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("bootstrap thread panicked").expect("bootstrap failed"))
        .collect();

    let mut ranks: Vec<u32> = results.iter().map(|r| r.rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![0, 1, 2]);

    for r in &results {
        assert_eq!(r.world_size, world_size);
        assert_eq!(r.address_table.len(), world_size as usize * 4);
    }

    // Every process must agree on the same table contents (the address
    // each rank contributed, in rank order), regardless of which thread
    // acted as master.
    let reference = &results[0].address_table;
    for r in &results[1..] {
        assert_eq!(&r.address_table, reference);
    }
}

#[test]
fn single_process_world_skips_the_network_entirely() {
    let config = Config {
        home_host: "127.0.0.1".to_string(),
        home_port: 28902,
        world_size: 1,
        async_mode: true,
    };
    let result = bootstrap(&config, &[9, 9, 9], None).unwrap();
    assert_eq!(result.rank, 0);
    assert_eq!(result.address_table, vec![9, 9, 9]);
}
