// Catapult-Style FPGA Accelerator Host Driver
// SPDX-License-Identifier: MIT

//! Basic example driving the submission pipeline over the software
//! simulator.
//!
//! Run with: `cargo run --example basic`
//!
//! To target real hardware instead, construct the session with
//! `CatapultSession::open` and a `SessionConfig` naming the vendor shell
//! library.

use std::sync::Arc;

use catapult_rust::sim::{SimDriver, SimOptions};
use catapult_rust::{CatapultError, CatapultSession};

#[tokio::main]
async fn main() -> Result<(), CatapultError> {
    env_logger::init();

    println!("Catapult Host Driver Basic Example");
    println!("==================================\n");

    // A simulated board: 4 slots with 64 KiB buffers.
    let driver = Arc::new(SimDriver::new(SimOptions {
        buffer_count: 4,
        buffer_size: 64 * 1024,
        ..SimOptions::default()
    }));

    println!("Opening session...");
    let session = CatapultSession::with_driver(driver).await?;
    println!(
        "  {} slots, {} payload bytes per slot, {} shell registers\n",
        session.slot_count(),
        session.slot_payload_capacity(),
        session.shell_register_count()
    );

    // A payload that fits in one slot.
    println!("Submitting a single-frame job...");
    let input = b"Hello, shell!".repeat(64);
    let result = session.submit(1, &input).await?;
    println!(
        "  {} bytes in, {} bytes out, {} cycles ({:?} at 150 MHz)",
        input.len(),
        result.payload.len(),
        result.execution_time_cycles,
        result.execution_time(150_000_000)
    );
    println!("  round-trip intact: {}\n", &result.payload[..input.len()] == &input[..]);

    // A payload that needs slicing across all slots.
    println!("Submitting a sliced job...");
    let big: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    let result = session.submit(2, &big).await?;
    println!(
        "  {} bytes in, {} bytes out, {} cycles",
        big.len(),
        result.payload.len(),
        result.execution_time_cycles
    );
    println!("  round-trip intact: {}\n", result.payload == big);

    // Concurrent submissions round-robin over the slot pool.
    println!("Submitting 8 jobs concurrently...");
    let session = Arc::new(session);
    let mut tasks = Vec::new();
    for i in 0..8u32 {
        let session = Arc::clone(&session);
        tasks.push(tokio::spawn(async move {
            let payload = vec![i as u8; 1024];
            session.submit(1, &payload).await.map(|r| r.payload.len())
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        match task.await {
            Ok(Ok(len)) => println!("  job {i}: {len} bytes"),
            Ok(Err(err)) => println!("  job {i}: failed: {err}"),
            Err(err) => println!("  job {i}: join error: {err}"),
        }
    }
    println!();

    println!("Closing session...");
    session.close().await?;
    println!("Done!");
    Ok(())
}
