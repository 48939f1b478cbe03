//! Death tests. Each test re-runs this binary filtered to itself with
//! `DEATH_TEST_CHILD` set; the child runs the body, the parent checks that
//! the child did not exit normally.

use std::{env, process::Command};

use remset::{
    OS_PAGE_SIZE, StoreBuffer, StoreBufferSettings, WORD_SIZE,
    sim::{ObjectKind, SimHeap},
};

const CHILD_ENV: &str = "DEATH_TEST_CHILD";
const PAGE: usize = OS_PAGE_SIZE / WORD_SIZE;
const CHUNK: usize = 64 * 1024;

fn expect_death(name: &str, body: impl FnOnce()) {
    if env::var_os(CHILD_ENV).is_some() {
        body();
        return;
    }

    let exe = env::current_exe().expect("test binary path");
    let output = Command::new(exe)
        .args([name, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("spawn death test child");

    assert!(
        !output.status.success(),
        "{name}: child exited normally, expected the process to die"
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("fatal process out of memory"),
        "{name}: unexpected child output:\n{stderr}"
    );
}

fn single_page_buffer() -> StoreBuffer {
    StoreBuffer::new(StoreBufferSettings {
        fast_buffer_entries: PAGE,
        aggregate_buffer_entries: PAGE,
        chunk_size: CHUNK,
        ..Default::default()
    })
}

#[test]
fn space_beyond_the_reservation_is_fatal() {
    expect_death("space_beyond_the_reservation_is_fatal", || {
        let heap = SimHeap::new(CHUNK, 2, 64 * 1024);
        let mut buffer = single_page_buffer();
        buffer.ensure_space(&heap, buffer.reserved_entries() + 1);
    });
}

#[test]
fn space_beyond_the_reservation_is_fatal_after_exempting_everything() {
    expect_death(
        "space_beyond_the_reservation_is_fatal_after_exempting_everything",
        || {
            let heap = SimHeap::new(CHUNK, 2, 64 * 1024);
            let mut buffer = single_page_buffer();
            let holder = heap.allocate_old(ObjectKind::Tagged, PAGE / 2);
            for i in 0..PAGE / 2 {
                buffer.record_slot(&heap, heap.field(holder, i));
            }
            buffer.compact(&heap);
            buffer.ensure_space(&heap, PAGE + 1);
        },
    );
}

#[test]
fn space_within_the_reservation_is_not_fatal() {
    let heap = SimHeap::new(CHUNK, 2, 64 * 1024);
    let mut buffer = single_page_buffer();
    buffer.ensure_space(&heap, PAGE);
    assert_eq!(buffer.committed_entries(), PAGE);
}
