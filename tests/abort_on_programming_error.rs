//! §7 scenario: a runtime assertion failure exits the process with code
//! 101. `abort()` cannot be exercised in-process (it calls
//! `std::process::exit`), so this re-invokes the test binary itself as a
//! child with an environment variable set, and asserts on the child's
//! exit code — the standard way to test a fatal path from within `cargo
//! test`.

use std::process::Command;

const TRIGGER_VAR: &str = "UCXX_ABORT_TEST_TRIGGER";

#[test]
fn double_free_aborts_with_code_101() {
    if std::env::var(TRIGGER_VAR).as_deref() == Ok("double_free") {
        trigger_double_free();
        unreachable!("trigger_double_free() does not return");
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .arg("double_free_aborts_with_code_101")
        .arg("--exact")
        .arg("--nocapture")
        .env(TRIGGER_VAR, "double_free")
        .output()
        .expect("failed to re-exec test binary");

    assert_eq!(output.status.code(), Some(101), "stderr:\n{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stderr).contains("double free"));
}

fn trigger_double_free() {
    let heap = ucxx::heap::Heap::new();
    let layout = std::alloc::Layout::from_size_align(32, 8).unwrap();
    let ptr = heap.allocate(layout, false);
    unsafe {
        heap.deallocate(ptr);
        heap.deallocate(ptr);
    }
}
