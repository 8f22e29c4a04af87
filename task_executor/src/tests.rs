// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::{recommended_worker_count, Executor};

#[tokio::test]
async fn spawn_and_join() {
    let executor = Executor::new();
    let value = executor.spawn(async { 40 + 2 }, |e| panic!("join error: {e}")).await;
    assert_eq!(value, 42);
}

#[tokio::test]
async fn spawn_blocking_and_join() {
    let executor = Executor::new();
    let value = executor
        .spawn_blocking(|| 40 + 2, |e| panic!("join error: {e}"))
        .await;
    assert_eq!(value, 42);
}

#[test]
fn recommended_worker_count_bounds() {
    assert_eq!(recommended_worker_count(0), 1);
    assert_eq!(recommended_worker_count(1), 1);
    let upper = (num_cpus::get() * 2).max(8);
    assert_eq!(recommended_worker_count(10_000), upper);
}

#[test]
fn borrowed_executors_do_not_shut_down() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let executor = runtime.block_on(async { Executor::new() });
    assert!(executor.is_shutdown());
    executor.shutdown(std::time::Duration::from_millis(10));
    // Still usable via the underlying runtime.
    let value = runtime.block_on(executor.spawn(async { 1 }, |e| panic!("join error: {e}")));
    assert_eq!(value, 1);
}
