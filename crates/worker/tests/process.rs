use serde::Serialize;
use sluice_worker::{ExecutionContext, PoolConfig, WorkerPool};
use tokio::process::Command;

/// Same wire shape as the binary's demo task.
#[derive(Serialize)]
struct Doubling {
    input: u64,
    delay_ms: u64,
}

fn serve_command() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_sluice-worker"));
    command.arg("serve").env("RUST_LOG", "warn");
    command
}

#[tokio::test]
async fn child_process_serves_the_pool() {
    let context = ExecutionContext::spawn_process(serve_command(), 16).unwrap();
    let pool = WorkerPool::<Doubling, u64>::start(context, PoolConfig::with_concurrency(4)).unwrap();

    let mut handles = Vec::new();
    for input in 0..8 {
        let delay_ms = 5 + input * 3;
        handles.push((input, pool.submit(Doubling { input, delay_ms }).await.unwrap()));
    }
    pool.close();

    for (input, handle) in handles {
        assert_eq!(handle.await.unwrap(), input * 2);
    }
    pool.join().await.unwrap();
}

#[tokio::test]
async fn cancelled_pool_still_drains_the_child() {
    let context = ExecutionContext::spawn_process(serve_command(), 16).unwrap();
    let pool = WorkerPool::<Doubling, u64>::start(context, PoolConfig::with_concurrency(2)).unwrap();

    let quick = pool.submit(Doubling { input: 1, delay_ms: 5 }).await.unwrap();
    let slow = pool.submit(Doubling { input: 2, delay_ms: 150 }).await.unwrap();
    assert_eq!(quick.await.unwrap(), 2);

    pool.abort();
    assert_eq!(slow.await.unwrap(), 4);
    pool.join().await.unwrap();
}
