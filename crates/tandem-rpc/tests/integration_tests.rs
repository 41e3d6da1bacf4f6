//! Integration tests for tandem IPC against the demo child process.
//!
//! Each test spawns `tandem-rpc child` through `ParentIpc` and talks to it
//! over a real socket.

use std::sync::Arc;
use std::time::Duration;
use tandem_ipc::{Endpoint, IpcConfig, IpcError, ParentIpc, Value, ValueType};
use tempfile::TempDir;
use tokio::sync::Notify;

const DEMO_BIN: &str = env!("CARGO_BIN_EXE_tandem-rpc");

/// Parent configuration with its socket in a private temp dir.
fn test_config(dir: &TempDir) -> IpcConfig {
    IpcConfig::new()
        .with_socket_dir(dir.path())
        .with_accept_timeout(Duration::from_secs(10))
}

/// Start the demo child with the given parent configuration.
async fn start_child(config: IpcConfig) -> ParentIpc {
    let mut ipc = ParentIpc::new(DEMO_BIN, ["child"], config);
    ipc.start().await.expect("child should connect");
    ipc
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_div_roundtrip() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;

    let result = ipc.call("Math.Div", [10, 2]).await.unwrap();
    assert_eq!(result, vec![Value::Int(5)]);

    let err = ipc.call("Math.Div", [10, 0]).await.unwrap_err();
    assert!(matches!(err, IpcError::Remote(ref msg) if msg == "zero division"));

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_blob_and_array_arguments() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;

    let result = ipc
        .call(
            "Math.XorData",
            [Value::from(vec![0x0fu8, 0xf0]), Value::from(vec![0xffu8, 0xff])],
        )
        .await
        .unwrap();
    assert_eq!(result, vec![Value::Blob(vec![0xf0, 0x0f])]);

    let err = ipc
        .call("Math.XorData", [Value::from(vec![1u8]), Value::from(vec![1u8, 2])])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("input data length mismatch"));

    let err = ipc
        .call("Math.XorData", [Value::from(Vec::<u8>::new()), Value::from(vec![1u8])])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("empty input data"));

    let sum = ipc
        .call("Math.Sum", [Value::from(vec![Value::Int(4), Value::Int(5)])])
        .await
        .unwrap();
    assert_eq!(sum, vec![Value::Int(9)]);

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_dispatch_errors_are_call_local() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;

    let err = ipc.call("Math.Div", [1, 2, 3]).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("args count mismatch: expected 2, got 3"));

    let err = ipc.call("Math.Nope", [1]).await.unwrap_err();
    assert!(err.to_string().contains("method not found"));

    let err = ipc.call("Physics.Div", [1]).await.unwrap_err();
    assert!(err.to_string().contains("endpoint not found"));

    let err = ipc.call("MathDiv", [1]).await.unwrap_err();
    assert!(err.to_string().contains("invalid method"));

    let err = ipc.call("Math.Div", ["ten", "two"]).await.unwrap_err();
    assert!(err.to_string().contains("argument 0"));

    // Connection still serves calls
    let result = ipc.call("Math.Div", [9, 3]).await.unwrap();
    assert_eq!(result, vec![Value::Int(3)]);

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_panic_is_contained() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;

    let err = ipc.call("Math.Explode", Vec::<Value>::new()).await.unwrap_err();
    assert!(err.to_string().contains("handle call panicked"));

    let result = ipc.call("Math.Div", [8, 4]).await.unwrap();
    assert_eq!(result, vec![Value::Int(2)]);

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_calls() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;
    let handle = ipc.handle();

    let mut tasks = Vec::new();
    for ms in [300i64, 200, 100, 0] {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            (ms, handle.call("Worker.Sleep", [ms]).await)
        }));
    }
    for task in tasks {
        let (ms, result) = task.await.unwrap();
        assert_eq!(result.unwrap(), vec![Value::Int(ms)]);
    }

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_child_calls_parent() {
    let dir = TempDir::new().unwrap();
    let host = Endpoint::new("Host")
        .method("Greet", [], |_, _| async move { Ok(vec![Value::from("hi")]) })
        .method("Double", [ValueType::Int], |_, args| async move {
            Ok(vec![Value::Int(args.int(0)? * 2)])
        })
        .build();
    let mut ipc = start_child(test_config(&dir).register(host)).await;

    let result = ipc.call("Worker.Ask", ["Host.Greet"]).await.unwrap();
    assert_eq!(result, vec![Value::from("hi")]);

    let err = ipc.call("Worker.Ask", ["Host.Missing"]).await.unwrap_err();
    assert!(err.to_string().contains("method not found"));

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_refused_while_processing() {
    let dir = TempDir::new().unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let hold = {
        let (entered, release) = (entered.clone(), release.clone());
        Endpoint::new("Host")
            .method("Hold", [], move |_, _| {
                let (entered, release) = (entered.clone(), release.clone());
                async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok(vec![])
                }
            })
            .build()
    };
    let mut ipc = start_child(test_config(&dir).register(hold)).await;

    ipc.call("Worker.Poke", ["Host.Hold"]).await.unwrap();
    entered.notified().await;

    let err = ipc.stop().await.unwrap_err();
    assert!(matches!(err, IpcError::CallsProcessing(1)));

    release.notify_one();
    assert!(eventually(|| ipc.processing_calls() == 0).await);

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_refused_while_pending() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;
    let handle = ipc.handle();

    let call = tokio::spawn(async move { handle.call("Worker.Sleep", [300]).await });
    assert!(eventually(|| ipc.pending_calls() == 1).await);

    let err = ipc.stop().await.unwrap_err();
    assert!(matches!(err, IpcError::CallsPending(1)));

    assert_eq!(call.await.unwrap().unwrap(), vec![Value::Int(300)]);
    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_wait_after_stop_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;
    let handle = ipc.handle();

    ipc.stop().await.unwrap();
    ipc.wait(None).await.unwrap();
    ipc.wait(Some(Duration::from_millis(10))).await.unwrap();

    assert!(matches!(
        handle.call("Math.Div", [1, 1]).await,
        Err(IpcError::IpcStopping)
    ));
    assert_eq!(handle.pending_calls(), 0);
}

#[tokio::test]
async fn test_wait_timeout_interrupts_child() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;

    // The child only exits when told to; the elapsed timeout does that.
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        ipc.wait(Some(Duration::from_millis(200))),
    )
    .await
    .expect("wait should return after interrupting the child");
    outcome.unwrap();
}

#[tokio::test]
async fn test_pending_call_cancelled_when_child_stops() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;
    let handle = ipc.handle();

    let call = tokio::spawn(async move { handle.call("Worker.Sleep", [30_000]).await });
    assert!(eventually(|| ipc.pending_calls() == 1).await);

    // Interrupting bypasses the stop guard.
    ipc.wait(Some(Duration::from_millis(100))).await.unwrap();

    assert!(matches!(call.await.unwrap(), Err(IpcError::CallCancelled)));
    assert_eq!(ipc.pending_calls(), 0);
}

#[tokio::test]
async fn test_socket_path_removed_after_start() {
    let dir = TempDir::new().unwrap();
    let mut ipc = start_child(test_config(&dir)).await;

    let path = ipc.socket_path().unwrap().to_path_buf();
    assert!(path.starts_with(dir.path()));
    assert!(!path.exists());
    assert!(ipc.pid().is_some());

    ipc.stop().await.unwrap();
}

#[tokio::test]
async fn test_demo_parent_end_to_end() {
    let output = tokio::process::Command::new(DEMO_BIN)
        .arg("parent")
        .output()
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "demo failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Math.Div(10, 2) = [Int(5)]"));
    assert!(stdout.contains("Math.Div(1, 0) failed: remote error: zero division"));
    assert!(stdout.contains("Math.Sum([1, 2, 3]) = [Int(6)]"));
    assert!(stdout.contains("hello from parent"));
}

#[tokio::test]
async fn test_child_requires_socket_flag() {
    let output = tokio::process::Command::new(DEMO_BIN)
        .arg("child")
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--ipc-socket"));
}
