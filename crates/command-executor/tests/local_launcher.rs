//! Integration tests for the local launcher

use command_executor::{
    Command, Error, ProcessEventType, ProcessHandle, backends::LocalLauncher, launcher::Launcher,
};
use futures::StreamExt;
use std::time::{Duration, Instant};

#[smol_potat::test]
async fn test_launch_streams_started_then_output() {
    let command = Command::builder("echo").arg("hello world").build();

    let (mut events, mut handle) = LocalLauncher.launch(command).await.unwrap();

    let first = events.next().await.unwrap();
    match first.event_type {
        ProcessEventType::Started { pid } => assert_eq!(handle.pid(), Some(pid)),
        other => panic!("expected Started, got {other:?}"),
    }

    let mut output = String::new();
    while let Some(event) = events.next().await {
        if let Some(data) = &event.data {
            output.push_str(data);
        }
    }

    let status = handle.wait().await.unwrap();
    assert!(status.success());
    assert_eq!(output, "hello world\n");
}

#[smol_potat::test]
async fn test_output_without_final_newline_is_kept_as_is() {
    let result = LocalLauncher
        .execute(Command::shell("printf active"))
        .await
        .unwrap();

    assert_eq!(result.stdout, "active");
}

#[smol_potat::test]
async fn test_carriage_returns_are_preserved() {
    let result = LocalLauncher
        .execute(Command::shell("printf 'a\\r\\nb\\r\\n'; printf 'warn\\r\\n' >&2"))
        .await
        .unwrap();

    assert_eq!(result.stdout, "a\r\nb\r\n");
    assert_eq!(result.stderr, "warn\r\n");
}

#[smol_potat::test]
async fn test_invalid_utf8_does_not_truncate_output() {
    let script = "printf 'ok\\n\\377\\n'; seq 1 20000; echo All set and ready to serve";
    let result = LocalLauncher.execute(Command::shell(script)).await.unwrap();

    assert_eq!(result.status.code, Some(0));
    assert!(result.stdout.starts_with("ok\n\u{FFFD}\n1\n2\n"));
    assert!(result.stdout.contains("\n20000\n"));
    assert!(result.stdout.ends_with("All set and ready to serve\n"));
}

#[smol_potat::test]
async fn test_env_and_working_directory_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker"), "").unwrap();

    let command = Command::builder("sh")
        .arg("-c")
        .arg("echo $GREETING; ls")
        .env("GREETING", "hi")
        .current_dir(dir.path())
        .build();

    let result = LocalLauncher.execute(command).await.unwrap();
    assert!(result.success());
    assert_eq!(result.stdout, "hi\nmarker\n");
}

#[smol_potat::test]
async fn test_execute_with_timeout_kills_slow_process() {
    let command = Command::builder("sleep").arg("10").build();

    let started = Instant::now();
    let err = LocalLauncher
        .execute_with_timeout(command, Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TimedOut { after } if after == Duration::from_millis(100)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[smol_potat::test]
async fn test_execute_with_timeout_returns_fast_result() {
    let command = Command::shell("echo done; exit 4");

    let result = LocalLauncher
        .execute_with_timeout(command, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(result.status.code, Some(4));
    assert_eq!(result.stdout, "done\n");
    assert!(!result.success());
}
