//! Acquire / release lifecycle against the in-memory backend

mod common;

use appliance_harness::provision::MemoryBackend;
use appliance_harness::{
    CancellationToken, Command, Expect, HarnessError, InstanceId, PollError, PollSpec,
    ProvisionError, ProvisioningBackend, TransportError, VmAddress, VmState,
};
use common::{context, manager, refused, Script, TICK};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

const ACQUIRE: Duration = Duration::from_secs(5);

#[smol_potat::test]
async fn test_acquire_forwards_context_and_probes() {
    let backend = MemoryBackend::new().boot_after(2);
    let script = Script::succeeding();
    let manager = manager(&backend, &script);
    let ctx = context(&[("NETWORK", "YES"), ("ONEAPP_DB_PASSWORD", "secret")]);

    let mut vm = manager.acquire(ctx.clone(), ACQUIRE).await.unwrap();

    assert_eq!(vm.state(), VmState::Ready);
    assert!(vm.is_ready());
    assert_eq!(vm.address(), Some(&VmAddress::new("10.0.0.1")));
    assert_eq!(vm.context(), &ctx);
    assert_eq!(backend.requests()[0].context, ctx);
    assert_eq!(backend.requests()[0].timeout, Some(ACQUIRE));
    assert_eq!(script.commands(), vec!["true".to_string()]);
    assert_eq!(
        manager.active(),
        vec![(InstanceId::new("1"), VmState::Ready)]
    );

    manager.release(&mut vm).await.unwrap();
}

#[smol_potat::test]
async fn test_release_is_idempotent() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let mut vm = manager.acquire(context(&[]), ACQUIRE).await.unwrap();
    let id = vm.id().clone();

    manager.release(&mut vm).await.unwrap();
    manager.release(&mut vm).await.unwrap();

    assert_eq!(vm.state(), VmState::Destroyed);
    assert_eq!(backend.destroy_calls(&id), 1);
    assert!(manager.active().is_empty());
    assert!(backend.list().await.unwrap().is_empty());
    assert!(script.closes() >= 1);
}

#[smol_potat::test]
async fn test_released_handle_rejects_commands() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let mut vm = manager.acquire(context(&[]), ACQUIRE).await.unwrap();
    manager.release(&mut vm).await.unwrap();
    let calls = script.calls();

    let err = vm.execute(&Command::new("true")).await.unwrap_err();
    assert!(matches!(
        err,
        HarnessError::NotReady {
            state: VmState::Destroyed,
            ..
        }
    ));

    let err = vm
        .poll(
            &Command::new("true"),
            &Expect::Success,
            &PollSpec::new(Duration::from_secs(5), TICK),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PollError::Aborted(_)));
    assert_eq!(script.calls(), calls);
}

#[smol_potat::test]
async fn test_failed_boot_is_rolled_back() {
    let backend = MemoryBackend::new().failing_boot("kernel panic");
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let err = manager.acquire(context(&[]), ACQUIRE).await.unwrap_err();

    match err {
        ProvisionError::InstanceFailed {
            instance, reason, ..
        } => {
            assert_eq!(reason, "kernel panic");
            assert_eq!(backend.destroy_calls(&instance), 1);
        }
        other => panic!("expected instance failure, got {other}"),
    }
    assert!(backend.list().await.unwrap().is_empty());
    assert!(manager.active().is_empty());
    assert_eq!(script.calls(), 0);
}

#[smol_potat::test]
async fn test_instance_that_never_boots_times_out() {
    let backend = MemoryBackend::new().never_boot();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let err = manager
        .acquire(context(&[]), Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Timeout { .. }));
    assert!(backend.list().await.unwrap().is_empty());
    assert!(manager.active().is_empty());
}

#[smol_potat::test]
async fn test_unreachable_instance_times_out_with_last_error() {
    let backend = MemoryBackend::new();
    let script = Script::with_fallback(Err(refused()));
    let manager = manager(&backend, &script);

    let err = manager
        .acquire(context(&[]), Duration::from_millis(50))
        .await
        .unwrap_err();

    match &err {
        ProvisionError::Timeout {
            instance,
            last_error,
            ..
        } => {
            assert!(last_error
                .as_deref()
                .is_some_and(|e| e.contains("Connection refused")));
            assert_eq!(backend.destroy_calls(instance), 1);
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(script.calls() >= 1);
    assert_eq!(script.closes(), 1);
    assert!(backend.list().await.unwrap().is_empty());
}

#[smol_potat::test]
async fn test_rejected_request_allocates_nothing() {
    let backend = MemoryBackend::new().reject_requests("quota exceeded");
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let err = manager.acquire(context(&[]), ACQUIRE).await.unwrap_err();

    assert!(matches!(err, ProvisionError::Request(_)));
    assert!(manager.active().is_empty());
}

#[smol_potat::test]
async fn test_cancelled_acquisition_is_rolled_back() {
    let backend = MemoryBackend::new().never_boot();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = manager
        .acquire_with(context(&[]), Duration::from_secs(600), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Cancelled { .. }));
    assert_eq!(backend.destroy_calls(&InstanceId::new("1")), 1);
    assert!(backend.list().await.unwrap().is_empty());
}

#[smol_potat::test]
async fn test_with_vm_returns_body_value() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let status = manager
        .with_vm(context(&[]), ACQUIRE, |vm| {
            Box::pin(async move {
                let result = vm.execute(&Command::new("hostname")).await?;
                Ok::<_, HarnessError>(result.exit_status())
            })
        })
        .await
        .unwrap();

    assert_eq!(status, 0);
    assert_eq!(backend.destroy_calls(&InstanceId::new("1")), 1);
    assert!(manager.active().is_empty());
}

#[smol_potat::test]
async fn test_with_vm_releases_when_body_fails() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let err = manager
        .with_vm(context(&[]), ACQUIRE, |_vm| {
            Box::pin(async { Err::<(), _>(HarnessError::InvalidPollSpec("bad".into())) })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::InvalidPollSpec(_)));
    assert_eq!(backend.destroy_calls(&InstanceId::new("1")), 1);
    assert!(backend.list().await.unwrap().is_empty());
}

#[smol_potat::test]
async fn test_with_vm_releases_when_body_panics() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let outcome = AssertUnwindSafe(manager.with_vm(context(&[]), ACQUIRE, |vm| {
        Box::pin(async move {
            if vm.is_ready() {
                panic!("check exploded");
            }
            Ok::<(), HarnessError>(())
        })
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert_eq!(backend.destroy_calls(&InstanceId::new("1")), 1);
    assert!(manager.active().is_empty());
}

#[smol_potat::test]
async fn test_release_all_cleans_up_leftovers() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let mut first = manager.acquire(context(&[]), ACQUIRE).await.unwrap();
    let mut second = manager.acquire(context(&[]), ACQUIRE).await.unwrap();
    assert_eq!(manager.active().len(), 2);

    assert_eq!(manager.release_all().await.unwrap(), 2);
    assert!(manager.active().is_empty());
    assert!(backend.list().await.unwrap().is_empty());

    manager.release(&mut first).await.unwrap();
    manager.release(&mut second).await.unwrap();
    assert_eq!(first.state(), VmState::Destroyed);
    assert_eq!(backend.destroy_calls(first.id()), 1);
    assert_eq!(backend.destroy_calls(second.id()), 1);
}

#[smol_potat::test]
async fn test_authentication_failure_fails_handle_but_release_destroys_once() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let mut vm = manager.acquire(context(&[]), ACQUIRE).await.unwrap();
    script.push(Err(TransportError::AuthenticationFailed {
        host: "10.0.0.1".into(),
        reason: "Permission denied (publickey)".into(),
    }));

    let err = vm.execute(&Command::new("true")).await.unwrap_err();
    assert!(matches!(err, HarnessError::Transport(_)));
    assert_eq!(vm.state(), VmState::Failed);
    assert_eq!(manager.active(), vec![(vm.id().clone(), VmState::Failed)]);

    manager.release(&mut vm).await.unwrap();
    manager.release(&mut vm).await.unwrap();
    assert_eq!(backend.destroy_calls(vm.id()), 1);
    assert!(manager.active().is_empty());
}

#[smol_potat::test]
async fn test_wait_until_ready_reads_motd() {
    let backend = MemoryBackend::new();
    let script = Script::succeeding();
    let manager = manager(&backend, &script);

    let mut vm = manager.acquire(context(&[]), ACQUIRE).await.unwrap();
    script.push(Ok(appliance_harness::ExecutionResult::new(
        0,
        "Welcome\n",
        None,
    )));
    script.push(Ok(appliance_harness::ExecutionResult::new(
        0,
        "    All set and ready to serve 8)\n",
        None,
    )));

    let result = vm
        .wait_until_ready(Duration::from_secs(5), TICK, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.stdout().contains(appliance_harness::READY_BANNER));
    assert_eq!(
        script.commands(),
        vec!["true", "cat /etc/motd", "cat /etc/motd"]
    );
    manager.release(&mut vm).await.unwrap();
}
