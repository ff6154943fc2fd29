mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{MockNetwork, StubHypervisor};
use torvm::lifecycle::{Engine, EngineTimeouts, LifecycleError, LifecycleState};
use torvm::Config;

fn fast_timeouts() -> EngineTimeouts {
    EngineTimeouts {
        tap_wait: Duration::from_secs(5),
        tap_interval: Duration::from_millis(50),
        bootstrap_wait: Duration::from_secs(5),
        bootstrap_interval: Duration::from_millis(50),
        probe: Duration::from_millis(250),
        shutdown: Duration::from_secs(1),
    }
}

fn test_config(stub: &StubHypervisor) -> Arc<Config> {
    let mut config = Config::default();
    stub.configure(&mut config);
    Arc::new(config)
}

struct Run {
    engine: Engine,
    result: Result<(), LifecycleError>,
    transitions: Vec<(LifecycleState, LifecycleState)>,
}

/// Drive an engine to completion, optionally cancelling once Running is
/// reached, or poking the stub once Running is reached.
async fn drive(
    mut engine: Engine,
    cancel_in_running: bool,
    on_running: Option<Box<dyn FnOnce() + Send>>,
) -> Run {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let running = Arc::new(tokio::sync::Notify::new());

    {
        let transitions = transitions.clone();
        let running = running.clone();
        engine.on_state_change(move |from, to| {
            transitions.lock().unwrap().push((from, to));
            if to == LifecycleState::Running {
                running.notify_one();
            }
        });
    }

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let result = engine.run(run_cancel).await;
        (engine, result)
    });

    if cancel_in_running || on_running.is_some() {
        tokio::time::timeout(Duration::from_secs(10), running.notified())
            .await
            .expect("engine never reached Running");
        if let Some(f) = on_running {
            f();
        }
        if cancel_in_running {
            cancel.cancel();
        }
    }

    let (engine, result) = tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .expect("engine never finished")
        .unwrap();

    let transitions = transitions.lock().unwrap().clone();
    Run {
        engine,
        result,
        transitions,
    }
}

fn entered(transitions: &[(LifecycleState, LifecycleState)]) -> Vec<LifecycleState> {
    transitions.iter().map(|(_, to)| *to).collect()
}

#[tokio::test]
async fn clean_start_then_external_cancel() {
    let stub = Arc::new(
        StubHypervisor::new()
            .with_control_delay(Duration::from_millis(300))
            .with_socks_delay(Duration::from_millis(600)),
    );
    let net = MockNetwork::new();
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let run = drive(engine, true, None).await;
    run.result.expect("clean shutdown");

    use LifecycleState::*;
    assert_eq!(
        entered(&run.transitions),
        vec![
            CheckPrivileges,
            SaveNetwork,
            CreateTap,
            LaunchVm,
            WaitTap,
            ConfigureTap,
            FlushDns,
            WaitBootstrap,
            Running,
            Shutdown,
            RestoreNetwork,
            Cleanup,
        ]
    );

    assert_eq!(
        net.ops(),
        vec![
            "save_config",
            "create_tap",
            "setup_routing",
            "flush_dns",
            "teardown_routing",
            "restore_config",
            "destroy_tap",
        ]
    );
    // Exactly one teardown means the failsafe never fired: the only
    // teardown is RestoreNetwork's own.
    assert_eq!(net.count("teardown_routing"), 1);
    assert!(!run.engine.failsafe().is_active().await);
}

#[tokio::test]
async fn bootstrap_timeout_restores_and_blocks() {
    let stub = Arc::new(StubHypervisor::new().with_control_delay(Duration::from_millis(100)));
    let net = MockNetwork::new();
    let mut timeouts = fast_timeouts();
    timeouts.bootstrap_wait = Duration::from_millis(600);
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(timeouts)
        .without_privilege_check();

    let run = drive(engine, false, None).await;
    assert!(matches!(run.result, Err(LifecycleError::BootstrapTimeout(_))));

    // Failsafe teardown plus RestoreNetwork teardown.
    assert_eq!(net.count("teardown_routing"), 2);
    assert_eq!(net.count("restore_config"), 1);
    assert_eq!(net.count("destroy_tap"), 1);

    let states = entered(&run.transitions);
    assert!(states.ends_with(&[
        LifecycleState::Shutdown,
        LifecycleState::RestoreNetwork,
        LifecycleState::Cleanup,
    ]));
}

#[tokio::test]
async fn unexpected_child_exit_engages_failsafe() {
    let stub = Arc::new(
        StubHypervisor::new()
            .with_control_delay(Duration::from_millis(100))
            .with_socks_delay(Duration::from_millis(200)),
    );
    let net = MockNetwork::new();
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let exit_stub = stub.clone();
    let run = drive(
        engine,
        false,
        Some(Box::new(move || exit_stub.exit_with(139))),
    )
    .await;

    match run.result {
        Err(LifecycleError::VmExited(code)) => assert_eq!(code, 139),
        other => panic!("expected VmExited, got {:?}", other),
    }

    assert_eq!(net.count("teardown_routing"), 2);
    assert_eq!(net.count("restore_config"), 1);

    let states = entered(&run.transitions);
    assert!(states.ends_with(&[
        LifecycleState::Shutdown,
        LifecycleState::RestoreNetwork,
        LifecycleState::Cleanup,
    ]));
}

#[tokio::test]
async fn save_network_failure_refuses_restore() {
    let stub = Arc::new(StubHypervisor::new());
    let net = MockNetwork::new().fail_on("save_config");
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let run = drive(engine, false, None).await;
    assert!(matches!(
        run.result,
        Err(LifecycleError::PrivilegeOrSystem(_))
    ));

    // Saving failed, so nothing may be restored; the failsafe teardown and
    // the RestoreNetwork teardown both still run.
    assert_eq!(net.count("restore_config"), 0);
    assert_eq!(net.count("teardown_routing"), 2);
    assert_eq!(net.count("destroy_tap"), 1);
}

#[tokio::test]
async fn create_tap_failure_still_restores_saved_network() {
    let stub = Arc::new(StubHypervisor::new());
    let net = MockNetwork::new().fail_on("create_tap");
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let run = drive(engine, false, None).await;
    assert!(matches!(run.result, Err(LifecycleError::NetworkSetup(_))));

    // Failsafe fired before Shutdown began.
    let ops = net.ops();
    let fail_idx = ops.iter().position(|o| o == "create_tap").unwrap();
    let teardown_idx = ops.iter().position(|o| o == "teardown_routing").unwrap();
    assert!(teardown_idx > fail_idx);

    // A successful SaveNetwork is paired with exactly one RestoreNetwork.
    assert_eq!(net.count("restore_config"), 1);
}

#[tokio::test]
async fn configure_tap_failure_shuts_down() {
    let stub = Arc::new(StubHypervisor::new().with_control_delay(Duration::from_millis(50)));
    let net = MockNetwork::new().fail_on("setup_routing");
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let run = drive(engine, false, None).await;
    assert!(matches!(run.result, Err(LifecycleError::NetworkSetup(_))));
    assert_eq!(net.count("teardown_routing"), 2);
    assert_eq!(net.count("restore_config"), 1);
    assert_eq!(net.count("destroy_tap"), 1);
}

#[tokio::test]
async fn hypervisor_launch_failure_restores_network() {
    let stub = Arc::new(StubHypervisor::new().failing_start());
    let net = MockNetwork::new();
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let run = drive(engine, false, None).await;
    assert!(matches!(
        run.result,
        Err(LifecycleError::HypervisorLaunch(_))
    ));
    assert_eq!(net.count("restore_config"), 1);
    assert_eq!(net.count("destroy_tap"), 1);
}

#[tokio::test]
async fn management_port_never_opening_is_vm_unreachable() {
    // No listener delays configured: the ports never open.
    let stub = Arc::new(StubHypervisor::new());
    let net = MockNetwork::new();
    let mut timeouts = fast_timeouts();
    timeouts.tap_wait = Duration::from_millis(400);
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(timeouts)
        .without_privilege_check();

    let run = drive(engine, false, None).await;
    assert!(matches!(run.result, Err(LifecycleError::VmUnreachable(_))));
    assert_eq!(net.count("restore_config"), 1);
}

#[tokio::test]
async fn child_death_during_tap_wait_is_vm_exited() {
    let stub = Arc::new(StubHypervisor::new());
    let net = MockNetwork::new();
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let exit_stub = stub.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        exit_stub.exit_with(7);
    });

    let run = drive(engine, false, None).await;
    match run.result {
        Err(LifecycleError::VmExited(code)) => assert_eq!(code, 7),
        other => panic!("expected VmExited, got {:?}", other),
    }
}

#[tokio::test]
async fn cancellation_before_running_cleans_up_without_failsafe() {
    // Control port never opens; cancel while the engine sits in WaitTap.
    let stub = Arc::new(StubHypervisor::new());
    let net = MockNetwork::new();
    let engine = Engine::new(test_config(&stub), net.clone(), stub.clone())
        .with_timeouts(fast_timeouts())
        .without_privilege_check();

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let mut engine = engine;
    {
        let transitions = transitions.clone();
        engine.on_state_change(move |from, to| {
            transitions.lock().unwrap().push((from, to));
        });
    }

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { engine.run(run_cancel).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    handle.await.unwrap().expect("cancellation is a clean exit");

    // Cleanup ran, and the only teardown was RestoreNetwork's.
    assert_eq!(net.count("teardown_routing"), 1);
    assert_eq!(net.count("restore_config"), 1);
    assert_eq!(net.count("destroy_tap"), 1);
    assert!(entered(&transitions.lock().unwrap()).contains(&LifecycleState::Cleanup));
}

#[cfg(unix)]
#[tokio::test]
async fn privilege_check_rejects_non_root() {
    if nix::unistd::geteuid().is_root() {
        return; // nothing to assert when the test runner is root
    }

    let stub = Arc::new(StubHypervisor::new());
    let net = MockNetwork::new();
    let mut engine =
        Engine::new(test_config(&stub), net.clone(), stub.clone()).with_timeouts(fast_timeouts());

    let result = engine.run(CancellationToken::new()).await;
    assert!(matches!(result, Err(LifecycleError::PrivilegeOrSystem(_))));
    // Refused before touching anything.
    assert!(net.ops().is_empty());
}
