use crate::common::*;
use std::time::Duration;
use warden::config::LoadedConfig;
use warden::engine::{Engine, EngineDeps, EngineError};
use warden::events::LifecycleEvent;
use warden::jobs::JobStatus;
use warden::watchdog::machine::WatchdogState;

fn project(ports: &[u16]) -> TestProject {
    project_with_grace(ports, 0)
}

fn project_with_grace(ports: &[u16], swap_grace_secs: u64) -> TestProject {
    let engine_toml = fast_engine_toml(".warden", false).replace(
        "swap_grace_secs = 0",
        &format!("swap_grace_secs = {}", swap_grace_secs),
    );
    let project = TestProject::new(&format!(
        r#"{}
[instances.main]
artifact = "builds/v1/game.dmb"
runner = "sleep"
args = ["30"]
ports = [{}, {}]
artifacts_dir = "builds"
"#,
        engine_toml,
        ports[0],
        ports[1]
    ));
    project.artifact("builds/v1/game.dmb");
    project.artifact("builds/v2/game.dmb");
    project
}

fn engine(project: &TestProject) -> Engine {
    let loaded = LoadedConfig::load(&project.config_path).unwrap();
    let deps = EngineDeps::from_config(&loaded);
    Engine::new(loaded.config, &loaded.base_dir, deps).unwrap()
}

#[tokio::test]
async fn deploy_swaps_to_the_alternate_port_over_topic() {
    let ports = free_ports(2);
    let project = project(&ports);
    let primary = FakeGameServer::bind(ports[0]).await;
    let alternate = FakeGameServer::bind(ports[1]).await;
    let engine = engine(&project);

    engine.start_instance("main", None).await.unwrap();
    let status = engine.instance_status("main").unwrap();
    assert_eq!(status.active.as_ref().unwrap().port, ports[0]);
    assert_eq!(
        status.artifact.unwrap(),
        project.dir.path().join("builds/v1/game.dmb")
    );
    assert!(
        wait_until(Duration::from_secs(5), || !primary.received().is_empty()).await,
        "primary session was never probed"
    );

    let artifact = engine.deploy("main", "v2/game.dmb").await.unwrap();
    assert_eq!(artifact, project.dir.path().join("builds/v2/game.dmb"));

    let status = engine.instance_status("main").unwrap();
    let active = status.active.unwrap();
    assert_eq!(active.port, ports[1]);
    assert_eq!(active.artifact, artifact);
    assert!(status.staged.is_none());
    assert_eq!(status.swaps.len(), 1);

    let swap = primary
        .received()
        .into_iter()
        .find(|p| p.get("command").map(String::as_str) == Some("swap"))
        .expect("old session was not told about the swap");
    assert_eq!(swap.get("port"), Some(&ports[1].to_string()));

    engine.stop_instance("main").await.unwrap();
    assert_eq!(
        engine.instance_status("main").unwrap().state,
        WatchdogState::Offline { fatal: false }
    );
    assert!(alternate.commands().contains(&"shutdown".to_string()));
}

#[tokio::test]
async fn failed_staged_health_keeps_the_active_session() {
    let ports = free_ports(2);
    let project = project(&ports);
    let _primary = FakeGameServer::bind(ports[0]).await;
    // Nothing answers on the alternate port.
    let engine = engine(&project);

    engine.start_instance("main", None).await.unwrap();
    let before = engine.instance_status("main").unwrap().active.unwrap();

    let err = engine.deploy("main", "v2/game.dmb").await.unwrap_err();
    assert!(matches!(err, EngineError::Watchdog(_)), "{err}");

    let after = engine.instance_status("main").unwrap();
    assert_eq!(after.active.unwrap().pid, before.pid);
    assert!(after.staged.is_none());
    assert!(after.swaps.is_empty());
    assert!(after.state.is_running());

    engine.stop_instance("main").await.unwrap();
}

#[tokio::test]
async fn deploy_job_is_tracked() {
    let ports = free_ports(2);
    let project = project(&ports);
    let _primary = FakeGameServer::bind(ports[0]).await;
    let _alternate = FakeGameServer::bind(ports[1]).await;
    let engine = engine(&project);
    engine.start_instance("main", None).await.unwrap();

    let ok = engine.deploy_job("main", "v2/game.dmb").unwrap();
    let missing = engine.deploy_job("main", "v9/game.dmb").unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            [ok, missing]
                .iter()
                .all(|id| engine.job_status(*id).unwrap().status.is_terminal())
        })
        .await
    );

    let ok = engine.job_status(ok).unwrap();
    assert_eq!(ok.status, JobStatus::Succeeded);
    assert_eq!(ok.kind, "deploy");
    let missing = engine.job_status(missing).unwrap();
    assert_eq!(missing.status, JobStatus::Failed);
    assert!(missing.error_message.unwrap().contains("does not exist"));

    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn old_session_leaving_on_swap_notice_is_not_restarted() {
    let ports = free_ports(2);
    let project = project_with_grace(&ports, 1);
    let primary = FakeGameServer::bind(ports[0]).await;
    let _alternate = FakeGameServer::bind(ports[1]).await;
    let engine = engine(&project);

    engine.start_instance("main", None).await.unwrap();
    let old_pid = engine.instance_status("main").unwrap().active.unwrap().pid;
    let mut events = engine.subscribe();

    // The old session leaves as soon as it hears about the swap, well inside
    // the grace window.
    let leaver = tokio::spawn(async move {
        let told = wait_until(Duration::from_secs(10), || {
            primary.commands().contains(&"swap".to_string())
        })
        .await;
        if told {
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(old_pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            )
            .unwrap();
        }
        told
    });

    engine.deploy("main", "v2/game.dmb").await.unwrap();
    assert!(leaver.await.unwrap(), "swap notice never reached the old session");

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, LifecycleEvent::InstanceRestarting { .. })),
        "old session exit was treated as a crash: {:?}",
        seen
    );

    let status = engine.instance_status("main").unwrap();
    assert_eq!(status.state, WatchdogState::Online);
    assert_eq!(status.restarts_in_window, 0);
    assert_eq!(status.active.unwrap().port, ports[1]);

    engine.stop_instance("main").await.unwrap();
}
