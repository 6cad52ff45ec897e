use crate::common::*;
use std::sync::Arc;
use std::time::Duration;
use warden::chat::ChatProvider;
use warden::config::model::WardenConfig;
use warden::engine::artifacts::DirectoryResolver;
use warden::engine::{Engine, EngineDeps};
use warden::events::LifecycleEvent;
use warden::jobs::MemoryJobStore;
use warden::watchdog::machine::WatchdogState;

fn config(ports: &[u16]) -> WardenConfig {
    toml::from_str(&format!(
        r##"{}
[instances.main]
artifact = "game.dmb"
runner = "sleep"
args = ["30"]
ports = [{}, {}]

[[chat.channels]]
id = "ops"
providers = {{ mem = "#ops" }}
admin = true
watchdog = true
"##,
        fast_engine_toml(".warden", false),
        ports[0],
        ports[1]
    ))
    .unwrap()
}

fn engine(
    project: &TestProject,
    config: WardenConfig,
    link: Arc<ScriptedLink>,
    chat: Arc<MemoryProvider>,
) -> Engine {
    let deps = EngineDeps {
        job_store: Arc::new(MemoryJobStore::default()),
        artifacts: Arc::new(DirectoryResolver::default()),
        providers: vec![chat as Arc<dyn ChatProvider>],
        command_handler: None,
        link,
    };
    Engine::new(config, project.dir.path(), deps).unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn killed_session_is_restarted() {
    let ports = free_ports(2);
    let project = TestProject::new("");
    let link = Arc::new(ScriptedLink::default());
    let engine = engine(&project, config(&ports), link, MemoryProvider::new("mem"));
    let mut events = engine.subscribe();

    engine.start_instance("main", None).await.unwrap();
    let pid = engine.instance_status("main").unwrap().active.unwrap().pid;

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let restarted = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(LifecycleEvent::InstanceRestarting { attempt, .. }) = events.recv().await {
                return attempt;
            }
        }
    })
    .await
    .expect("no restart after the session was killed");
    assert_eq!(restarted, 1);

    assert!(
        wait_until(Duration::from_secs(10), || {
            engine
                .instance_status("main")
                .map(|s| s.state == WatchdogState::Online && s.active.map(|a| a.pid) != Some(pid))
                .unwrap_or(false)
        })
        .await
    );
    let active = engine.instance_status("main").unwrap().active.unwrap();
    assert_eq!(active.port, ports[0]);
    assert_eq!(active.artifact, project.dir.path().join("game.dmb"));

    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn restart_ceiling_goes_fatal_and_alerts_admins() {
    let ports = free_ports(2);
    let project = TestProject::new("");
    let link = Arc::new(ScriptedLink::default());
    link.set_down(ports[0], true);
    let chat = MemoryProvider::new("mem");
    let engine = engine(&project, config(&ports), link.clone(), chat.clone());
    engine.start().await;
    assert!(wait_until(Duration::from_secs(5), || chat.connected()).await);

    engine.start_instance("main", None).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(15), || {
            engine.instance_status("main").unwrap().state == WatchdogState::Offline { fatal: true }
        })
        .await,
        "watchdog never gave up"
    );
    assert!(engine.instance_status("main").unwrap().active.is_none());

    assert!(
        wait_until(Duration::from_secs(5), || {
            chat.sent_to("#ops")
                .iter()
                .filter(|t| t.contains("operator action required"))
                .count()
                >= 2
        })
        .await,
        "fatal offline should reach the watchdog and admin channel: {:?}",
        chat.sent_to("#ops")
    );

    // An explicit start clears the fatal state.
    link.set_down(ports[0], false);
    engine.start_instance("main", None).await.unwrap();
    assert!(engine.instance_status("main").unwrap().state.is_running());
    engine.shutdown().await;
}
