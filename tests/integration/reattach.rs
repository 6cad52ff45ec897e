use crate::common::*;
use std::sync::Arc;
use std::time::Duration;
use warden::config::model::WardenConfig;
use warden::engine::artifacts::DirectoryResolver;
use warden::engine::{Engine, EngineDeps};
use warden::jobs::MemoryJobStore;
use warden::platform::is_process_alive;
use warden::state::SessionRecord;

fn config(ports: &[u16], reattach: bool) -> WardenConfig {
    toml::from_str(&format!(
        r#"{}
[instances.main]
artifact = "game.dmb"
runner = "sleep"
args = ["30"]
ports = [{}, {}]
"#,
        fast_engine_toml(".warden", reattach),
        ports[0],
        ports[1]
    ))
    .unwrap()
}

fn engine(project: &TestProject, config: WardenConfig) -> Engine {
    let deps = EngineDeps {
        job_store: Arc::new(MemoryJobStore::default()),
        artifacts: Arc::new(DirectoryResolver::default()),
        providers: Vec::new(),
        command_handler: None,
        link: Arc::new(ScriptedLink::default()),
    };
    Engine::new(config, project.dir.path(), deps).unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_detaches_and_next_run_adopts() {
    let ports = free_ports(2);
    let project = TestProject::new("");

    let first = engine(&project, config(&ports, true));
    first.start().await;
    first.start_instance("main", None).await.unwrap();
    let pid = first.instance_status("main").unwrap().active.unwrap().pid;
    first.shutdown().await;

    assert!(is_process_alive(pid), "detached session should keep running");
    let record = SessionRecord::load(first.state_dir(), "main").expect("session record");
    assert_eq!(record.pid, pid);
    assert_eq!(record.port, ports[0]);

    let second = engine(&project, config(&ports, true));
    second.start().await;
    let status = second.instance_status("main").unwrap();
    assert!(status.state.is_running());
    let active = status.active.unwrap();
    assert_eq!(active.pid, pid);
    assert!(active.adopted);

    second.stop_instance("main").await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || !is_process_alive(pid)).await);
    assert!(SessionRecord::load(second.state_dir(), "main").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_without_reattach_stops_sessions() {
    let ports = free_ports(2);
    let project = TestProject::new("");

    let engine = engine(&project, config(&ports, false));
    engine.start().await;
    engine.start_instance("main", None).await.unwrap();
    let pid = engine.instance_status("main").unwrap().active.unwrap().pid;
    engine.shutdown().await;

    assert!(wait_until(Duration::from_secs(5), || !is_process_alive(pid)).await);
    assert!(SessionRecord::load(engine.state_dir(), "main").is_none());
}
