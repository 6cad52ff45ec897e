use crate::common::*;
use std::sync::Arc;
use std::time::Duration;
use warden::chat::ChatProvider;
use warden::config::model::WardenConfig;
use warden::engine::artifacts::DirectoryResolver;
use warden::engine::{Engine, EngineDeps};
use warden::jobs::MemoryJobStore;

fn config(ports: &[u16]) -> WardenConfig {
    toml::from_str(&format!(
        r##"{}
[instances.main]
artifact = "game.dmb"
runner = "sleep"
args = ["30"]
ports = [{}, {}]
chat_channels = ["ops"]

[instances.quiet]
artifact = "game.dmb"
runner = "sleep"
args = ["30"]
ports = [{}, {}]

[[chat.channels]]
id = "ops"
providers = {{ mem = "#ops" }}

[[chat.channels]]
id = "alerts"
providers = {{ mem = "#alerts" }}
watchdog = true
"##,
        fast_engine_toml(".warden", false),
        ports[0],
        ports[1],
        ports[2],
        ports[3]
    ))
    .unwrap()
}

#[tokio::test]
async fn lifecycle_events_reach_configured_channels() {
    let ports = free_ports(4);
    let project = TestProject::new("");
    let chat = MemoryProvider::new("mem");
    let deps = EngineDeps {
        job_store: Arc::new(MemoryJobStore::default()),
        artifacts: Arc::new(DirectoryResolver::default()),
        providers: vec![chat.clone() as Arc<dyn ChatProvider>],
        command_handler: None,
        link: Arc::new(ScriptedLink::default()),
    };
    let engine = Engine::new(config(&ports), project.dir.path(), deps).unwrap();
    engine.start().await;
    assert!(wait_until(Duration::from_secs(5), || chat.joined.lock().unwrap().len() == 2).await);
    engine.start_instance("main", None).await.unwrap();

    let online = format!("[main] online on port {}", ports[0]);
    assert!(
        wait_until(Duration::from_secs(5), || chat.sent_to("#ops").contains(&online)).await,
        "{:?}",
        chat.sent.lock().unwrap()
    );
    let mut joined = chat.joined.lock().unwrap().clone();
    joined.sort();
    assert_eq!(joined, vec!["#alerts", "#ops"]);

    // Instances without their own channels report to watchdog channels.
    engine.start_instance("quiet", None).await.unwrap();
    let quiet = format!("[quiet] online on port {}", ports[2]);
    assert!(wait_until(Duration::from_secs(5), || chat.sent_to("#alerts").contains(&quiet)).await);
    assert!(!chat.sent_to("#ops").contains(&quiet));

    chat.inject("#ops", "alice", "warden: status main");
    let reply = format!("main: online on port {}", ports[0]);
    assert!(
        wait_until(Duration::from_secs(5), || chat.sent_to("#ops").contains(&reply)).await,
        "{:?}",
        chat.sent_to("#ops")
    );

    // Plain chatter is not a command.
    let before = chat.sent.lock().unwrap().len();
    chat.inject("#ops", "alice", "status");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(chat.sent.lock().unwrap().len(), before);

    engine.shutdown().await;
    assert!(chat.sent_to("#ops").contains(&"[main] offline".to_string()));
    assert!(!chat.connected());
}
