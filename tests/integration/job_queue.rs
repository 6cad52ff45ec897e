use crate::common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use warden::config::LoadedConfig;
use warden::engine::{Engine, EngineDeps};
use warden::jobs::{JobStatus, INTERRUPTED_MESSAGE};

fn project() -> TestProject {
    TestProject::new(&format!(
        r#"{}
[instances.main]
artifact = "game.dmb"
ports = [1, 2]

[instances.test]
artifact = "game.dmb"
ports = [3, 4]
"#,
        fast_engine_toml(".warden", false)
    ))
}

fn engine(project: &TestProject) -> Engine {
    let loaded = LoadedConfig::load(&project.config_path).unwrap();
    let deps = EngineDeps::from_config(&loaded);
    Engine::new(loaded.config, &loaded.base_dir, deps).unwrap()
}

#[tokio::test]
async fn concurrency_ceiling_holds_across_instances() {
    let project = project();
    let engine = engine(&project);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for i in 0..8 {
        let instance = if i % 2 == 0 { "main" } else { "test" };
        let running = running.clone();
        let peak = peak.clone();
        let id = engine
            .submit_job(instance, "compile", move |ctx| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                for p in [25, 50, 75] {
                    ctx.report_progress(p);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        ids.push(id);
    }

    assert!(
        wait_until(Duration::from_secs(10), || {
            ids.iter()
                .all(|id| engine.job_status(*id).unwrap().status == JobStatus::Succeeded)
        })
        .await
    );
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(engine.list_jobs(Some("main")).len(), 4);
    assert!(engine
        .list_jobs(None)
        .iter()
        .all(|j| j.progress_percent == Some(100) && j.ended_at.is_some()));

    engine.shutdown().await;
}

#[tokio::test]
async fn unfinished_jobs_fail_after_restart() {
    let project = project();
    let first = engine(&project);
    let running = first
        .submit_job("main", "compile", |ctx| async move {
            ctx.cancelled().await;
            anyhow::bail!("stopped")
        })
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            first.job_status(running).unwrap().status == JobStatus::Running
        })
        .await
    );

    // A second engine over the same state directory sees the job unfinished.
    let second = engine(&project);
    let job = second.job_status(running).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert!(job.ended_at.is_some());

    let next = second.submit_job("test", "compile", |_| async { Ok(()) }).unwrap();
    assert!(next > running);

    assert_eq!(first.cancel_job(running).unwrap(), JobStatus::Cancelling);
    second.shutdown().await;
}
