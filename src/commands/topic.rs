use anyhow::Result;
use std::time::Duration;

use crate::topic::{TopicClient, TopicParams};

pub async fn run(
    host: &str,
    port: u16,
    timeout: Duration,
    params: Vec<(String, String)>,
) -> Result<()> {
    let params: TopicParams = params.into_iter().collect();
    let reply = TopicClient::new(host).query(port, &params, timeout).await?;

    println!(
        "  reply from {}:{} in {}",
        host,
        port,
        humantime::format_duration(Duration::from_millis(reply.latency.as_millis() as u64))
    );
    if reply.params.is_empty() {
        println!("  (empty)");
    }
    for (key, value) in &reply.params {
        if value.is_empty() {
            println!("  {}", key);
        } else {
            println!("  {} = {}", key, value);
        }
    }
    Ok(())
}
