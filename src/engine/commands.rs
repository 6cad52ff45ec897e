use std::fmt::Write as _;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::chat::{CommandHandler, Message};

use super::{Engine, Inner};

/// Answers `version` and `status [instance]` from chat.
pub struct BuiltinCommands {
    engine: Weak<Inner>,
}

impl BuiltinCommands {
    pub fn new(engine: &Engine) -> Self {
        Self {
            engine: Arc::downgrade(&engine.inner),
        }
    }

    fn status(engine: &Engine, filter: Option<&str>) -> String {
        let ids: Vec<String> = match filter {
            Some(id) => vec![id.to_string()],
            None => engine.instances(),
        };
        if ids.is_empty() {
            return "no instances configured".to_string();
        }
        let mut out = String::new();
        for id in ids {
            if !out.is_empty() {
                out.push('\n');
            }
            match engine.instance_status(&id) {
                Ok(status) => {
                    let _ = write!(out, "{}: {}", id, status.state);
                    if let Some(active) = &status.active {
                        let _ = write!(out, " on port {}", active.port);
                    }
                    let running = engine
                        .list_jobs(Some(&id))
                        .iter()
                        .filter(|j| !j.status.is_terminal())
                        .count();
                    if running > 0 {
                        let _ = write!(out, ", {} job(s) pending", running);
                    }
                }
                Err(_) => {
                    let _ = write!(out, "{}: unknown instance", id);
                }
            }
        }
        out
    }
}

#[async_trait]
impl CommandHandler for BuiltinCommands {
    async fn handle(&self, message: &Message) -> Option<String> {
        let inner = self.engine.upgrade()?;
        let engine = Engine { inner };
        let command = message.command.as_deref()?;
        let mut words = command.split_whitespace();
        match words.next()? {
            "version" => Some(format!("warden {}", env!("CARGO_PKG_VERSION"))),
            "status" => Some(Self::status(&engine, words.next())),
            _ => None,
        }
    }
}
