//! Event monitor thread for the Swarm backend.
//!
//! Consumes the Docker event stream and advances `backend_status` in the
//! state store. Nothing else writes that field.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;

use zoe_definitions::state::{BackendStatus, StateStore};

use super::api_client::SwarmClient;

pub struct SwarmMonitor {
    quit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SwarmMonitor {
    pub fn start(client: SwarmClient, state: Arc<StateStore>, deployment_name: &str) -> SwarmMonitor {
        let quit = Arc::new(AtomicBool::new(false));
        let thread_quit = quit.clone();
        let deployment = deployment_name.to_string();
        let handle = thread::Builder::new()
            .name("swarm_monitor".to_string())
            .spawn(move || {
                while !thread_quit.load(Ordering::Relaxed) {
                    let result = client.consume_events(&deployment, |event| {
                        if thread_quit.load(Ordering::Relaxed) {
                            return false;
                        }
                        handle_event(&state, event);
                        true
                    });
                    if thread_quit.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = result {
                        warn!("Swarm closed the event connection, retrying: {}", e);
                        thread::sleep(Duration::from_secs(1));
                    }
                }
                debug!("Swarm monitor thread terminated");
            })
            .expect("cannot spawn the Swarm monitor thread");
        SwarmMonitor {
            quit,
            handle: Some(handle),
        }
    }

    pub fn quit(mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn status_for_action(action: &str) -> Option<BackendStatus> {
    match action {
        "create" => Some(BackendStatus::Start),
        "start" => Some(BackendStatus::Started),
        "die" | "oom" | "kill" => Some(BackendStatus::Die),
        "destroy" => Some(BackendStatus::Destroy),
        _ => None,
    }
}

fn handle_event(state: &StateStore, event: &Value) {
    let action = match event["Action"].as_str().or_else(|| event["status"].as_str()) {
        Some(action) => action,
        None => return,
    };
    let status = match status_for_action(action) {
        Some(status) => status,
        None => return,
    };
    let service_id: i32 = match event["Actor"]["Attributes"]["zoe.service.id"]
        .as_str()
        .and_then(|s| s.parse().ok())
    {
        Some(id) => id,
        None => {
            debug!("Container event '{}' without a service id label", action);
            return;
        }
    };
    debug!("Service {} backend event: {}", service_id, action);
    if let Err(e) = state.services().update_backend_status(service_id, status) {
        error!("Cannot record backend status for service {}: {}", service_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_actions_map_to_backend_states() {
        assert_eq!(status_for_action("create"), Some(BackendStatus::Start));
        assert_eq!(status_for_action("start"), Some(BackendStatus::Started));
        assert_eq!(status_for_action("die"), Some(BackendStatus::Die));
        assert_eq!(status_for_action("oom"), Some(BackendStatus::Die));
        assert_eq!(status_for_action("destroy"), Some(BackendStatus::Destroy));
        assert_eq!(status_for_action("attach"), None);
    }
}
