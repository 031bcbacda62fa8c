//! Pod watch thread for the Kubernetes backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::Value;

use zoe_definitions::state::{BackendStatus, StateStore};

use super::api_client::KubernetesClient;

pub struct KubernetesMonitor {
    quit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl KubernetesMonitor {
    pub fn start(client: KubernetesClient, state: Arc<StateStore>, deployment_name: &str) -> KubernetesMonitor {
        let quit = Arc::new(AtomicBool::new(false));
        let thread_quit = quit.clone();
        let deployment = deployment_name.to_string();
        let handle = thread::Builder::new()
            .name("kubernetes_monitor".to_string())
            .spawn(move || {
                while !thread_quit.load(Ordering::Relaxed) {
                    let result = client.watch_pods(&deployment, |event| {
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
                        warn!("Kubernetes closed the watch stream, retrying: {}", e);
                        thread::sleep(Duration::from_secs(1));
                    }
                }
                debug!("Kubernetes monitor thread terminated");
            })
            .expect("cannot spawn the Kubernetes monitor thread");
        KubernetesMonitor {
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

fn status_for_event(event_type: &str, phase: &str) -> Option<BackendStatus> {
    if event_type == "DELETED" {
        return Some(BackendStatus::Destroy);
    }
    match phase {
        "Pending" => Some(BackendStatus::Start),
        "Running" => Some(BackendStatus::Started),
        "Succeeded" | "Failed" => Some(BackendStatus::Die),
        _ => None,
    }
}

fn handle_event(state: &StateStore, event: &Value) {
    let pod = &event["object"];
    let service_id: i32 = match pod["metadata"]["labels"]["zoe.service.id"]
        .as_str()
        .and_then(|s| s.parse().ok())
    {
        Some(id) => id,
        None => return,
    };
    let event_type = event["type"].as_str().unwrap_or_default();
    let phase = pod["status"]["phase"].as_str().unwrap_or_default();
    if let Some(status) = status_for_event(event_type, phase) {
        debug!("Service {} pod event: {} ({})", service_id, event_type, phase);
        if let Err(e) = state.services().update_backend_status(service_id, status) {
            error!("Cannot record backend status for service {}: {}", service_id, e);
        }
    }
    if let Some(node) = pod["spec"]["nodeName"].as_str() {
        if let Err(e) = state.services().update_backend_host(service_id, node) {
            error!("Cannot record backend host for service {}: {}", service_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_phases_map_to_backend_states() {
        assert_eq!(status_for_event("ADDED", "Pending"), Some(BackendStatus::Start));
        assert_eq!(status_for_event("MODIFIED", "Running"), Some(BackendStatus::Started));
        assert_eq!(status_for_event("MODIFIED", "Failed"), Some(BackendStatus::Die));
        assert_eq!(status_for_event("DELETED", "Running"), Some(BackendStatus::Destroy));
        assert_eq!(status_for_event("MODIFIED", "Unknown"), None);
    }
}
