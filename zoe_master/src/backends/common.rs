use std::collections::BTreeMap;

use zoe_definitions::state::{Execution, Service, User};
use zoe_definitions::structs::VolumeBind;
use zoe_definitions::Config;

use crate::workspace::{FsWorkspace, WORKSPACE_MOUNT_POINT};

/// The substitution context available to env values and commands
///
/// The API collaborator can store the uploaded binary URL in the description
/// under `application_binary`; it surfaces here as the token of the same name.
pub fn build_subst_dict(execution: &Execution, owner: &User, config: &Config) -> BTreeMap<&'static str, String> {
    let mut dict = BTreeMap::new();
    dict.insert("execution_id", execution.id.to_string());
    dict.insert("execution_name", execution.name.clone());
    dict.insert("user_id", owner.id.to_string());
    dict.insert("user_name", owner.username.clone());
    dict.insert("name_prefix", config.deployment_name.clone());
    dict.insert("deployment_name", config.deployment_name.clone());
    let binary = execution
        .description
        .extra
        .get("application_binary")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    dict.insert("application_binary", binary.to_string());
    dict
}

/// Replace every `{token}` with its value; unknown tokens stay untouched
pub fn substitute(value: &str, dict: &BTreeMap<&'static str, String>) -> String {
    let mut out = value.to_string();
    for (token, replacement) in dict {
        out = out.replace(&format!("{{{}}}", token), replacement);
    }
    out
}

/// The labels applied to every container belonging to a deployment
pub fn gen_labels(
    execution: &Execution,
    service: &Service,
    owner: &User,
    config: &Config,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("zoe.execution.name".to_string(), execution.name.clone());
    labels.insert("zoe.execution.id".to_string(), execution.id.to_string());
    labels.insert("zoe.service.name".to_string(), service.name.clone());
    labels.insert("zoe.service.id".to_string(), service.id.to_string());
    labels.insert("zoe.owner".to_string(), owner.username.clone());
    labels.insert("zoe.deployment_name".to_string(), config.deployment_name.clone());
    labels.insert(
        "zoe.type".to_string(),
        format!("service_{}", if service.essential { "essential" } else { "elastic" }),
    );
    labels.insert("zoe_monitor".to_string(), service.is_monitor.to_string());
    labels
}

/// Static service environment plus the computed ZOE_* variables
pub fn gen_environment(
    execution: &Execution,
    service: &Service,
    owner: &User,
    config: &Config,
    dict: &BTreeMap<&'static str, String>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = service
        .description
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), substitute(v, dict)))
        .collect();
    env.push(("ZOE_EXECUTION_ID".to_string(), execution.id.to_string()));
    env.push(("ZOE_EXECUTION_NAME".to_string(), execution.name.clone()));
    env.push(("ZOE_SERVICE_ID".to_string(), service.id.to_string()));
    env.push(("ZOE_SERVICE_NAME".to_string(), service.name.clone()));
    env.push(("ZOE_OWNER".to_string(), owner.username.clone()));
    env.push(("ZOE_DEPLOYMENT_NAME".to_string(), config.deployment_name.clone()));
    env.push((
        "ZOE_MY_DNS_NAME".to_string(),
        service.dns_name(&config.deployment_name),
    ));
    env.push(("ZOE_WORKSPACE".to_string(), WORKSPACE_MOUNT_POINT.to_string()));
    env
}

/// Declared volumes plus the user workspace, when it exists
pub fn gen_volumes(service: &Service, owner: &User, config: &Config) -> Vec<VolumeBind> {
    let mut volumes: Vec<VolumeBind> = service.description.volumes.iter().map(VolumeBind::from).collect();
    if let Some(workspace) = FsWorkspace::new(config).get(owner) {
        volumes.push(workspace);
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_replaces_known_tokens_only() {
        let mut dict = BTreeMap::new();
        dict.insert("execution_id", "42".to_string());
        dict.insert("name_prefix", "prod".to_string());
        let out = substitute("{name_prefix}-master-{execution_id}.{unknown}", &dict);
        assert_eq!(out, "prod-master-42.{unknown}");
    }
}
