//! Image registry pull secrets

use base64ct::{Base64, Encoding};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::client::ClusterOps;
use crate::domain::entities::RegistryNamespace;
use crate::error::Result;

pub const DEFAULT_REGISTRY_SECRET: &str = "default-registry-secret";
const REGISTRY_SECRET_SUFFIX: &str = "registry-secret";
const DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

fn registry_host(reg_addr: &str) -> &str {
    reg_addr
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
}

/// Registries whose address (and namespace, if any) prefixes the image
pub fn matched_registries(image: &str, registries: &[RegistryNamespace]) -> Vec<RegistryNamespace> {
    registries
        .iter()
        .filter(|registry| {
            let host = registry_host(&registry.reg_addr);
            if host.is_empty() {
                return false;
            }
            let prefix = if registry.namespace.is_empty() {
                host.to_string()
            } else {
                format!("{}/{}", host, registry.namespace)
            };
            image.starts_with(&prefix)
        })
        .cloned()
        .collect()
}

/// Name of the pull secret provisioned for a registry
pub fn registry_secret_name(registry: &RegistryNamespace) -> String {
    if registry.is_default {
        return DEFAULT_REGISTRY_SECRET.to_string();
    }
    let source = if registry.id.is_empty() {
        registry_host(&registry.reg_addr)
    } else {
        registry.id.as_str()
    };
    let sanitized: String = source
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{}-{}", sanitized.trim_matches('-'), REGISTRY_SECRET_SUFFIX)
}

pub fn build_registry_secret(namespace: &str, registry: &RegistryNamespace) -> Result<Secret> {
    let auth = Base64::encode_string(
        format!("{}:{}", registry.access_key, registry.secret_key).as_bytes(),
    );
    let mut auths = serde_json::Map::new();
    auths.insert(
        registry_host(&registry.reg_addr).to_string(),
        json!({
            "username": registry.access_key,
            "password": registry.secret_key,
            "auth": auth,
        }),
    );
    let config = json!({ "auths": auths });

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(registry_secret_name(registry)),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "rustci".to_string(),
            )])),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_JSON_KEY.to_string(),
            ByteString(serde_json::to_vec(&config)?),
        )])),
        ..Default::default()
    })
}

/// Create or update one pull secret per registry in `namespace`
pub async fn ensure_registry_secrets(
    namespace: &str,
    registries: &[RegistryNamespace],
    ops: &dyn ClusterOps,
) -> Result<()> {
    for registry in registries {
        let secret = build_registry_secret(namespace, registry)?;
        ops.apply_secret(&secret).await?;
        debug!(
            namespace = %namespace,
            secret = ?secret.metadata.name,
            "🔐 Registry secret applied"
        );
    }
    if !registries.is_empty() {
        info!(
            namespace = %namespace,
            cluster = %ops.cluster_id(),
            "✅ {} registry secret(s) ensured",
            registries.len()
        );
    }
    Ok(())
}
