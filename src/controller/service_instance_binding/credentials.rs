//! Credentials Secret written for each binding.
//!
//! The Secret is not owned by the binding, so deleting the binding leaves the
//! credentials in place until their consumers are cleaned up.

use crate::constants::{BINDING_LABEL, INSTANCE_LABEL, MANAGED_BY, MANAGED_BY_LABEL};
use crate::controller::names::generate_name;
use crate::controller::service_instance::requests::params_from_secret;
use crate::crd::condition::MessageError;
use crate::crd::ServiceInstanceBinding;
use crate::osb::types::JsonObject;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::BTreeMap;

pub fn credentials_secret_name(binding: &ServiceInstanceBinding) -> String {
    generate_name(&[&binding.name_any(), "creds"])
}

/// One Secret key per credential. Strings are stored as is, anything else as
/// compact JSON.
pub fn make_credentials_secret(
    binding: &ServiceInstanceBinding,
    credentials: &JsonObject,
) -> Secret {
    let data = credentials
        .iter()
        .map(|(key, value)| {
            let raw = match value {
                Value::String(s) => s.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            };
            (key.clone(), ByteString(raw))
        })
        .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(credentials_secret_name(binding)),
            namespace: binding.namespace(),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
                (BINDING_LABEL.to_string(), binding.name_any()),
                (
                    INSTANCE_LABEL.to_string(),
                    binding.spec.instance_ref.name.clone(),
                ),
            ])),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    }
}

/// Credentials of a user-provided instance with the binding's parameters laid
/// over them
pub fn merge_credentials_secret(
    binding: &ServiceInstanceBinding,
    instance_credentials: &Secret,
    binding_params: &Secret,
) -> Result<Secret, MessageError> {
    let mut merged = params_from_secret(instance_credentials)?;
    merged.extend(params_from_secret(binding_params)?);
    Ok(make_credentials_secret(binding, &merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{binding, params_secret, BINDING_NAME, INSTANCE_NAME};
    use serde_json::json;

    fn value(secret: &Secret, key: &str) -> Option<String> {
        secret
            .data
            .as_ref()?
            .get(key)
            .map(|b| String::from_utf8_lossy(&b.0).into_owned())
    }

    #[test]
    fn test_credentials_are_flattened() {
        let credentials = json!({
            "uri": "mysql://db:3306",
            "port": 3306,
            "tls": {"enabled": true},
        });
        let Value::Object(credentials) = credentials else {
            unreachable!()
        };

        let secret = make_credentials_secret(&binding(), &credentials);

        assert_eq!(value(&secret, "uri").as_deref(), Some("mysql://db:3306"));
        assert_eq!(value(&secret, "port").as_deref(), Some("3306"));
        assert_eq!(value(&secret, "tls").as_deref(), Some(r#"{"enabled":true}"#));

        let labels = secret.metadata.labels.unwrap();
        assert_eq!(labels[BINDING_LABEL], BINDING_NAME);
        assert_eq!(labels[INSTANCE_LABEL], INSTANCE_NAME);
        assert!(secret.metadata.owner_references.is_none());
        assert!(secret
            .metadata
            .name
            .unwrap()
            .starts_with("my-binding-creds-"));
    }

    #[test]
    fn test_binding_params_override_instance_credentials() {
        let instance_creds = params_secret("creds", r#"{"user":"a","password":"p"}"#, None);
        let overrides = params_secret("overrides", r#"{"user":"b"}"#, None);

        let secret = merge_credentials_secret(&binding(), &instance_creds, &overrides).unwrap();

        assert_eq!(value(&secret, "user").as_deref(), Some("b"));
        assert_eq!(value(&secret, "password").as_deref(), Some("p"));
    }

    #[test]
    fn test_merge_rejects_invalid_json() {
        let instance_creds = params_secret("creds", "{", None);
        let overrides = params_secret("overrides", "{}", None);

        assert!(merge_credentials_secret(&binding(), &instance_creds, &overrides).is_err());
    }
}
