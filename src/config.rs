//! Operator configuration
//!
//! Image defaults and the available version are supplied by the
//! surrounding process at startup and are read-only afterwards. They are
//! carried in an explicit struct threaded through the controller
//! contexts; there is no process-wide mutable state.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::registry::ServiceId;

/// Environment key prefix for per-service default images
const RELATED_IMAGE_PREFIX: &str = "RELATED_IMAGE_";

/// Environment key suffix for per-service default images
const RELATED_IMAGE_SUFFIX: &str = "_URL_DEFAULT";

/// Environment variable naming the version this operator deploys
pub const AVAILABLE_VERSION_ENV: &str = "STRATUS_AVAILABLE_VERSION";

/// Static configuration for the operator process
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Version whose image defaults this operator ships
    pub available_version: String,

    /// Default container image per service name
    pub image_defaults: BTreeMap<String, String>,
}

impl OperatorConfig {
    /// Build configuration from an environment-style key/value map.
    ///
    /// Image defaults are read from `RELATED_IMAGE_<SERVICE>_URL_DEFAULT`
    /// keys; keys that do not name a known service are logged and
    /// skipped rather than failing startup, so an operator image can
    /// carry defaults for services this build does not manage.
    pub fn from_env_map(
        available_version: impl Into<String>,
        env: &BTreeMap<String, String>,
    ) -> Self {
        let mut image_defaults = BTreeMap::new();

        for (key, value) in env {
            let Some(service) = related_image_service(key) else {
                continue;
            };
            match service.parse::<ServiceId>() {
                Ok(id) => {
                    debug!(service = %id, image = %value, "registered image default");
                    image_defaults.insert(id.as_str().to_string(), value.clone());
                }
                Err(_) => {
                    warn!(key = %key, "image default does not match a managed service, skipping");
                }
            }
        }

        Self {
            available_version: available_version.into(),
            image_defaults,
        }
    }

    /// Build configuration from the process environment
    pub fn from_process_env() -> crate::Result<Self> {
        let available_version = std::env::var(AVAILABLE_VERSION_ENV).map_err(|_| {
            crate::Error::validation(format!("{AVAILABLE_VERSION_ENV} must be set"))
        })?;
        let env: BTreeMap<String, String> = std::env::vars().collect();
        Ok(Self::from_env_map(available_version, &env))
    }

    /// Default image for a service, if configured
    pub fn default_image(&self, id: ServiceId) -> Option<&String> {
        self.image_defaults.get(id.as_str())
    }
}

/// Extract the lowercase service name from a
/// `RELATED_IMAGE_<SERVICE>_URL_DEFAULT` key, or None if the key has a
/// different shape.
fn related_image_service(key: &str) -> Option<String> {
    let rest = key.strip_prefix(RELATED_IMAGE_PREFIX)?;
    let name = rest.strip_suffix(RELATED_IMAGE_SUFFIX)?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_related_image_keys() {
        let config = OperatorConfig::from_env_map(
            "1.1.0",
            &env(&[
                ("RELATED_IMAGE_BROKER_URL_DEFAULT", "registry.example/broker:1.1.0"),
                ("RELATED_IMAGE_IDENTITY_URL_DEFAULT", "registry.example/identity:1.1.0"),
                ("PATH", "/usr/bin"),
            ]),
        );

        assert_eq!(config.available_version, "1.1.0");
        assert_eq!(
            config.default_image(ServiceId::Broker).unwrap(),
            "registry.example/broker:1.1.0"
        );
        assert_eq!(
            config.default_image(ServiceId::Identity).unwrap(),
            "registry.example/identity:1.1.0"
        );
        assert!(config.default_image(ServiceId::Cache).is_none());
    }

    #[test]
    fn unknown_service_keys_are_skipped() {
        let config = OperatorConfig::from_env_map(
            "1.1.0",
            &env(&[("RELATED_IMAGE_TELEMETRY_URL_DEFAULT", "registry.example/t:1")]),
        );
        assert!(config.image_defaults.is_empty());
    }

    #[test]
    fn key_shape_must_match_exactly() {
        assert_eq!(
            related_image_service("RELATED_IMAGE_BROKER_URL_DEFAULT").as_deref(),
            Some("broker")
        );
        assert!(related_image_service("RELATED_IMAGE_URL_DEFAULT").is_none());
        assert!(related_image_service("RELATED_IMAGE_BROKER").is_none());
        assert!(related_image_service("IMAGE_BROKER_URL_DEFAULT").is_none());
    }
}
