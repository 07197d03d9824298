//! JSON service client configuration.
//!
//! A client config describes, per service interface, named retry code sets,
//! named retry parameter sets and per-method timeout/retry/bundling choices:
//!
//! ```json
//! {
//!   "interfaces": {
//!     "example.v1.Echo": {
//!       "retry_codes": { "idempotent": ["UNAVAILABLE", "DEADLINE_EXCEEDED"] },
//!       "retry_params": {
//!         "default": {
//!           "initial_retry_delay_millis": 100,
//!           "retry_delay_multiplier": 1.3,
//!           "max_retry_delay_millis": 60000,
//!           "total_timeout_millis": 600000
//!         }
//!       },
//!       "methods": {
//!         "Echo": {
//!           "timeout_millis": 60000,
//!           "retry_codes_name": "idempotent",
//!           "retry_params_name": "default"
//!         }
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! [`construct_settings`] turns one interface into a [`CallSettings`] per
//! method, applying an optional overrides config of the same shape.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::{
    BackoffSettings, BundleOptions, CallSettings, Code, GaxError, OtherArgs, Result,
    RetryOptionsPatch,
};

/// Top-level client config document.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub interfaces: HashMap<String, InterfaceConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub retry_codes: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub retry_params: HashMap<String, RetryParams>,
    #[serde(default)]
    pub methods: HashMap<String, MethodConfig>,
}

/// Backoff parameters as written in a client config. Absent delay fields
/// take the library defaults.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RetryParams {
    pub initial_retry_delay_millis: Option<u64>,
    pub retry_delay_multiplier: Option<f64>,
    pub max_retry_delay_millis: Option<u64>,
    pub initial_rpc_timeout_millis: Option<u64>,
    pub rpc_timeout_multiplier: Option<f64>,
    pub max_rpc_timeout_millis: Option<u64>,
    pub total_timeout_millis: Option<u64>,
    pub max_retries: Option<u32>,
}

impl RetryParams {
    pub fn to_backoff_settings(&self) -> BackoffSettings {
        let defaults = BackoffSettings::default();
        BackoffSettings {
            initial_retry_delay_millis: self
                .initial_retry_delay_millis
                .unwrap_or(defaults.initial_retry_delay_millis),
            retry_delay_multiplier: self
                .retry_delay_multiplier
                .unwrap_or(defaults.retry_delay_multiplier),
            max_retry_delay_millis: self
                .max_retry_delay_millis
                .unwrap_or(defaults.max_retry_delay_millis),
            initial_rpc_timeout_millis: self.initial_rpc_timeout_millis,
            rpc_timeout_multiplier: self.rpc_timeout_multiplier,
            max_rpc_timeout_millis: self.max_rpc_timeout_millis,
            total_timeout_millis: self.total_timeout_millis,
            max_retries: self.max_retries,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MethodConfig {
    pub timeout_millis: Option<u64>,
    pub retry_codes_name: Option<String>,
    pub retry_params_name: Option<String>,
    /// `Some(None)` is an explicit `null`, which disables bundling when
    /// used in an overrides config.
    #[serde(default, deserialize_with = "present")]
    pub bundling: Option<Option<BundleOptions>>,
}

fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| GaxError::invalid_argument(format!("invalid client config: {err}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            GaxError::invalid_argument(format!(
                "client config {} could not be read: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&content)
    }
}

/// Builds the [`CallSettings`] of every method of `service_name`, keyed by the
/// snake_case method name.
///
/// Returns `Ok(None)` when the config has no such interface.
pub fn construct_settings(
    service_name: &str,
    client_config: &ClientConfig,
    overrides: Option<&ClientConfig>,
    other_args: &OtherArgs,
) -> Result<Option<HashMap<String, CallSettings>>> {
    let Some(service) = client_config.interfaces.get(service_name) else {
        return Ok(None);
    };
    let service_overrides = overrides.and_then(|config| config.interfaces.get(service_name));

    let mut settings = HashMap::with_capacity(service.methods.len());
    for (method_name, method) in &service.methods {
        let mut retry = construct_retry(method, service, None)?.apply(None);
        let mut bundling = method.bundling.clone().flatten();
        let mut timeout = method.timeout_millis;

        if let Some(overriding) =
            service_overrides.and_then(|overrides| overrides.methods.get(method_name))
        {
            if let Some(replacement) = &overriding.bundling {
                bundling = replacement.clone();
            }
            if let Some(millis) = overriding.timeout_millis {
                timeout = Some(millis);
            }
            let overrides = service_overrides.unwrap_or(service);
            let patch = construct_retry(overriding, overrides, Some(service))?;
            retry = patch.apply(retry.as_ref());
        }

        if let Some(retry) = &retry {
            retry.backoff_settings.validate()?;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(service = service_name, method = %method_name, "constructed call settings");

        settings.insert(
            to_snake_case(method_name),
            CallSettings {
                timeout: timeout.map(Duration::from_millis),
                retry,
                bundle_options: bundling,
                api_name: service_name.to_owned(),
                other_args: other_args.clone(),
                ..CallSettings::default()
            },
        );
    }
    Ok(Some(settings))
}

/// Retry fields named by `method`, resolved in `interface` and then in
/// `fallback`.
fn construct_retry(
    method: &MethodConfig,
    interface: &InterfaceConfig,
    fallback: Option<&InterfaceConfig>,
) -> Result<RetryOptionsPatch> {
    let mut patch = RetryOptionsPatch::default();
    if let Some(name) = &method.retry_codes_name {
        let names = interface
            .retry_codes
            .get(name)
            .or_else(|| fallback.and_then(|f| f.retry_codes.get(name)))
            .ok_or_else(|| GaxError::invalid_argument(format!("unknown retry_codes_name '{name}'")))?;
        let codes = names
            .iter()
            .map(|code| {
                Code::from_name(code)
                    .ok_or_else(|| GaxError::invalid_argument(format!("unknown status code '{code}'")))
            })
            .collect::<Result<Vec<_>>>()?;
        patch.retry_codes = Some(codes);
    }
    if let Some(name) = &method.retry_params_name {
        let params = interface
            .retry_params
            .get(name)
            .or_else(|| fallback.and_then(|f| f.retry_params.get(name)))
            .ok_or_else(|| GaxError::invalid_argument(format!("unknown retry_params_name '{name}'")))?;
        patch.backoff_settings = Some(params.to_backoff_settings());
    }
    Ok(patch)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (idx, ch) in name.char_indices() {
        if ch.is_ascii_uppercase() {
            if idx > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{construct_settings, to_snake_case, ClientConfig};
    use crate::{Code, OtherArgs};

    const CONFIG: &str = r#"{
        "interfaces": {
            "example.v1.Echo": {
                "retry_codes": {
                    "idempotent": ["UNAVAILABLE", "DEADLINE_EXCEEDED"],
                    "non_idempotent": []
                },
                "retry_params": {
                    "default": {
                        "initial_retry_delay_millis": 100,
                        "retry_delay_multiplier": 1.3,
                        "max_retry_delay_millis": 60000,
                        "initial_rpc_timeout_millis": 20000,
                        "rpc_timeout_multiplier": 1.0,
                        "max_rpc_timeout_millis": 20000,
                        "total_timeout_millis": 600000
                    }
                },
                "methods": {
                    "Echo": {
                        "timeout_millis": 60000,
                        "retry_codes_name": "idempotent",
                        "retry_params_name": "default"
                    },
                    "PublishEvents": {
                        "timeout_millis": 30000,
                        "retry_codes_name": "non_idempotent",
                        "retry_params_name": "default",
                        "bundling": {
                            "element_count_threshold": 100,
                            "request_byte_threshold": 1048576,
                            "delay_threshold_millis": 10
                        }
                    }
                }
            }
        }
    }"#;

    #[test]
    fn builds_settings_per_method() {
        let config = ClientConfig::from_json_str(CONFIG).expect("valid config");
        let settings = construct_settings("example.v1.Echo", &config, None, &OtherArgs::new())
            .expect("constructs")
            .expect("interface exists");

        let echo = &settings["echo"];
        assert_eq!(echo.timeout, Some(Duration::from_secs(60)));
        assert_eq!(echo.api_name, "example.v1.Echo");
        let retry = echo.retry.as_ref().expect("retry configured");
        assert_eq!(retry.retry_codes, vec![Code::Unavailable, Code::DeadlineExceeded]);
        assert_eq!(retry.backoff_settings.initial_rpc_timeout_millis, Some(20_000));

        let publish = &settings["publish_events"];
        let bundling = publish.bundle_options.as_ref().expect("bundling configured");
        assert_eq!(bundling.element_count_threshold, 100);
        assert_eq!(bundling.delay_threshold_millis, 10);
        assert!(publish.retry.as_ref().expect("retry configured").retry_codes.is_empty());
    }

    #[test]
    fn unknown_interface_is_none() {
        let config = ClientConfig::from_json_str(CONFIG).expect("valid config");
        let settings = construct_settings("other.Service", &config, None, &OtherArgs::new())
            .expect("constructs");
        assert!(settings.is_none());
    }

    #[test]
    fn overrides_replace_method_fields() {
        let config = ClientConfig::from_json_str(CONFIG).expect("valid config");
        let overrides = ClientConfig::from_json_str(
            r#"{
                "interfaces": {
                    "example.v1.Echo": {
                        "retry_codes": { "aggressive": ["UNAVAILABLE", "ABORTED", "INTERNAL"] },
                        "methods": {
                            "Echo": { "timeout_millis": 5000, "retry_codes_name": "aggressive" },
                            "PublishEvents": { "bundling": null }
                        }
                    }
                }
            }"#,
        )
        .expect("valid overrides");
        let settings =
            construct_settings("example.v1.Echo", &config, Some(&overrides), &OtherArgs::new())
                .expect("constructs")
                .expect("interface exists");

        let echo = &settings["echo"];
        assert_eq!(echo.timeout, Some(Duration::from_secs(5)));
        let retry = echo.retry.as_ref().expect("retry configured");
        assert_eq!(retry.retry_codes, vec![Code::Unavailable, Code::Aborted, Code::Internal]);
        assert_eq!(retry.backoff_settings.total_timeout_millis, Some(600_000));

        assert!(settings["publish_events"].bundle_options.is_none());
    }

    #[test]
    fn unknown_code_name_is_rejected() {
        let config = ClientConfig::from_json_str(
            r#"{
                "interfaces": {
                    "svc": {
                        "retry_codes": { "bad": ["NOT_A_CODE"] },
                        "methods": { "Get": { "retry_codes_name": "bad" } }
                    }
                }
            }"#,
        )
        .expect("valid json");
        let err = construct_settings("svc", &config, None, &OtherArgs::new())
            .expect_err("must reject");
        assert_eq!(err.code, Code::InvalidArgument);
    }

    #[test]
    fn method_names_become_snake_case() {
        assert_eq!(to_snake_case("ListTopics"), "list_topics");
        assert_eq!(to_snake_case("Echo"), "echo");
    }
}
