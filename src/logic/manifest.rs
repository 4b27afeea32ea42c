//! HTTP logic manifest, the module format the coordinator ships.
//!
//! The logic file is a JSON document mapping each capability to a portal
//! endpoint. `{placeholder}` tokens in paths and string body leaves are filled
//! from the call's variables (credentials, limit, meter fields).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::{CapabilityError, LogicError};
use crate::logic::capability::{
    BatchProcessor, Capability, CapabilitySet, Credentials, InventoryLister, LoginOutcome,
    LoginVerifier, MeterLookup, MeterVerifier, ProgressSink, ProgressUpdate,
};
use crate::logic::module::ModuleCompiler;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Parsed logic manifest.
#[derive(Debug, Clone, Deserialize)]
pub struct LogicManifest {
    #[serde(default)]
    pub name: Option<String>,
    pub base_url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub capabilities: HashMap<String, EndpointSpec>,
}

/// One portal endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Compiles manifests into HTTP-backed capabilities.
#[derive(Default)]
pub struct ManifestCompiler;

impl ManifestCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleCompiler for ManifestCompiler {
    fn compile(&self, content: &[u8]) -> Result<CapabilitySet, LogicError> {
        let manifest: LogicManifest = serde_json::from_slice(content)
            .map_err(|e| LogicError::Compile(format!("invalid manifest: {e}")))?;
        let portal = Arc::new(HttpPortal::from_manifest(&manifest)?);

        let mut set = CapabilitySet::new();
        for capability in portal.endpoints.keys() {
            match capability {
                Capability::ProcessBatch => set.process_batch = Some(portal.clone()),
                Capability::VerifyLoginDetails => set.verify_login_details = Some(portal.clone()),
                Capability::GetInventoryList => set.get_inventory_list = Some(portal.clone()),
                Capability::VerifyMeter => set.verify_meter = Some(portal.clone()),
            }
        }

        tracing::debug!(
            name = manifest.name.as_deref().unwrap_or("unnamed"),
            base_url = %portal.base_url,
            capabilities = ?set,
            "Compiled logic manifest"
        );
        Ok(set)
    }
}

/// Capability implementation backed by a remote portal.
pub struct HttpPortal {
    client: reqwest::Client,
    base_url: String,
    endpoints: HashMap<Capability, Endpoint>,
}

struct Endpoint {
    method: Method,
    path: String,
    body: Option<Value>,
}

type Vars = HashMap<String, String>;

impl HttpPortal {
    fn from_manifest(manifest: &LogicManifest) -> Result<Self, LogicError> {
        let base_url = manifest.base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(LogicError::Compile(format!(
                "base_url must be http(s), got {base_url}"
            )));
        }

        let mut endpoints = HashMap::new();
        for (name, spec) in &manifest.capabilities {
            let capability = Capability::from_name(name)
                .ok_or_else(|| LogicError::Compile(format!("unknown capability {name}")))?;
            let method = Method::from_bytes(spec.method.to_ascii_uppercase().as_bytes())
                .map_err(|_| {
                    LogicError::Compile(format!("invalid method {} for {name}", spec.method))
                })?;
            endpoints.insert(
                capability,
                Endpoint {
                    method,
                    path: spec.path.clone(),
                    body: spec.body.clone(),
                },
            );
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &manifest.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| LogicError::Compile(format!("invalid header {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| LogicError::Compile(format!("invalid header value for {key}: {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(
                manifest.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ))
            .default_headers(headers)
            .build()
            .map_err(|e| LogicError::Compile(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            endpoints,
        })
    }

    async fn call(
        &self,
        capability: Capability,
        vars: &Vars,
        cookies: Option<&Value>,
    ) -> Result<reqwest::Response, CapabilityError> {
        let endpoint = self.endpoints.get(&capability).ok_or_else(|| {
            CapabilityError::Failed(format!("{capability} is not declared in the manifest"))
        })?;

        let url = format!("{}{}", self.base_url, render(&endpoint.path, vars));
        let mut request = self.client.request(endpoint.method.clone(), &url);
        if let Some(cookie) = cookies.and_then(cookie_header) {
            request = request.header(COOKIE, cookie);
        }
        if let Some(body) = &endpoint.body {
            request = request.json(&render_value(body, vars));
        }

        tracing::debug!(capability = %capability, method = %endpoint.method, url = %url, "Portal request");
        Ok(request.send().await?)
    }
}

#[async_trait]
impl LoginVerifier for HttpPortal {
    async fn verify_login_details(
        &self,
        credentials: &Credentials,
    ) -> Result<LoginOutcome, CapabilityError> {
        let vars = credential_vars(credentials);
        let response = self
            .call(Capability::VerifyLoginDetails, &vars, None)
            .await?;

        let status = response.status();
        let cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        let body: Map<String, Value> = response.json().await.unwrap_or_default();

        let body_success = body.get("success").and_then(Value::as_bool).unwrap_or(true);
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);

        if !status.is_success() || !body_success {
            let mut outcome = LoginOutcome::failed(
                message.unwrap_or_else(|| format!("portal returned {status}")),
            );
            outcome.extra = strip_login_fields(body);
            return Ok(outcome);
        }

        let mut outcome = LoginOutcome::succeeded(Value::String(cookies.join("; ")));
        outcome.message = message;
        outcome.extra = strip_login_fields(body);
        Ok(outcome)
    }
}

#[async_trait]
impl BatchProcessor for HttpPortal {
    async fn process_batch(
        &self,
        credentials: &Credentials,
        meters: &[Value],
        progress: &dyn ProgressSink,
    ) -> Result<Value, CapabilityError> {
        let cookies = if self.endpoints.contains_key(&Capability::VerifyLoginDetails) {
            let login = self.verify_login_details(credentials).await?;
            if !login.success {
                return Err(CapabilityError::Failed(format!(
                    "Login Failed: {}",
                    login.message.unwrap_or_default()
                )));
            }
            login.cookies
        } else {
            Value::Null
        };

        let total = meters.len() as u64;
        progress.report(ProgressUpdate::new(0, total, "Starting"));

        let mut succeeded = 0u64;
        let mut errors = Vec::new();
        for (index, meter) in meters.iter().enumerate() {
            let mut vars = credential_vars(credentials);
            vars.extend(meter_vars(meter));
            let label = vars
                .get("meterNo")
                .cloned()
                .unwrap_or_else(|| format!("#{}", index + 1));

            match self
                .call(Capability::ProcessBatch, &vars, Some(&cookies))
                .await
            {
                Ok(response) if response.status().is_success() => succeeded += 1,
                Ok(response) => errors.push(json!({
                    "meter": label,
                    "error": format!("portal returned {}", response.status()),
                })),
                Err(e) => errors.push(json!({ "meter": label, "error": e.to_string() })),
            }

            progress.report(ProgressUpdate::new(
                index as u64 + 1,
                total,
                format!("Posted {label}"),
            ));
        }

        Ok(json!({
            "status": "completed",
            "total": total,
            "success": succeeded,
            "failed": errors.len(),
            "errors": errors,
        }))
    }
}

#[async_trait]
impl InventoryLister for HttpPortal {
    async fn get_inventory_list(
        &self,
        cookies: &Value,
        limit: u64,
    ) -> Result<Vec<Value>, CapabilityError> {
        let vars = Vars::from([("limit".to_string(), limit.to_string())]);
        let response = self
            .call(Capability::GetInventoryList, &vars, Some(cookies))
            .await?;
        let url = response.url().to_string();
        let response = response.error_for_status()?;

        let mut items = match response.json::<Value>().await? {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("data") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(CapabilityError::InvalidResponse {
                        url,
                        reason: "expected an array or an object with a data array".to_string(),
                    });
                }
            },
            other => {
                return Err(CapabilityError::InvalidResponse {
                    url,
                    reason: format!("expected an array, got {other}"),
                });
            }
        };
        items.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(items)
    }
}

#[async_trait]
impl MeterVerifier for HttpPortal {
    async fn verify_meter(
        &self,
        cookies: &Value,
        meter_no: &str,
    ) -> Result<MeterLookup, CapabilityError> {
        let vars = Vars::from([("meterNo".to_string(), meter_no.to_string())]);
        let response = self
            .call(Capability::VerifyMeter, &vars, Some(cookies))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(MeterLookup::not_found()),
            s if s.is_success() => {
                let data = response.json::<Value>().await.unwrap_or(Value::Null);
                Ok(MeterLookup::found(data))
            }
            s => Err(CapabilityError::InvalidResponse {
                url: response.url().to_string(),
                reason: format!("portal returned {s}"),
            }),
        }
    }
}

fn credential_vars(credentials: &Credentials) -> Vars {
    Vars::from([
        ("userid".to_string(), credentials.userid.clone()),
        ("password".to_string(), credentials.password.clone()),
    ])
}

/// Scalar fields of a meter object become template variables.
fn meter_vars(meter: &Value) -> Vars {
    match meter {
        Value::Object(fields) => fields
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|s| (k.clone(), s)))
            .collect(),
        other => scalar_to_string(other)
            .map(|s| Vars::from([("meterNo".to_string(), s)]))
            .unwrap_or_default(),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn cookie_header(cookies: &Value) -> Option<String> {
    match cookies {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let joined: Vec<String> = parts.iter().filter_map(scalar_to_string).collect();
            (!joined.is_empty()).then(|| joined.join("; "))
        }
        other => Some(other.to_string()),
    }
}

fn strip_login_fields(mut body: Map<String, Value>) -> Map<String, Value> {
    for key in ["success", "message", "cookies"] {
        body.remove(key);
    }
    body
}

/// Replace every `{name}` with its variable in one left-to-right pass.
/// Unknown names are left as-is and substituted text is never rescanned.
fn render(template: &str, vars: &Vars) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail[1..].find(['{', '}']) {
            Some(end) if tail.as_bytes()[end + 1] == b'}' => {
                let name = &tail[1..end + 1];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&tail[..end + 2]),
                }
                rest = &tail[end + 2..];
            }
            _ => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_value(value: &Value, vars: &Vars) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, vars)).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), render_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "name": "portal-v3",
        "base_url": "https://portal.example/",
        "capabilities": {
            "verifyLoginDetails": {"method": "post", "path": "/login",
                                   "body": {"user": "{userid}", "pass": "{password}"}},
            "processBatch": {"method": "POST", "path": "/meters/{meterNo}/reading",
                             "body": {"reading": "{reading}"}},
            "verifyMeter": {"path": "/meters/{meterNo}"}
        }
    }"#;

    #[test]
    fn compiles_declared_capabilities() {
        let set = ManifestCompiler::new().compile(MANIFEST.as_bytes()).unwrap();
        assert!(set.has(Capability::ProcessBatch));
        assert!(set.has(Capability::VerifyLoginDetails));
        assert!(set.has(Capability::VerifyMeter));
        assert!(!set.has(Capability::GetInventoryList));
        assert!(set.missing_required().is_empty());
    }

    #[test]
    fn manifest_without_process_batch_compiles_but_is_incomplete() {
        let set = ManifestCompiler::new()
            .compile(
                br#"{"base_url": "http://p", "capabilities": {"verifyMeter": {"path": "/m"}}}"#,
            )
            .unwrap();
        assert_eq!(set.missing_required(), vec![Capability::ProcessBatch]);
    }

    #[test]
    fn rejects_invalid_json() {
        let err = ManifestCompiler::new().compile(b"module.exports = {}").unwrap_err();
        assert!(matches!(err, LogicError::Compile(_)));
    }

    #[test]
    fn rejects_unknown_capability() {
        let err = ManifestCompiler::new()
            .compile(br#"{"base_url": "http://p", "capabilities": {"wipeDisk": {"path": "/"}}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("wipeDisk"));
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(
            ManifestCompiler::new()
                .compile(br#"{"base_url": "ftp://p", "capabilities": {}}"#)
                .is_err()
        );
    }

    #[test]
    fn render_substitutes_known_placeholders() {
        let vars = Vars::from([
            ("meterNo".to_string(), "M-42".to_string()),
            ("limit".to_string(), "50".to_string()),
        ]);
        assert_eq!(
            render("/meters/{meterNo}?limit={limit}&x={other}", &vars),
            "/meters/M-42?limit=50&x={other}"
        );
    }

    #[test]
    fn render_does_not_expand_substituted_values() {
        let vars = Vars::from([
            ("userid".to_string(), "{password}".to_string()),
            ("password".to_string(), "hunter2".to_string()),
        ]);
        for _ in 0..50 {
            let rendered = render("/login?user={userid}", &vars);
            assert_eq!(rendered, "/login?user={password}");
        }
    }

    #[test]
    fn render_handles_stray_braces() {
        let vars = Vars::from([("a".to_string(), "1".to_string())]);
        assert_eq!(render("{{a}} {a {} }{", &vars), "{1} {a {} }{");
    }

    #[test]
    fn render_value_walks_nested_bodies() {
        let vars = Vars::from([("userid".to_string(), "u1".to_string())]);
        let body = json!({"auth": {"user": "{userid}", "keep": 7}, "list": ["{userid}"]});
        assert_eq!(
            render_value(&body, &vars),
            json!({"auth": {"user": "u1", "keep": 7}, "list": ["u1"]})
        );
    }

    #[test]
    fn meter_vars_from_object_and_scalar() {
        let vars = meter_vars(&json!({"meterNo": "M-1", "reading": 120.5, "note": null}));
        assert_eq!(vars.get("meterNo").map(String::as_str), Some("M-1"));
        assert_eq!(vars.get("reading").map(String::as_str), Some("120.5"));
        assert!(!vars.contains_key("note"));

        let vars = meter_vars(&json!("M-9"));
        assert_eq!(vars.get("meterNo").map(String::as_str), Some("M-9"));
    }

    #[test]
    fn cookie_header_forms() {
        assert_eq!(cookie_header(&Value::Null), None);
        assert_eq!(cookie_header(&json!("")), None);
        assert_eq!(cookie_header(&json!("sid=1")), Some("sid=1".to_string()));
        assert_eq!(
            cookie_header(&json!(["sid=1", "lang=en"])),
            Some("sid=1; lang=en".to_string())
        );
    }
}
