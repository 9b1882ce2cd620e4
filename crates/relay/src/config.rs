use std::{collections::HashMap, fs, path::Path};

use anyhow::bail;
use gateway::HttpGatewayConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayBackend {
    Memory,
    Http,
}

impl GatewayBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub gateway_backend: GatewayBackend,
    pub upstream_url: String,
    pub upstream_token: Option<String>,
    pub outbox_capacity: usize,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8787".into(),
            gateway_backend: GatewayBackend::Memory,
            upstream_url: "https://api.groupme.com/v3".into(),
            upstream_token: None,
            outbox_capacity: 64,
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Settings {
    pub fn http_gateway_config(&self) -> anyhow::Result<HttpGatewayConfig> {
        let Some(token) = self
            .upstream_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
        else {
            bail!("gateway backend 'http' requires UPSTREAM_TOKEN or upstream_token in relay.toml");
        };
        if !url_has_scheme(&self.upstream_url) {
            bail!("upstream_url '{}' must be an http(s) url", self.upstream_url);
        }
        Ok(HttpGatewayConfig {
            base_url: self.upstream_url.clone(),
            access_token: token.to_string(),
        })
    }
}

fn url_has_scheme(raw: &str) -> bool {
    raw.starts_with("http://") || raw.starts_with("https://")
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(Path::new("relay.toml")) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(raw) else {
        return;
    };
    if let Some(v) = file_cfg.get("bind_addr") {
        settings.server_bind = v.clone();
    }
    if let Some(backend) = file_cfg.get("gateway").and_then(|v| GatewayBackend::parse(v)) {
        settings.gateway_backend = backend;
    }
    if let Some(v) = file_cfg.get("upstream_url") {
        settings.upstream_url = v.clone();
    }
    if let Some(v) = file_cfg.get("upstream_token") {
        settings.upstream_token = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("outbox_capacity").and_then(|v| v.parse().ok()) {
        settings.outbox_capacity = v;
    }
    if let Some(v) = file_cfg.get("max_body_bytes").and_then(|v| v.parse().ok()) {
        settings.max_body_bytes = v;
    }
}

fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("RELAY_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(backend) = lookup("GATEWAY_BACKEND").and_then(|v| GatewayBackend::parse(&v)) {
        settings.gateway_backend = backend;
    }

    if let Some(v) = lookup("UPSTREAM_URL") {
        settings.upstream_url = v;
    }
    if let Some(v) = lookup("UPSTREAM_TOKEN") {
        settings.upstream_token = Some(v);
    }

    if let Some(v) = lookup("APP__OUTBOX_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
        settings.outbox_capacity = v.max(1);
    }
    if let Some(v) = lookup("APP__MAX_BODY_BYTES").and_then(|v| v.parse::<usize>().ok()) {
        settings.max_body_bytes = v;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
