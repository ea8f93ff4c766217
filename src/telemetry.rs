//! Process telemetry bootstrap for the walqueue binary.
//!
//! The global meter provider carries the service resource but no reader or
//! exporter, so the instruments in `stats::telemetry` are not exported from
//! this process. Operators observe the queue through
//! [`StatsCounters`](crate::stats::StatsCounters), which the binary logs on
//! its stats interval. Embedders that want OTel export install their own
//! provider before starting the queue.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const ATTR_SERVICE_VERSION: &str = "service.version";

/// Telemetry settings read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub resource_attributes: Vec<KeyValue>,
}

impl TelemetryConfig {
    pub fn from_env(default_service_name: &str) -> Result<Self> {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
        let raw_attributes = std::env::var("OTEL_RESOURCE_ATTRIBUTES").ok();
        Self::build(&service_name, raw_attributes.as_deref())
    }

    fn build(service_name: &str, raw_attributes: Option<&str>) -> Result<Self> {
        let service_name = service_name.trim();
        if service_name.is_empty() {
            return Err(Error::Config(
                "OTEL_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let mut attr_map: BTreeMap<String, String> = BTreeMap::new();
        if let Some(raw) = raw_attributes {
            for (key, value) in parse_resource_attributes(raw)? {
                attr_map.insert(key, value);
            }
        }
        attr_map.insert(ATTR_SERVICE_NAME.to_string(), service_name.to_string());
        attr_map
            .entry(ATTR_SERVICE_NAMESPACE.to_string())
            .or_insert_with(|| "walqueue".to_string());
        attr_map
            .entry(ATTR_SERVICE_VERSION.to_string())
            .or_insert_with(|| env!("CARGO_PKG_VERSION").to_string());

        Ok(Self {
            service_name: service_name.to_string(),
            resource_attributes: attr_map
                .into_iter()
                .map(|(k, v)| KeyValue::new(k, v))
                .collect(),
        })
    }
}

/// Keeps the meter provider alive for the life of the process.
pub struct Telemetry {
    config: TelemetryConfig,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Installs the JSON log subscriber and the global meter provider.
    pub fn init(default_service_name: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(default_service_name)?;
        let level = parse_log_level(log_level)?;

        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .try_init()
            .map_err(|e| {
                Error::Config(format!("failed to initialize telemetry subscriber: {e}"))
            })?;

        let resource =
            Resource::default().merge(&Resource::new(config.resource_attributes.clone()));
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());

        info!(
            service_name = %config.service_name,
            log_level = %level,
            "Telemetry initialized"
        );

        Ok(Self {
            config,
            meter_provider,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
    }
}

pub fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_resource_attributes(raw: &str) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    for pair in raw.split(',') {
        let trimmed = pair.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(Error::Config(format!(
                "OTEL_RESOURCE_ATTRIBUTES entry '{trimmed}' is invalid, expected key=value"
            )));
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(Error::Config(
                "OTEL_RESOURCE_ATTRIBUTES contains an empty attribute key".to_string(),
            ));
        }

        attrs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(attrs)
}
