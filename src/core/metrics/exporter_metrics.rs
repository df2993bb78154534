use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    pub static ref EXPORTER_REGISTRY: Registry = Registry::new();
    pub static ref EXPORTER_HTTP_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("coremon_http_requests", "coremon http requests to RPC nodes"),
        &["endpoint", "route", "status_code", "network"]
    )
    .unwrap();
    pub static ref EXPORTER_APP_VERSION_INFO: IntGaugeVec = IntGaugeVec::new(
        Opts::new("coremon_app_version_info", "coremon build information"),
        &["version", "commit", "build_date", "network"]
    )
    .unwrap();
}

pub fn register_exporter_metrics() -> prometheus::Result<()> {
    EXPORTER_REGISTRY.register(Box::new(EXPORTER_HTTP_REQUESTS.clone()))?;
    EXPORTER_REGISTRY.register(Box::new(EXPORTER_APP_VERSION_INFO.clone()))?;
    Ok(())
}

/// Publishes the version stamped by the build script.
pub fn register_app_version_info(network: &str) {
    EXPORTER_APP_VERSION_INFO
        .with_label_values(&[
            env!("CARGO_PKG_VERSION"),
            env!("GIT_COMMIT_HASH"),
            env!("BUILD_DATE"),
            network,
        ])
        .set(1);
}
