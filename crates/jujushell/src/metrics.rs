//! Prometheus instrumentation.
//!
//! One [`Metrics`] instance owns the registry and every series the server
//! exports. Errors are counted by *category* only; free-form error text
//! goes to the log, never into a label, so cardinality stays bounded.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::lxd::{self, Client, Container};

/// Prefix for all series exported by the server.
const NAMESPACE: &str = "jujushell";

/// Buckets for container operation durations, in seconds.
const CONTAINER_OP_BUCKETS: &[f64] = &[0.25, 0.5, 1.0, 1.5, 2.0, 3.0, 5.0, 10.0];

/// The server's metric series.
pub struct Metrics {
    registry: Registry,
    pub requests_in_flight: IntGauge,
    pub requests_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub containers_in_flight: IntGauge,
    pub container_ops: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();
        let requests_in_flight = IntGauge::with_opts(
            Opts::new("requests_in_flight", "the number of requests currently in flight")
                .namespace(NAMESPACE),
        )?;
        let requests_total = IntCounterVec::new(
            Opts::new("requests_count", "the total count of requests").namespace(NAMESPACE),
            &["code"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("errors_count", "the number of encountered errors").namespace(NAMESPACE),
            &["category"],
        )?;
        let containers_in_flight = IntGauge::with_opts(
            Opts::new(
                "containers_in_flight",
                "the number of containers currently present in the machine",
            )
            .namespace(NAMESPACE),
        )?;
        let container_ops = HistogramVec::new(
            HistogramOpts::new("containers_duration", "time spent doing container operations")
                .namespace(NAMESPACE)
                .buckets(CONTAINER_OP_BUCKETS.to_vec()),
            &["operation"],
        )?;
        registry.register(Box::new(requests_in_flight.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(containers_in_flight.clone()))?;
        registry.register(Box::new(container_ops.clone()))?;
        Ok(Arc::new(Self {
            registry,
            requests_in_flight,
            requests_total,
            errors_total,
            containers_in_flight,
            container_ops,
        }))
    }

    /// Count one terminal error under its category.
    pub fn observe_error(&self, category: &str) {
        self.errors_total.with_label_values(&[category]).inc();
    }

    /// The text exposition of every registered series.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|err| prometheus::Error::Msg(format!("metrics are not UTF-8: {err}")))
    }
}

/// An LXD client decorator timing container operations.
pub struct InstrumentedClient {
    inner: Arc<dyn Client>,
    metrics: Arc<Metrics>,
}

impl InstrumentedClient {
    pub fn new(inner: Arc<dyn Client>, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }

    fn observe(&self, operation: &str, start: Instant) {
        self.metrics
            .container_ops
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl Client for InstrumentedClient {
    async fn all(&self) -> lxd::Result<Vec<Container>> {
        let start = Instant::now();
        let result = self.inner.all().await;
        self.observe("get-all-containers", start);
        if let Ok(containers) = &result {
            self.metrics.containers_in_flight.set(containers.len() as i64);
        }
        result
    }

    async fn get(&self, name: &str) -> lxd::Result<Container> {
        self.inner.get(name).await
    }

    async fn create(&self, image: &str, name: &str, profiles: &[String]) -> lxd::Result<Container> {
        let start = Instant::now();
        let result = self.inner.create(image, name, profiles).await;
        self.observe("create-container", start);
        result
    }

    async fn delete(&self, name: &str) -> lxd::Result<()> {
        let start = Instant::now();
        let result = self.inner.delete(name).await;
        self.observe("delete-container", start);
        result
    }

    async fn start(&self, name: &str) -> lxd::Result<()> {
        self.inner.start(name).await
    }

    async fn stop(&self, name: &str) -> lxd::Result<()> {
        self.inner.stop(name).await
    }

    async fn addr(&self, name: &str) -> lxd::Result<String> {
        self.inner.addr(name).await
    }

    async fn write_file(&self, name: &str, path: &str, data: &[u8]) -> lxd::Result<()> {
        self.inner.write_file(name, path, data).await
    }

    async fn exec(&self, name: &str, command: &[&str]) -> lxd::Result<String> {
        self.inner.exec(name, command).await
    }
}
