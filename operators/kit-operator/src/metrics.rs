//! 指标收集与导出模块
//!
//! 协调次数、耗时与进行中的协调数以 Prometheus 格式通过 `/metrics` 导出，
//! 同一端口上的 `/healthz` 供存活探针使用。

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::{error, info};

/// 协调结果标签
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_REQUEUE: &str = "requeue";
pub const OUTCOME_ERROR: &str = "error";

/// Operator 指标
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
    in_flight: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let reconcile_total = IntCounterVec::new(
            Opts::new("kit_reconcile_total", "Total number of reconcile invocations"),
            &["kind", "outcome"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new(
                "kit_reconcile_duration_seconds",
                "Duration of reconcile invocations in seconds",
            ),
            &["kind"],
        )?;
        let in_flight = IntGaugeVec::new(
            Opts::new("kit_reconcile_in_flight", "Number of reconcile invocations in progress"),
            &["kind"],
        )?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration,
            in_flight,
        })
    }

    pub fn observe_reconcile(&self, kind: &str, outcome: &str, elapsed: Duration) {
        self.reconcile_total.with_label_values(&[kind, outcome]).inc();
        self.reconcile_duration
            .with_label_values(&[kind])
            .observe(elapsed.as_secs_f64());
    }

    pub fn reconcile_started(&self, kind: &str) {
        self.in_flight.with_label_values(&[kind]).inc();
    }

    pub fn reconcile_finished(&self, kind: &str) {
        self.in_flight.with_label_values(&[kind]).dec();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 以文本格式编码当前所有指标
    pub fn encode(&self) -> prometheus::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

fn respond(metrics: &Metrics, path: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    match path {
        "/metrics" => match metrics.encode() {
            Ok(buffer) => {
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                *response.body_mut() = Body::from(buffer);
            }
            Err(e) => {
                error!("编码指标失败: {}", e);
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
        },
        "/healthz" => *response.body_mut() = Body::from("ok"),
        _ => {
            *response.status_mut() = StatusCode::NOT_FOUND;
            *response.body_mut() = Body::from("Not Found");
        }
    }
    response
}

/// 启动指标与健康检查服务器，直到服务器退出才返回
pub async fn serve(metrics: Metrics, addr: SocketAddr) -> hyper::Result<()> {
    let make_svc = make_service_fn(move |_| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let response = respond(&metrics, req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            }))
        }
    });

    info!("指标服务器启动在 {}", addr);
    Server::bind(&addr).serve(make_svc).await
}
