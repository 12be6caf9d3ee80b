use crate::{capture::Stats, common::BLOCK_TIMEOUT};
use actix_web::{dev::Server, get, App, HttpResponse, HttpServer, Responder};
use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_int_gauge, register_int_gauge_vec, Gauge, IntGauge, IntGaugeVec,
    TextEncoder,
};
use thingbuf::mpsc::blocking::Receiver;
use thingbuf::mpsc::errors::RecvTimeoutError;
use tokio::sync::broadcast;
use tracing::{info, warn};

lazy_static! {
    static ref PACKET_GAUGE: IntGauge =
        register_int_gauge!("received_datagrams", "Number of datagrams we've received").unwrap();
    static ref DROP_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        "dropped_datagrams",
        "Number of datagrams the capture thread discarded",
        &["reason"]
    )
    .unwrap();
    static ref BACKLOG_GAUGE: IntGauge = register_int_gauge!(
        "ring_backlog",
        "Number of yet-to-be-processed datagrams in the ring"
    )
    .unwrap();
    pub static ref ALIGN_GAUGE: IntGaugeVec = register_int_gauge_vec!(
        "unaligned_datagrams",
        "Datagrams the aligner could not place in a cycle",
        &["reason"]
    )
    .unwrap();
    pub static ref CYCLE_GAUGE: IntGauge =
        register_int_gauge!("processed_cycles", "Number of cycles through the task chain").unwrap();
    pub static ref STALL_GAUGE: IntGauge =
        register_int_gauge!("stalled_fetches", "Number of fetches that timed out").unwrap();
    pub static ref SCAN_GAUGE: IntGauge =
        register_int_gauge!("scan_id", "Current scan index (-1 idle, -2 complete)").unwrap();
    pub static ref FLAG_FRACTION: Gauge =
        register_gauge!("flag_fraction", "Fraction of flagged samples in the last cycle").unwrap();
    pub static ref MEAN_AMPLITUDE: Gauge = register_gauge!(
        "mean_amplitude",
        "Mean amplitude of unflagged samples in the last cycle"
    )
    .unwrap();
}

#[get("/metrics")]
async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    match encoder.encode_to_string(&metric_families) {
        Ok(body_str) => HttpResponse::Ok().body(body_str),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

fn as_gauge(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Copy the capture statistics into their gauges
pub fn record_stats(stat: &Stats) {
    PACKET_GAUGE.set(as_gauge(stat.received));
    DROP_GAUGE
        .with_label_values(&["short"])
        .set(as_gauge(stat.short));
    DROP_GAUGE
        .with_label_values(&["version"])
        .set(as_gauge(stat.version_mismatch));
    DROP_GAUGE
        .with_label_values(&["recv_error"])
        .set(as_gauge(stat.recv_errors));
    BACKLOG_GAUGE.set(as_gauge(stat.backlog as u64));
}

pub fn monitor_task(
    stats: Receiver<Stats>,
    mut shutdown: broadcast::Receiver<()>,
) -> eyre::Result<()> {
    info!("Starting monitoring task!");
    loop {
        // Look for shutdown signal
        if shutdown.try_recv().is_ok() {
            info!("Monitoring task stopping");
            break;
        }
        // Blocking here is ok, these are infrequent events
        match stats.recv_ref_timeout(BLOCK_TIMEOUT) {
            Ok(stat) => {
                if stat.short > 0 || stat.version_mismatch > 0 {
                    warn!(
                        short = stat.short,
                        version = stat.version_mismatch,
                        "Capture has discarded datagrams"
                    );
                }
                record_stats(&stat);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Closed) => break,
            Err(_) => unreachable!(),
        }
    }
    Ok(())
}

pub fn start_web_server(metrics_port: u16) -> eyre::Result<Server> {
    info!("Starting metrics webserver");
    let server = HttpServer::new(|| App::new().service(metrics))
        .bind(("0.0.0.0", metrics_port))?
        .workers(1)
        .run();
    Ok(server)
}
