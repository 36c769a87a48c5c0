use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| {
        IntCounter::new("shares_accepted_total", "Total shares accepted by the node").unwrap()
    })
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| {
        IntCounter::new("shares_rejected_total", "Total shares rejected").unwrap()
    })
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| {
        IntCounter::new("blocks_found_total", "Total solutions the node accepted").unwrap()
    })
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        IntCounter::new("job_broadcasts_total", "Total new-work broadcasts sent").unwrap()
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| {
        IntCounter::new("rpc_requests_total", "Total RPC requests to the node").unwrap()
    })
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS
        .get_or_init(|| IntCounter::new("rpc_errors_total", "Total RPC errors").unwrap())
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| {
        IntGauge::new("stratum_active_connections", "Active miner connections").unwrap()
    })
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(active_connections().collect());

    let mut buf = Vec::new();
    if enc.encode(&mfs, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposes_counters() {
        inc_job_broadcasts();
        let text = render();
        assert!(text.contains("job_broadcasts_total"));
        assert!(text.contains("stratum_active_connections"));
    }
}
