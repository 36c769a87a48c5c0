//! The miner-facing TCP server and the upstream poll loop.
//!
//! One reader task per connection, one writer task per connection fed by
//! an unbounded channel. Frames never interleave because nothing writes
//! to the socket except the writer task.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use uuid::Uuid;

use super::connection::{Connection, Protocol};
use super::protocol::{self, Request, Response};
use crate::jobs::{abbrev, Job, JobManager, SubmitOutcome};
use crate::metrics::prometheus as metrics;

pub struct ProxyServer {
    host: String,
    port: u16,
    poll_interval: Duration,
    job_manager: Arc<JobManager>,
    sessions: Arc<RwLock<HashMap<String, Arc<RwLock<Connection>>>>>,
    session_count: AtomicUsize,
}

impl ProxyServer {
    pub fn new(
        host: String,
        port: u16,
        poll_interval: Duration,
        job_manager: Arc<JobManager>,
    ) -> Self {
        Self {
            host,
            port,
            poll_interval,
            job_manager,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            session_count: AtomicUsize::new(0),
        }
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::Relaxed)
    }

    /// Per-session share summary for the status API.
    pub async fn session_stats(&self) -> Vec<Value> {
        let conns = self.snapshot().await;
        let mut out = Vec::with_capacity(conns.len());
        for connection in conns {
            let conn = connection.read().await;
            out.push(json!({
                "peer": conn.peer_addr.to_string(),
                "protocol": conn.protocol.as_str(),
                "worker": conn.worker_name,
                "authorized": conn.authorized,
                "accepted": conn.shares_accepted,
                "rejected": conn.shares_rejected,
            }));
        }
        out
    }

    /// Bind the stratum listener and serve until the process exits.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let sock_addr: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", addr, e))?;

        // SO_REUSEADDR avoids bind failures on quick restarts.
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(sock_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&socket2::SockAddr::from(sock_addr))?;
        socket.listen(1024)?;
        let listener = TcpListener::from_std(socket.into())?;

        tracing::info!("stratum proxy listening on {}", addr);

        let server = Arc::clone(&self);
        tokio::spawn(async move {
            server.poll_loop().await;
        });

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, peer_addr).await {
                            tracing::error!("session error ({}): {:#}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Serve a single miner connection.
    async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let connection = Arc::new(RwLock::new(Connection::new(session_id.clone(), peer_addr)));

        // Register before the first read so a broadcast from a concurrent
        // poll cycle already reaches this session.
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session_id.clone(), Arc::clone(&connection));
        }
        self.session_count.fetch_add(1, Ordering::Relaxed);
        metrics::inc_connections();

        tracing::info!("miner connected: {}", peer_addr);

        let (reader, mut writer) = socket.into_split();
        let mut reader = BufReader::new(reader);

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        {
            let mut conn = connection.write().await;
            conn.outbound = Some(tx);
        }

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if writer.write_all(frame.as_bytes()).await.is_err() {
                    break;
                }
                let _ = writer.flush().await;
            }
        });

        let mut line: Vec<u8> = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    // Undecodable bytes are replaced, not a reason to drop
                    // the miner.
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim();
                    if text.is_empty() {
                        continue;
                    }

                    let request: Request = match serde_json::from_str(text) {
                        Ok(request) => request,
                        Err(e) => {
                            tracing::warn!("bad JSON from {}: {:.200} ({})", peer_addr, text, e);
                            continue;
                        }
                    };

                    if let Err(e) = self.dispatch(&connection, request).await {
                        tracing::error!("session error ({}): {:#}", peer_addr, e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("read error from {}: {}", peer_addr, e);
                    break;
                }
            }
        }

        {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&session_id);
        }
        self.session_count.fetch_sub(1, Ordering::Relaxed);
        metrics::dec_connections();

        let (accepted, rejected) = {
            let mut conn = connection.write().await;
            conn.closed = true;
            conn.outbound = None;
            (conn.shares_accepted, conn.shares_rejected)
        };
        tracing::info!(
            "miner disconnected: {} (accepted={} rejected={})",
            peer_addr,
            accepted,
            rejected
        );

        Ok(())
    }

    async fn dispatch(
        &self,
        connection: &Arc<RwLock<Connection>>,
        request: Request,
    ) -> Result<()> {
        let Request { id, method, params } = request;
        tracing::debug!("<- {} id={}", method, id);

        {
            let mut conn = connection.write().await;
            conn.detect_protocol(&method);
        }

        match method.as_str() {
            "eth_submitLogin" => self.ethproxy_login(connection, id, &params).await,
            "eth_getWork" => self.ethproxy_getwork(connection, id).await,
            "eth_submitWork" => self.ethproxy_submitwork(connection, id, &params).await,
            "eth_submitHashrate" => self.ethproxy_hashrate(connection, id, &params).await,
            "mining.subscribe" => self.stratum_subscribe(connection, id, &params).await,
            "mining.authorize" => self.stratum_authorize(connection, id, &params).await,
            "mining.submit" => self.stratum_submit(connection, id, &params).await,
            "mining.extranonce.subscribe" => {
                Self::send_result(connection, id, json!(true)).await
            }
            other => {
                tracing::debug!(
                    "unknown method from {}: {}",
                    connection.read().await.peer_addr,
                    other
                );
                Self::send_result(connection, id, json!(true)).await
            }
        }
    }

    // -- EthProxy handlers --

    async fn ethproxy_login(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        params: &[Value],
    ) -> Result<()> {
        let worker = params
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        {
            let mut conn = connection.write().await;
            conn.worker_name = worker.clone();
            conn.authorized = true;
        }

        tracing::info!(
            "ethproxy login: {} ({})",
            worker,
            connection.read().await.peer_addr
        );
        Self::send_result(connection, id, json!(true)).await
    }

    async fn ethproxy_getwork(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
    ) -> Result<()> {
        match self.job_manager.current_job().await {
            Some(job) => {
                Self::send_result(
                    connection,
                    id,
                    json!([job.header_hash, job.seed_hash, job.boundary]),
                )
                .await
            }
            None => {
                Self::send_error(connection, id, protocol::ERR_GENERIC, "No work available yet")
                    .await
            }
        }
    }

    async fn ethproxy_submitwork(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        params: &[Value],
    ) -> Result<()> {
        if params.len() < 3 {
            return self
                .reject(
                    connection,
                    id,
                    protocol::ERR_GENERIC,
                    "Need [nonce, headerHash, mixDigest]",
                )
                .await;
        }

        let nonce = params[0].as_str().unwrap_or_default();
        let header_hash = params[1].as_str().unwrap_or_default();
        let mix_digest = params[2].as_str().unwrap_or_default();

        tracing::info!(
            "ethproxy submit: nonce={} header={}",
            nonce,
            abbrev(header_hash)
        );

        let outcome = self
            .job_manager
            .submit_solution(nonce, Some(header_hash), Some(mix_digest))
            .await;

        if outcome == SubmitOutcome::Accepted {
            {
                let mut conn = connection.write().await;
                conn.record_share(true);
            }
            metrics::inc_accepted();
            Self::send_result(connection, id, json!(true)).await
        } else {
            {
                let mut conn = connection.write().await;
                conn.record_share(false);
            }
            metrics::inc_rejected();
            Self::send_error(
                connection,
                id,
                protocol::ERR_GENERIC,
                &format!("Rejected: {}", outcome),
            )
            .await
        }
    }

    async fn ethproxy_hashrate(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        params: &[Value],
    ) -> Result<()> {
        // Fewer than 2 params: nothing worth forwarding, still ack.
        if params.len() >= 2 {
            let rate = params[0].as_str().unwrap_or_default();
            let client_id = params[1].as_str().unwrap_or_default();
            let _ = self.job_manager.rpc().submit_hashrate(rate, client_id).await;
        }
        Self::send_result(connection, id, json!(true)).await
    }

    // -- Stratum handlers --

    async fn stratum_subscribe(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        params: &[Value],
    ) -> Result<()> {
        let agent = params.first().and_then(|v| v.as_str()).unwrap_or("unknown");
        tracing::info!(
            "stratum subscribe: {} ({})",
            agent,
            connection.read().await.peer_addr
        );

        Self::send_result(
            connection,
            id,
            json!([[["mining.notify", protocol::SESSION_TAG]], "", "0"]),
        )
        .await?;

        if let Some(job) = self.job_manager.current_job().await {
            Self::send_stratum_job(connection, &job, true).await?;
        }
        Ok(())
    }

    async fn stratum_authorize(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        params: &[Value],
    ) -> Result<()> {
        let worker = params
            .first()
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        {
            let mut conn = connection.write().await;
            conn.worker_name = worker.clone();
            conn.authorized = true;
        }

        tracing::info!(
            "stratum authorized: {} ({})",
            worker,
            connection.read().await.peer_addr
        );
        Self::send_result(connection, id, json!(true)).await?;

        if let Some(job) = self.job_manager.current_job().await {
            Self::send_stratum_job(connection, &job, true).await?;
        }
        Ok(())
    }

    async fn stratum_submit(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        params: &[Value],
    ) -> Result<()> {
        let authorized = connection.read().await.authorized;
        if !authorized {
            return self
                .reject(connection, id, protocol::ERR_UNAUTHORIZED, "Not authorized")
                .await;
        }
        if params.len() < 3 {
            return self
                .reject(connection, id, protocol::ERR_STALE_JOB, "Not enough parameters")
                .await;
        }

        let worker = params[0].as_str().unwrap_or_default();
        let job_id = params[1].as_str().unwrap_or_default();
        let nonce = params[2].as_str().unwrap_or_default();

        let job = self.job_manager.find_job(Some(job_id), None).await;
        let (header_hash, mix_digest) = reconstruct_submission(params, job.as_deref());

        if header_hash.is_none() || mix_digest.is_none() {
            if job.is_none() {
                return self
                    .reject(
                        connection,
                        id,
                        protocol::ERR_STALE_JOB,
                        "Job not found, can't reconstruct submission",
                    )
                    .await;
            }
            // The node gets the final say on an incomplete submission.
            tracing::warn!("submit with incomplete params - may be rejected");
        }

        tracing::info!(
            "stratum submit: worker={} job={} nonce={}",
            worker,
            job_id,
            nonce
        );
        let outcome = self
            .job_manager
            .submit_solution(nonce, header_hash.as_deref(), mix_digest.as_deref())
            .await;

        if outcome == SubmitOutcome::Accepted {
            {
                let mut conn = connection.write().await;
                conn.record_share(true);
            }
            metrics::inc_accepted();
            Self::send_result(connection, id, json!(true)).await
        } else {
            {
                let mut conn = connection.write().await;
                conn.record_share(false);
            }
            metrics::inc_rejected();
            Self::send_error(
                connection,
                id,
                protocol::ERR_REJECTED,
                &format!("Rejected: {}", outcome),
            )
            .await
        }
    }

    /// Refuse a submit before it reaches the node; still a counted reject.
    async fn reject(
        &self,
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        code: i64,
        message: &str,
    ) -> Result<()> {
        {
            let mut conn = connection.write().await;
            conn.record_share(false);
        }
        metrics::inc_rejected();
        Self::send_error(connection, id, code, message).await
    }

    // -- Work push --

    async fn send_new_work(
        connection: &Arc<RwLock<Connection>>,
        job: &Job,
        clean: bool,
    ) -> Result<()> {
        let dialect = connection.read().await.protocol;
        match dialect {
            Protocol::EthProxy => Self::send_ethproxy_job(connection, job).await,
            _ => Self::send_stratum_job(connection, job, clean).await,
        }
    }

    async fn send_ethproxy_job(connection: &Arc<RwLock<Connection>>, job: &Job) -> Result<()> {
        Self::send_notification(
            connection,
            "mining.notify",
            json!([job.header_hash, job.seed_hash, job.boundary]),
        )
        .await
    }

    /// Difficulty strictly before notify; miners latch it per notify.
    async fn send_stratum_job(
        connection: &Arc<RwLock<Connection>>,
        job: &Job,
        clean: bool,
    ) -> Result<()> {
        Self::send_notification(
            connection,
            "mining.set_difficulty",
            json!([difficulty_from_boundary(&job.boundary)]),
        )
        .await?;
        Self::send_notification(
            connection,
            "mining.notify",
            json!([job.job_id, job.seed_hash, job.header_hash, clean]),
        )
        .await
    }

    // -- Wire helpers --

    async fn send_result(
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        result: Value,
    ) -> Result<()> {
        Self::send_response(connection, protocol::ok(id, result)).await
    }

    async fn send_error(
        connection: &Arc<RwLock<Connection>>,
        id: Value,
        code: i64,
        message: &str,
    ) -> Result<()> {
        Self::send_response(connection, protocol::err(id, code, message)).await
    }

    async fn send_response(
        connection: &Arc<RwLock<Connection>>,
        response: Response,
    ) -> Result<()> {
        Self::send_line(connection, serde_json::to_string(&response)?).await
    }

    async fn send_notification(
        connection: &Arc<RwLock<Connection>>,
        method: &str,
        params: Value,
    ) -> Result<()> {
        let frame = protocol::notification(method, params);
        Self::send_line(connection, serde_json::to_string(&frame)?).await
    }

    async fn send_line(connection: &Arc<RwLock<Connection>>, payload: String) -> Result<()> {
        let sender = {
            let conn = connection.read().await;
            if conn.closed {
                None
            } else {
                conn.outbound.clone()
            }
        };
        if let Some(tx) = sender {
            tracing::debug!("-> {}", payload);
            let _ = tx.send(payload + "\n");
        }
        Ok(())
    }

    // -- Poll loop and broadcast --

    async fn snapshot(&self) -> Vec<Arc<RwLock<Connection>>> {
        let sessions = self.sessions.read().await;
        sessions.values().cloned().collect()
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = interval(self.poll_interval);
        let mut consecutive_errors: u64 = 0;

        loop {
            ticker.tick().await;

            match self.job_manager.poll_work().await {
                Ok(Some(job)) => {
                    consecutive_errors = 0;

                    let conns = self.snapshot().await;
                    let mut miners = 0;
                    for connection in &conns {
                        if connection.read().await.authorized {
                            miners += 1;
                        }
                    }

                    tracing::info!(
                        "new work: job={} header={} -> {} miner(s)",
                        job.job_id,
                        abbrev(&job.header_hash),
                        miners
                    );

                    self.broadcast(&job).await;
                    metrics::inc_job_broadcasts();
                }
                Ok(None) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    // First few outage ticks at full volume, then every
                    // 30th; the interval itself never stretches.
                    if consecutive_errors <= 3 || consecutive_errors % 30 == 0 {
                        tracing::error!("work poll failed (#{}): {}", consecutive_errors, e);
                    }
                }
            }
        }
    }

    /// Push a job to every live session in its own dialect.
    async fn broadcast(&self, job: &Job) {
        let conns = self.snapshot().await;
        for connection in &conns {
            if connection.read().await.closed {
                continue;
            }
            // A push failure is the session's own problem; its reader
            // notices the broken pipe soon enough.
            let _ = Self::send_new_work(connection, job, true).await;
        }
    }
}

/// Fill in the fields a miner left out of `mining.submit`, using the
/// cached job when available. Returns `(header_hash, mix_digest)`.
fn reconstruct_submission(
    params: &[Value],
    job: Option<&Job>,
) -> (Option<String>, Option<String>) {
    let job_header = job.map(|j| j.header_hash.clone());
    if params.len() >= 5 {
        (
            params[3].as_str().map(str::to_string),
            params[4].as_str().map(str::to_string),
        )
    } else if params.len() == 4 {
        (job_header, params[3].as_str().map(str::to_string))
    } else {
        (job_header, None)
    }
}

/// Pool-style difficulty of a 256-bit boundary: (2^256 - 1) / boundary,
/// with a floor of 1.0 for a zero or unparseable boundary.
fn difficulty_from_boundary(boundary: &str) -> f64 {
    let digits = boundary.trim().trim_start_matches("0x");
    let Ok(bytes) = hex::decode(digits) else {
        return 1.0;
    };
    let value = bytes
        .iter()
        .fold(0.0_f64, |acc, b| acc * 256.0 + f64::from(*b));
    if value > 0.0 {
        (2.0_f64.powi(256) - 1.0) / value
    } else {
        1.0
    }
}
