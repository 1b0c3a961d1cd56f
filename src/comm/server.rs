use crate::comm::config::CommConfig;
use crate::comm::error::{CommError, CommInitError};
use crate::comm::protocol::{
    HEADER_LEN, decode_header, decode_request_payload, encode_request_ack, encode_response_within,
};
use crate::comm::types::{ExecutionJob, MsgType, ResponsePayload};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::result::Result as StdResult;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Sequence deduplication entry
#[derive(Debug)]
struct DedupEntry {
    /// When this entry was created
    instant: Instant,
    /// Cached response to resend if duplicate
    cached_response: Option<Vec<u8>>,
}

/// Comm server - receives execution requests over UDP
pub struct Comm {
    socket: UdpSocket,
    config: CommConfig,
    /// Channel sender to forward jobs to the dispatcher
    job_sender: mpsc::Sender<ExecutionJob>,
    /// Sequence deduplication table per client
    dedup: Mutex<HashMap<SocketAddr, HashMap<u32, DedupEntry>>>,
}

impl Comm {
    /// Get local socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Comm {
    /// Create a new Comm instance and bind UDP socket
    /// Returns the comm instance and receiver for jobs to execute
    pub async fn new(
        config: CommConfig,
    ) -> StdResult<(Arc<Comm>, mpsc::Receiver<ExecutionJob>), CommInitError> {
        let socket = UdpSocket::bind(config.bind_addr()?)
            .await
            .map_err(|e| CommInitError::BindFailed(e.to_string()))?;

        if let Ok(addr) = socket.local_addr() {
            info!("Comm listening on {}", addr);
        }

        let (tx, rx) = mpsc::channel(1024);

        Ok((
            Arc::new(Self {
                socket,
                config,
                job_sender: tx,
                dedup: Mutex::new(HashMap::new()),
            }),
            rx,
        ))
    }

    /// Run the Comm server. Each packet is handled on its own task so a
    /// slow execution never holds up other clients.
    pub async fn run(self: Arc<Self>) -> StdResult<(), CommError> {
        let mut buf = vec![0u8; self.config.max_payload_bytes + 1024]; // Extra space for header
        let mut cleanup_interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, addr)) => {
                            let packet = buf[..len].to_vec();
                            let comm = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = comm.handle_packet(&packet, addr).await {
                                    warn!("Failed to handle packet from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Recv error: {}", e);
                            return Err(CommError::RecvError(e.to_string()));
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    // Periodic cleanup of dedup table
                    self.cleanup_dedup().await;
                }
            }
        }
    }

    /// Handle incoming packet
    async fn handle_packet(
        &self,
        packet: &[u8],
        client_addr: SocketAddr,
    ) -> StdResult<(), CommError> {
        // Check for truncated packet (minimum: type + seq = 5 bytes)
        if packet.len() < HEADER_LEN {
            warn!(
                "Truncated packet from {}: only {} bytes",
                client_addr,
                packet.len()
            );
            return Err(CommError::DecodeError("Packet too short".to_string()));
        }

        // Check payload size
        let payload_len = packet.len() - HEADER_LEN;
        if payload_len > self.config.max_payload_bytes {
            warn!(
                "Payload too large from {}: {} bytes",
                client_addr, payload_len
            );
            return Err(CommError::PayloadTooLarge(payload_len));
        }

        let (msg_type, seq) = decode_header(packet)?;
        let payload = &packet[HEADER_LEN..];

        debug!(
            "Received {} from {} seq={}",
            msg_type as u8, client_addr, seq
        );

        match msg_type {
            MsgType::Request => self.handle_request(payload, seq, client_addr).await,
            _ => {
                warn!(
                    "Unexpected message type: {} from {}",
                    msg_type as u8, client_addr
                );
                Ok(())
            }
        }
    }

    /// Handle incoming REQUEST
    async fn handle_request(
        &self,
        payload_bytes: &[u8],
        seq: u32,
        client_addr: SocketAddr,
    ) -> StdResult<(), CommError> {
        {
            let mut dedup = self.dedup.lock().await;
            let client_entries = dedup.entry(client_addr).or_default();

            if let Some(entry) = client_entries.get(&seq) {
                // Retransmission: never execute the same request twice
                let reply = match &entry.cached_response {
                    Some(cached) => {
                        info!(
                            "Duplicate request seq={} from {}, resending cached response",
                            seq, client_addr
                        );
                        cached.clone()
                    }
                    None => {
                        debug!(
                            "Duplicate request seq={} from {}, still executing, sending ACK",
                            seq, client_addr
                        );
                        encode_request_ack(seq)?
                    }
                };
                drop(dedup);
                self.send(&reply, client_addr).await?;
                return Ok(());
            }

            // Enforce capacity limit
            if client_entries.len() >= self.config.dedup_capacity {
                let oldest_seq = client_entries
                    .iter()
                    .min_by_key(|(_, e)| e.instant)
                    .map(|(seq, _)| *seq);
                if let Some(seq_to_remove) = oldest_seq {
                    client_entries.remove(&seq_to_remove);
                    debug!(
                        "Dedup table at capacity, removed oldest entry seq={}",
                        seq_to_remove
                    );
                }
            }

            // Register before executing so retransmissions during the run
            // are recognized
            client_entries.insert(
                seq,
                DedupEntry {
                    instant: Instant::now(),
                    cached_response: None,
                },
            );
        }

        let request_payload = match decode_request_payload(payload_bytes) {
            Ok(payload) => payload,
            Err(e) => {
                let response = ResponsePayload::failure(format!("Malformed request: {}", e));
                self.respond(seq, &response, client_addr).await?;
                return Err(e);
            }
        };

        info!(
            "New request seq={} from {} code_len={} has_test={}",
            seq,
            client_addr,
            request_payload.user_code.len(),
            request_payload.test_code.is_some()
        );

        // Send ACK immediately
        let ack = encode_request_ack(seq)?;
        self.send(&ack, client_addr).await?;
        debug!("Sent REQUEST_ACK seq={} to {}", seq, client_addr);

        let (reply_tx, reply_rx) = oneshot::channel::<ResponsePayload>();
        let job = ExecutionJob {
            payload: request_payload,
            reply: reply_tx,
            source_addr: client_addr,
        };

        if let Err(e) = self.job_sender.send(job).await {
            error!("Failed to forward job to dispatcher: {}", e);
            let response = ResponsePayload::failure("Internal server error");
            self.respond(seq, &response, client_addr).await?;
            return Err(CommError::ChannelClosed);
        }

        let response_timeout = Duration::from_secs(self.config.response_timeout_secs);
        let response = match timeout(response_timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                warn!("Channel closed without response for seq={}", seq);
                ResponsePayload::failure("No response from sandbox")
            }
            Err(_) => {
                warn!("Timeout waiting for response for seq={}", seq);
                ResponsePayload::failure("Response timeout")
            }
        };

        self.respond(seq, &response, client_addr).await
    }

    /// Send a RESPONSE and cache it for deduplication
    async fn respond(
        &self,
        seq: u32,
        response: &ResponsePayload,
        client_addr: SocketAddr,
    ) -> StdResult<(), CommError> {
        let response_bytes = encode_response_within(seq, response, self.config.max_payload_bytes)?;
        self.send(&response_bytes, client_addr).await?;

        let mut dedup = self.dedup.lock().await;
        if let Some(client_entries) = dedup.get_mut(&client_addr) {
            client_entries.insert(
                seq,
                DedupEntry {
                    instant: Instant::now(),
                    cached_response: Some(response_bytes),
                },
            );
        }
        debug!("Sent RESPONSE seq={} to {}", seq, client_addr);
        Ok(())
    }

    async fn send(&self, bytes: &[u8], client_addr: SocketAddr) -> StdResult<(), CommError> {
        self.socket
            .send_to(bytes, client_addr)
            .await
            .map_err(|e| CommError::SendError(e.to_string()))?;
        Ok(())
    }

    /// Cleanup expired entries from deduplication table
    async fn cleanup_dedup(&self) {
        let mut dedup = self.dedup.lock().await;
        let ttl = Duration::from_secs(self.config.dedup_ttl_secs);
        let now = Instant::now();

        for entries in dedup.values_mut() {
            entries.retain(|_seq, entry| now.duration_since(entry.instant) < ttl);
        }

        // Clean up empty client entries
        dedup.retain(|_addr, entries| !entries.is_empty());

        debug!("Dedup table cleaned, {} clients tracked", dedup.len());
    }
}
