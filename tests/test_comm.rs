// Integration tests for Comm module
// This file should be run with cargo test --test test_comm

#[path = "../src/comm/mod.rs"]
mod comm;

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    });
}

// Message types (must match protocol)
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum MsgType {
    Request = 0x01,
    RequestAck = 0x02,
    Response = 0x03,
}

// Test helper: encode a request packet
fn encode_request(seq: u32, user_code: &str) -> Vec<u8> {
    use rmp_serde::encode::Serializer;
    use serde::Serialize;

    #[derive(Serialize)]
    struct RequestPayload<'a> {
        user_code: &'a str,
    }

    let payload = RequestPayload { user_code };
    let mut payload_bytes = Vec::new();
    let mut ser = Serializer::new(&mut payload_bytes).with_struct_map();
    payload.serialize(&mut ser).unwrap();

    let mut packet = vec![MsgType::Request as u8];
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(&payload_bytes);
    packet
}

// Test helper: decode response payload
fn decode_response(data: &[u8]) -> (u32, comm::ResponsePayload) {
    use rmp_serde::decode::Deserializer;
    use serde::Deserialize;

    let seq = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let mut de = Deserializer::new(&data[5..]);
    let resp = comm::ResponsePayload::deserialize(&mut de).unwrap();
    (seq, resp)
}

fn test_config() -> comm::CommConfig {
    comm::CommConfig {
        listen_addr: "127.0.0.1".to_string(),
        listen_port: 0,
        ..Default::default()
    }
}

fn ok_response(stdout: &str) -> comm::ResponsePayload {
    comm::ResponsePayload {
        stdout: stdout.to_string(),
        stderr: String::new(),
        returncode: 0,
        error: None,
        linter_output: None,
        status: "success".to_string(),
    }
}

use std::time::Duration;
use tokio::net::UdpSocket;

async fn recv_packet(client: &UdpSocket, buf: &mut [u8]) -> usize {
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(buf))
        .await
        .unwrap()
        .unwrap();
    len
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    // Normal request-response
    #[tokio::test]
    async fn test_normal_request_response() {
        init_tracing();

        let (comm, mut job_rx) = comm::Comm::new(test_config()).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        // Mock dispatcher echoing the submitted code
        let mock_handle = tokio::spawn(async move {
            if let Some(job) = job_rx.recv().await {
                assert!(job.payload.test_code.is_none());
                assert!(job.payload.timeout.is_none());
                let stdout = format!("ran: {}", job.payload.user_code);
                job.reply.send(ok_response(&stdout)).ok();
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(comm_addr).await.unwrap();

        client.send(&encode_request(1, "print(1)")).await.unwrap();

        // Should receive ACK
        let mut buf = vec![0u8; 65536];
        recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::RequestAck as u8);

        let _ = tokio::time::timeout(Duration::from_secs(1), mock_handle).await;

        // Should receive RESPONSE
        let len = recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::Response as u8);
        let (seq, response) = decode_response(&buf[..len]);
        assert_eq!(seq, 1);
        assert_eq!(response.stdout, "ran: print(1)");
        assert_eq!(response.status, "success");
    }

    // A retransmitted request is answered from cache and never re-executed
    #[tokio::test]
    async fn test_duplicate_request_dedup() {
        init_tracing();

        let (comm, mut job_rx) = comm::Comm::new(test_config()).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<String>(10);

        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                let _ = seen_tx.send(job.payload.user_code.clone()).await;
                let _ = job.reply.send(ok_response("ok\n"));
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(comm_addr).await.unwrap();

        let packet = encode_request(1, "x = 1");
        client.send(&packet).await.unwrap();

        let mut buf = vec![0u8; 65536];
        recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::RequestAck as u8);

        let len = recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::Response as u8);
        let (_, first) = decode_response(&buf[..len]);

        // Now send duplicate - should get cached response
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.send(&packet).await.unwrap();

        let len = recv_packet(&client, &mut buf).await;
        // Should be Response (cached), not RequestAck
        assert_eq!(buf[0], MsgType::Response as u8);
        let (seq, cached) = decode_response(&buf[..len]);
        assert_eq!(seq, 1);
        assert_eq!(cached, first);

        let mut received = Vec::new();
        while let Ok(Some(code)) =
            tokio::time::timeout(Duration::from_millis(100), seen_rx.recv()).await
        {
            received.push(code);
        }

        assert_eq!(received.len(), 1, "Expected 1 execution, got {:?}", received);
    }

    // A slow execution does not hold up another client's request
    #[tokio::test]
    async fn test_concurrent_requests_do_not_block() {
        init_tracing();

        let (comm, mut job_rx) = comm::Comm::new(test_config()).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        // Hold the first job's reply until the second job has been answered
        tokio::spawn(async move {
            let first = job_rx.recv().await.unwrap();
            let second = job_rx.recv().await.unwrap();
            let (slow, fast) = if first.payload.user_code == "slow" {
                (first, second)
            } else {
                (second, first)
            };
            fast.reply.send(ok_response("fast\n")).ok();
            tokio::time::sleep(Duration::from_millis(200)).await;
            slow.reply.send(ok_response("slow\n")).ok();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let slow_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        slow_client.connect(comm_addr).await.unwrap();
        let fast_client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        fast_client.connect(comm_addr).await.unwrap();

        let mut buf = vec![0u8; 65536];

        slow_client.send(&encode_request(1, "slow")).await.unwrap();
        recv_packet(&slow_client, &mut buf).await;
        assert_eq!(buf[0], MsgType::RequestAck as u8);

        fast_client.send(&encode_request(1, "fast")).await.unwrap();
        recv_packet(&fast_client, &mut buf).await;
        assert_eq!(buf[0], MsgType::RequestAck as u8);

        let len = recv_packet(&fast_client, &mut buf).await;
        assert_eq!(buf[0], MsgType::Response as u8);
        assert_eq!(decode_response(&buf[..len]).1.stdout, "fast\n");

        let len = recv_packet(&slow_client, &mut buf).await;
        assert_eq!(buf[0], MsgType::Response as u8);
        assert_eq!(decode_response(&buf[..len]).1.stdout, "slow\n");
    }

    // Oversized results are truncated to fit one datagram
    #[tokio::test]
    async fn test_large_response_truncated() {
        init_tracing();

        let config = comm::CommConfig {
            max_payload_bytes: 2000,
            ..test_config()
        };
        let (comm, mut job_rx) = comm::Comm::new(config).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        tokio::spawn(async move {
            if let Some(job) = job_rx.recv().await {
                job.reply.send(ok_response(&"y".repeat(10000))).ok();
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(comm_addr).await.unwrap();
        client.send(&encode_request(3, "print('y' * 10000)")).await.unwrap();

        let mut buf = vec![0u8; 65536];
        recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::RequestAck as u8);

        let len = recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::Response as u8);
        assert!(len - 5 <= 2000);
        let (_, response) = decode_response(&buf[..len]);
        assert!(response.stdout.ends_with("[truncated]"));
        assert_eq!(response.status, "success");
    }

    // A request whose payload cannot be decoded gets an error response
    #[tokio::test]
    async fn test_malformed_payload_gets_error_response() {
        init_tracing();

        let (comm, _rx) = comm::Comm::new(test_config()).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(comm_addr).await.unwrap();

        // 0xc1 is never used in MessagePack
        let mut packet = vec![MsgType::Request as u8];
        packet.extend_from_slice(&5u32.to_be_bytes());
        packet.push(0xc1);
        client.send(&packet).await.unwrap();

        let mut buf = vec![0u8; 65536];
        let len = recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::Response as u8);
        let (seq, response) = decode_response(&buf[..len]);
        assert_eq!(seq, 5);
        assert_eq!(response.status, "error");
        assert!(response.error.unwrap().starts_with("Malformed request"));
    }

    // Dropping the reply channel yields an error response instead of silence
    #[tokio::test]
    async fn test_dropped_reply_reports_error() {
        init_tracing();

        let (comm, mut job_rx) = comm::Comm::new(test_config()).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        tokio::spawn(async move {
            if let Some(job) = job_rx.recv().await {
                drop(job.reply);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(comm_addr).await.unwrap();
        client.send(&encode_request(1, "pass")).await.unwrap();

        let mut buf = vec![0u8; 65536];
        recv_packet(&client, &mut buf).await;
        assert_eq!(buf[0], MsgType::RequestAck as u8);

        let len = recv_packet(&client, &mut buf).await;
        let (_, response) = decode_response(&buf[..len]);
        assert_eq!(response.status, "error");
        assert_eq!(response.returncode, -1);
    }

    // Empty packet - should be rejected
    #[tokio::test]
    async fn test_empty_packet() {
        init_tracing();

        let (comm, _rx) = comm::Comm::new(test_config()).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Send empty packet
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let _ = client.send_to(&[], comm_addr).await;

        // Should not crash - server continues
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Invalid REQUEST_ACK from client - should be ignored
    #[tokio::test]
    async fn test_invalid_request_ack_from_client() {
        init_tracing();

        let (comm, _rx) = comm::Comm::new(test_config()).await.unwrap();
        let comm_addr = comm.local_addr().unwrap();

        tokio::spawn(async move {
            let _ = comm.run().await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        // Send REQUEST_ACK (should be ignored - server->client only)
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut packet = vec![MsgType::RequestAck as u8];
        packet.extend_from_slice(&1u32.to_be_bytes());
        let _ = client.send_to(&packet, comm_addr).await;

        let mut buf = [0u8; 1024];
        let result =
            tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
        assert!(result.is_err(), "server must not answer an ACK");
    }

    // Daemon not running - client never gets a packet back
    #[tokio::test]
    async fn test_client_timeout_no_daemon() {
        init_tracing();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect("127.0.0.1:19999").await.unwrap();

        let _ = client.send(&encode_request(1, "pass")).await;

        // Either a timeout or a refused-connection error, never a packet
        let mut buf = [0u8; 1024];
        let result =
            tokio::time::timeout(Duration::from_millis(100), client.recv_from(&mut buf)).await;
        assert!(!matches!(result, Ok(Ok(_))));
    }
}
