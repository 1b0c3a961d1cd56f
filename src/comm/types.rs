use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::oneshot;

/// Message types for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    /// Client → pybox: submit code for execution
    Request = 0x01,
    /// pybox → Client: request received, execution pending
    RequestAck = 0x02,
    /// pybox → Client: execution result
    Response = 0x03,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::RequestAck),
            0x03 => Some(Self::Response),
            _ => None,
        }
    }
}

/// Execution request from client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Source submitted by the user
    pub user_code: String,
    /// Lesson test script run after the user code
    #[serde(default)]
    pub test_code: Option<String>,
    /// Wall-clock limit in seconds (server default when absent)
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Source language (`python` when absent)
    #[serde(default)]
    pub language: Option<String>,
}

/// Execution result sent back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    /// User stdout followed by test stdout
    pub stdout: String,
    /// Raw stderr of the runs that executed
    pub stderr: String,
    /// Exit code of the last run, -1 on timeout or rejection
    pub returncode: i32,
    /// Readable failure text
    #[serde(default)]
    pub error: Option<String>,
    /// Advisory static checker output
    #[serde(default)]
    pub linter_output: Option<String>,
    /// success | attempted | error | test_failed
    pub status: String,
}

const TRUNCATED_SUFFIX: &str = "\n[truncated]";

impl ResponsePayload {
    /// Response for a request that could not be executed at all
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            returncode: -1,
            error: Some(message.into()),
            linter_output: None,
            status: "error".to_string(),
        }
    }

    /// Halve the longest text field. Returns false once nothing is left
    /// to shrink.
    pub fn shrink_longest_field(&mut self) -> bool {
        let mut fields: Vec<&mut String> = vec![&mut self.stdout, &mut self.stderr];
        if let Some(error) = self.error.as_mut() {
            fields.push(error);
        }
        if let Some(lint) = self.linter_output.as_mut() {
            fields.push(lint);
        }

        let Some(longest) = fields.into_iter().max_by_key(|f| f.len()) else {
            return false;
        };
        if longest.len() <= TRUNCATED_SUFFIX.len() {
            return false;
        }

        let mut cut = longest.len() / 2;
        while !longest.is_char_boundary(cut) {
            cut -= 1;
        }
        longest.truncate(cut);
        longest.push_str(TRUNCATED_SUFFIX);
        true
    }
}

/// Execution job forwarded from Comm to the dispatcher
#[derive(Debug)]
pub struct ExecutionJob {
    /// Decoded request
    pub payload: RequestPayload,
    /// Channel to send the result back to Comm
    pub reply: oneshot::Sender<ResponsePayload>,
    /// Client source address
    pub source_addr: SocketAddr,
}
