//! pybox CLI client
//!
//! Submits code to the pybox daemon via UDP and prints the graded outcome.
//! `repl` uses rustyline for readline-style editing and history.

use clap::{Parser, Subcommand};
use rmp_serde::decode::Deserializer;
use rmp_serde::encode::Serializer;
use rustyline::Editor;
use rustyline::history::FileHistory;
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Message types
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum MsgType {
    Request = 0x01,
    RequestAck = 0x02,
    Response = 0x03,
}

const HEADER_LEN: usize = 5;

/// Error text shown when the daemon never answered
const UNAVAILABLE: &str = "sandbox unavailable";

/// Request payload
#[derive(Debug, Serialize)]
struct RequestPayload {
    user_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<String>,
}

/// Response payload
#[derive(Debug, Deserialize)]
struct ResponsePayload {
    stdout: String,
    #[allow(dead_code)]
    stderr: String,
    #[allow(dead_code)]
    returncode: i32,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    linter_output: Option<String>,
    status: String,
}

/// What the user sees for one submission
#[derive(Debug, Serialize)]
struct Outcome {
    output: String,
    error: Option<String>,
    status: String,
    linter_output: Option<String>,
}

impl Outcome {
    fn collapse(result: io::Result<ResponsePayload>) -> Self {
        match result {
            Ok(response) => Self {
                output: response.stdout,
                error: response.error,
                status: response.status,
                linter_output: response.linter_output,
            },
            Err(e) => {
                eprintln!("[warning] {}", e);
                Self {
                    output: String::new(),
                    error: Some(UNAVAILABLE.to_string()),
                    status: "attempted".to_string(),
                    linter_output: None,
                }
            }
        }
    }

    fn passed(&self) -> bool {
        self.status == "success"
    }

    fn print(&self) {
        print!("{}", self.output);
        if !self.output.is_empty() && !self.output.ends_with('\n') {
            println!();
        }
        if let Some(error) = &self.error {
            println!("[error] {}", error.trim_end());
        }
        if let Some(lint) = &self.linter_output {
            println!("[lint] {}", lint.trim_end());
        }
        println!("[status] {}", self.status);
    }
}

/// CLI arguments
#[derive(Debug, Parser)]
#[command(name = "pybox-cli")]
#[command(about = "pybox daemon CLI client")]
struct Args {
    /// Daemon address (e.g., 127.0.0.1:9710)
    #[arg(short, long, default_value = "127.0.0.1:9710")]
    target: SocketAddr,

    /// ACK timeout in seconds
    #[arg(long, default_value = "5")]
    timeout: u64,

    /// Response timeout in seconds
    #[arg(long, default_value = "120")]
    response_timeout: u64,

    /// Maximum retry attempts
    #[arg(short, long, default_value = "3")]
    max_retries: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a source file once
    Run {
        /// Source file to execute
        file: PathBuf,

        /// Test script run against the file's output
        #[arg(long)]
        test: Option<PathBuf>,

        /// Execution time limit in seconds (daemon default when omitted)
        #[arg(long)]
        exec_timeout: Option<u64>,

        /// Source language
        #[arg(long)]
        language: Option<String>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive session; a snippet is submitted on an empty line
    Repl {
        /// Test script run against every snippet
        #[arg(long)]
        test: Option<PathBuf>,

        /// Execution time limit in seconds (daemon default when omitted)
        #[arg(long)]
        exec_timeout: Option<u64>,

        /// History file path
        #[arg(long)]
        history_file: Option<PathBuf>,
    },
}

/// Client configuration
#[derive(Debug, Clone)]
struct Config {
    target: SocketAddr,
    ack_timeout_secs: u64,
    response_timeout_secs: u64,
    max_retries: u32,
}

/// Main client state
struct Client {
    socket: UdpSocket,
    config: Config,
    seq: AtomicU32,
}

/// A datagram from the daemon, matched against the expected seq
enum Reply {
    Ack,
    Response(ResponsePayload),
    Unrelated,
}

impl Client {
    /// Create a new client
    async fn new(config: Config) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;

        Ok(Self {
            socket,
            config,
            seq: AtomicU32::new(1),
        })
    }

    /// Send a request and wait for response
    async fn send_request(&self, payload: &RequestPayload) -> io::Result<ResponsePayload> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);

        // Serialize payload as a map so optional fields may be omitted
        let mut payload_bytes = Vec::new();
        let mut ser = Serializer::new(&mut payload_bytes).with_struct_map();
        payload
            .serialize(&mut ser)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // Build packet: type (1) + seq (4) + payload
        let mut packet = vec![MsgType::Request as u8];
        packet.extend_from_slice(&seq.to_be_bytes());
        packet.extend_from_slice(&payload_bytes);

        let ack_timeout = Duration::from_secs(self.config.ack_timeout_secs);
        let response_timeout = Duration::from_secs(self.config.response_timeout_secs);

        // Send with retries. The daemon deduplicates by seq, so a
        // retransmission never runs the code twice.
        for _attempt in 0..self.config.max_retries {
            self.socket.send_to(&packet, self.config.target).await?;

            match self.wait_for(seq, ack_timeout).await {
                Ok(Reply::Response(response)) => return Ok(response),
                Ok(Reply::Ack) => {}
                Ok(Reply::Unrelated) | Err(_) => continue,
            }

            match self.wait_for_response(seq, response_timeout).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    eprintln!("[warning] {}, retrying...", e);
                    continue;
                }
            }
        }

        Err(io::Error::new(io::ErrorKind::TimedOut, "pybox not responding"))
    }

    /// Wait for the RESPONSE that follows an ACK
    async fn wait_for_response(
        &self,
        expected_seq: u32,
        limit: Duration,
    ) -> io::Result<ResponsePayload> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Response timeout"));
            }
            match self.wait_for(expected_seq, remaining).await? {
                Reply::Response(response) => return Ok(response),
                // Duplicate ACKs and stale packets are skipped
                Reply::Ack | Reply::Unrelated => continue,
            }
        }
    }

    /// Receive one datagram and classify it
    async fn wait_for(&self, expected_seq: u32, limit: Duration) -> io::Result<Reply> {
        let mut buf = vec![0u8; 65536];

        let (len, addr) = match timeout(limit, self.socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "Timed out")),
        };

        if addr != self.config.target || len < HEADER_LEN {
            return Ok(Reply::Unrelated);
        }

        let msg_type = buf[0];
        let seq = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if seq != expected_seq {
            return Ok(Reply::Unrelated);
        }

        if msg_type == MsgType::RequestAck as u8 {
            Ok(Reply::Ack)
        } else if msg_type == MsgType::Response as u8 {
            let mut de = Deserializer::new(&buf[HEADER_LEN..len]);
            let payload: ResponsePayload = Deserialize::deserialize(&mut de)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Ok(Reply::Response(payload))
        } else {
            Ok(Reply::Unrelated)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let command = args.command;
    let config = Config {
        target: args.target,
        ack_timeout_secs: args.timeout,
        response_timeout_secs: args.response_timeout,
        max_retries: args.max_retries,
    };

    // Check locale
    if let Ok(lang) = std::env::var("LANG")
        && !lang.to_lowercase().contains("utf-8")
        && !lang.to_lowercase().contains("utf8")
    {
        eprintln!(
            "[warning] Terminal locale is not UTF-8. Non-ASCII characters may not display correctly."
        );
    }

    // Build runtime for async network operations
    let result = tokio::runtime::Runtime::new().and_then(|rt| {
        rt.block_on(async {
            let client = Client::new(config).await?;
            match command {
                Command::Run {
                    file,
                    test,
                    exec_timeout,
                    language,
                    json,
                } => run_file(&client, &file, test.as_deref(), exec_timeout, language, json).await,
                Command::Repl {
                    test,
                    exec_timeout,
                    history_file,
                } => run_repl(&client, test.as_deref(), exec_timeout, history_file).await,
            }
        })
    });

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[error] {}", e);
            ExitCode::FAILURE
        }
    }
}

fn read_test(path: Option<&Path>) -> io::Result<Option<String>> {
    path.map(std::fs::read_to_string).transpose()
}

async fn run_file(
    client: &Client,
    file: &Path,
    test: Option<&Path>,
    exec_timeout: Option<u64>,
    language: Option<String>,
    json: bool,
) -> io::Result<ExitCode> {
    let payload = RequestPayload {
        user_code: std::fs::read_to_string(file)?,
        test_code: read_test(test)?,
        timeout: exec_timeout,
        language,
    };

    let outcome = Outcome::collapse(client.send_request(&payload).await);
    if json {
        let text = serde_json::to_string_pretty(&outcome)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        println!("{}", text);
    } else {
        outcome.print();
    }

    Ok(if outcome.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_repl(
    client: &Client,
    test: Option<&Path>,
    exec_timeout: Option<u64>,
    history_file: Option<PathBuf>,
) -> io::Result<ExitCode> {
    let test_code = read_test(test)?;
    let history_file = history_file.unwrap_or_else(|| {
        dirs::home_dir()
            .map(|p| p.join(".pybox_history"))
            .unwrap_or_else(|| PathBuf::from(".pybox_history"))
    });

    // Initialize rustyline with history
    let mut rl: Editor<(), FileHistory> = Editor::new().map_err(io::Error::other)?;

    if history_file.exists()
        && let Err(e) = rl.load_history(&history_file)
    {
        eprintln!("[warning] Failed to load history: {}", e);
    }

    println!("pybox-cli v{}", env!("CARGO_PKG_VERSION"));
    println!("Target: {}", client.config.target);
    println!("Enter code, then an empty line to run it. Ctrl+D to quit.");
    println!();

    let mut snippet: Vec<String> = Vec::new();
    loop {
        let prompt = if snippet.is_empty() { ">>> " } else { "... " };

        match rl.readline(prompt) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = rl.add_history_entry(line.as_str());
                    snippet.push(line);
                    continue;
                }
                if snippet.is_empty() {
                    continue;
                }

                let mut user_code = snippet.join("\n");
                user_code.push('\n');
                snippet.clear();

                let payload = RequestPayload {
                    user_code,
                    test_code: test_code.clone(),
                    timeout: exec_timeout,
                    language: None,
                };

                print!("[running...]");
                io::stdout().flush()?;
                let outcome = Outcome::collapse(client.send_request(&payload).await);
                print!("\r");
                outcome.print();
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                // Ctrl+C drops the pending snippet
                println!("^C");
                snippet.clear();
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => {
                break;
            }
            Err(e) => {
                eprintln!("[error] Readline error: {}", e);
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(&history_file) {
        eprintln!("[warning] Failed to save history: {}", e);
    }

    println!("\nGoodbye!");
    Ok(ExitCode::SUCCESS)
}
