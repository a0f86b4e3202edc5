use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::process::ExitCode;
use std::time::Duration;

use mailtrail_proto::{
    BatchResponse, FrameKind, Header, decode_batch_json, decode_header_json,
    decode_response_json, encode_json, read_ack_sync, read_frame_sync,
    write_frame_sync,
};

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_TEMPFAIL: u8 = 75;
const EX_CONFIG: u8 = 78;
const MAX_BATCH_BYTES: usize = 8 * 1024 * 1024;
const MAX_HEADER_LEN: u32 = 64 * 1024;
const MAX_RESPONSE_BYTES: u64 = 8 * 1024 * 1024;

const USAGE: &str = "usage: mailtrail-client --server host:port [--source name] [--batch-id id] [--ping] [--timeout-secs 10] < batch.json";

type Result<T> = std::result::Result<T, ClientError>;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err {
                ClientError::Usage(_) => EX_USAGE,
                ClientError::Data(_) => EX_DATAERR,
                ClientError::Runtime(_) => EX_TEMPFAIL,
                ClientError::Rejected(_) => EX_CONFIG,
            };
            eprintln!("mailtrail-client error: {err}");
            ExitCode::from(code)
        }
    }
}

fn run() -> Result<()> {
    let args = Cli::parse(std::env::args().skip(1))?;
    run_with_cli(args, &mut io::stdin(), &mut io::stdout())
}

fn run_with_cli<R: Read, W: Write>(
    args: Cli,
    stdin: &mut R,
    stdout: &mut W,
) -> Result<()> {
    let timeout = Duration::from_secs(args.timeout_secs);
    let addr = resolve_socket_addr(&args.server)?;

    if args.ping {
        let header_bytes = build_header_bytes(&args, FrameKind::Heartbeat)?;
        return send_heartbeat(addr, timeout, &header_bytes);
    }

    let body = read_batch(stdin, MAX_BATCH_BYTES)?;
    let header_bytes = build_header_bytes(&args, FrameKind::EventBatch)?;
    let raw_response = send_batch(addr, timeout, &header_bytes, &body)?;

    stdout
        .write_all(&raw_response)
        .and_then(|()| stdout.write_all(b"\n"))
        .and_then(|()| stdout.flush())
        .map_err(|err| runtime_err("failed to write response", err))?;

    let response = decode_response_json(&raw_response)
        .map_err(|err| runtime_err("invalid batch response", err))?;
    check_response(&response)
}

fn read_batch<R: Read>(
    reader: &mut R,
    max_batch_bytes: usize,
) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    reader
        .take((max_batch_bytes as u64) + 1)
        .read_to_end(&mut body)
        .map_err(|err| runtime_err("failed to read batch from stdin", err))?;
    if body.len() > max_batch_bytes {
        return Err(ClientError::Data(format!(
            "batch too large: max {} bytes",
            max_batch_bytes
        )));
    }

    let batch = decode_batch_json(&body).map_err(|err| {
        ClientError::Data(format!("stdin is not a batch document: {err}"))
    })?;
    if batch.is_empty() {
        return Err(ClientError::Data("batch has no records".to_string()));
    }
    Ok(body)
}

fn build_header_bytes(
    args: &Cli,
    kind: FrameKind,
) -> Result<Vec<u8>> {
    let header = Header {
        kind,
        source: args.source.clone(),
        batch_id: args.batch_id.clone(),
    };
    encode_json(&header)
        .map_err(|err| runtime_err("failed to serialize header", err))
}

fn check_response(response: &BatchResponse) -> Result<()> {
    if response.is_success() {
        return Ok(());
    }
    Err(ClientError::Rejected(format!(
        "server answered {}: {}",
        response.status_code,
        response.error.as_deref().unwrap_or("no detail")
    )))
}

fn connect(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream> {
    let stream =
        TcpStream::connect_timeout(&addr, timeout).map_err(|err| {
            runtime_err(format!("failed to connect to {}", addr), err)
        })?;
    stream.set_nodelay(true).ok();

    stream
        .set_write_timeout(Some(timeout))
        .map_err(|err| runtime_err("failed to set write timeout", err))?;

    stream
        .set_read_timeout(Some(timeout))
        .map_err(|err| runtime_err("failed to set read timeout", err))?;

    Ok(stream)
}

fn send_batch(
    addr: SocketAddr,
    timeout: Duration,
    header_bytes: &[u8],
    body: &[u8],
) -> Result<Vec<u8>> {
    let mut stream = connect(addr, timeout)?;

    write_frame_sync(&mut stream, header_bytes, body)
        .map_err(|err| runtime_err("failed to send frame", err))?;

    let (reply_header, reply_body) =
        read_frame_sync(&mut stream, MAX_HEADER_LEN, MAX_RESPONSE_BYTES)
            .map_err(|err| runtime_err("invalid/missing batch result", err))?;

    let reply = decode_header_json(&reply_header)
        .map_err(|err| runtime_err("invalid reply header", err))?;
    if reply.kind != FrameKind::BatchResult {
        return Err(ClientError::Runtime(format!(
            "unexpected reply frame: {:?}",
            reply.kind
        )));
    }

    Ok(reply_body)
}

fn send_heartbeat(
    addr: SocketAddr,
    timeout: Duration,
    header_bytes: &[u8],
) -> Result<()> {
    let mut stream = connect(addr, timeout)?;

    write_frame_sync(&mut stream, header_bytes, &[])
        .map_err(|err| runtime_err("failed to send heartbeat", err))?;

    read_ack_sync(&mut stream)
        .map_err(|err| runtime_err("invalid/missing ACK from server", err))
}

fn resolve_socket_addr(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .map_err(|err| {
            runtime_err(
                format!("failed to resolve server address: {server}"),
                err,
            )
        })?
        .next()
        .ok_or_else(|| {
            ClientError::Runtime(format!(
                "no address resolved for server: {server}"
            ))
        })
}

#[derive(Debug)]
struct Cli {
    server: String,
    source: Option<String>,
    batch_id: Option<String>,
    ping: bool,
    timeout_secs: u64,
}

impl Cli {
    fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let mut server = None;
        let mut source = None;
        let mut batch_id = None;
        let mut ping = false;
        let mut timeout_secs = 10_u64;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--server" => server = args.next(),
                "--source" => source = args.next(),
                "--batch-id" => batch_id = args.next(),
                "--ping" => ping = true,
                "--timeout-secs" => {
                    let raw = args.next().ok_or_else(|| {
                        ClientError::Usage(
                            "missing value for --timeout-secs".to_string(),
                        )
                    })?;
                    timeout_secs = raw
                        .parse::<u64>()
                        .ok()
                        .filter(|secs| *secs > 0)
                        .ok_or_else(|| {
                            ClientError::Usage(
                                "--timeout-secs must be a positive integer"
                                    .to_string(),
                            )
                        })?;
                }
                "-h" | "--help" => {
                    return Err(ClientError::Usage(USAGE.to_string()));
                }
                _ => {
                    return Err(ClientError::Usage(format!(
                        "unknown argument: {arg}"
                    )));
                }
            }
        }

        Ok(Self {
            server: server.ok_or_else(|| {
                ClientError::Usage(
                    "missing required argument --server".to_string(),
                )
            })?,
            source,
            batch_id,
            ping,
            timeout_secs,
        })
    }
}

#[derive(Debug)]
enum ClientError {
    Usage(String),
    Data(String),
    Runtime(String),
    Rejected(String),
}

impl fmt::Display for ClientError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            ClientError::Usage(msg)
            | ClientError::Data(msg)
            | ClientError::Runtime(msg)
            | ClientError::Rejected(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

fn runtime_err(
    context: impl Into<String>,
    err: impl fmt::Display,
) -> ClientError {
    ClientError::Runtime(format!("{}: {err}", context.into()))
}
