//! PCDB session handler - line protocol over stdin/stdout
//!
//! Drives one point-cloud session per process. The controller writes
//! newline-free JSON objects to stdin and reads JSON responses from
//! stdout.
//!
//! Usage:
//!   pcdb-session [--serial-root /var/pcdb/serial]
//!
//! Protocol:
//!   Request:  { "command": <name>, "params": <object> }
//!   Response: { "status": 1, ...command fields }   on success
//!             { "status": 0, "message": <string> } on failure
//!
//! A single {"ready": 1} object is emitted once at startup. Object-store
//! persistence is configured through the environment: PCDB_S3_BUCKET,
//! AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY and optionally PCDB_S3_URL.

use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use pcdb::session::{ReadRequest, SessionConfig, SessionManager};
use pcdb::source::InlinePipeline;
use pcdb::{PointError, S3Config};

// ============================================================================
// Wire Protocol Types
// ============================================================================

/// Request from the controller
#[derive(Debug, Deserialize)]
#[serde(tag = "command", content = "params", rename_all = "camelCase")]
pub enum Request {
    /// Bind a session to a pipeline execution or a serialized dataset
    Create {
        #[serde(rename = "pipelineId")]
        pipeline_id: String,
        pipeline: Option<String>,
        #[serde(default)]
        debug: bool,
        #[serde(default)]
        verbose: u32,
    },

    /// Tear down the current session
    Destroy,

    IsSessionValid,
    GetNumPoints,
    GetSchema,
    #[serde(rename = "getSRS")]
    GetSrs,

    /// Persist the session's tree to the serial root / object store
    Serialize,

    /// Materialize a read and ship it to the given endpoint
    Read(ReadRequest),
}

/// Response to the controller
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok {
        status: u8,
    },
    Error {
        status: u8,
        message: String,
        code: &'static str,
    },
    Valid {
        status: u8,
        valid: bool,
    },
    Count {
        status: u8,
        count: u64,
    },
    Schema {
        status: u8,
        schema: String,
    },
    Srs {
        status: u8,
        srs: String,
    },
    Read {
        status: u8,
        message: String,
        #[serde(rename = "pointsRead")]
        points_read: u64,
        #[serde(rename = "bytesCount")]
        bytes_count: u64,
    },
}

fn ok() -> Response {
    Response::Ok { status: 1 }
}

fn fail(e: PointError) -> Response {
    Response::Error {
        status: 0,
        message: e.to_string(),
        code: e.code(),
    }
}

// ============================================================================
// Request Handler
// ============================================================================

fn handle_request(manager: &mut SessionManager, request: Request) -> Response {
    match request {
        Request::Create {
            pipeline_id,
            pipeline,
            debug,
            verbose,
        } => match manager.create(&pipeline_id, pipeline.as_deref(), debug, verbose) {
            Ok(()) => ok(),
            Err(e) => fail(e),
        },

        Request::Destroy => {
            manager.destroy();
            ok()
        }

        Request::IsSessionValid => Response::Valid {
            status: 1,
            valid: manager.is_valid(),
        },

        Request::GetNumPoints => match manager.num_points() {
            Ok(count) => Response::Count { status: 1, count },
            Err(e) => fail(e),
        },

        Request::GetSchema => match manager.schema_xml() {
            Ok(schema) => Response::Schema { status: 1, schema },
            Err(e) => fail(e),
        },

        Request::GetSrs => match manager.srs() {
            Ok(srs) => Response::Srs { status: 1, srs },
            Err(e) => fail(e),
        },

        Request::Serialize => match manager.serialize() {
            Ok(()) => ok(),
            Err(e) => fail(e),
        },

        Request::Read(request) => match manager.read(&request) {
            Ok(outcome) => {
                // Delivery runs detached; only queueing is acknowledged.
                drop(outcome.done);
                Response::Read {
                    status: 1,
                    message: "read queued; points will be delivered to the requested endpoint"
                        .to_string(),
                    points_read: outcome.points_read as u64,
                    bytes_count: outcome.num_bytes as u64,
                }
            }
            Err(e) => fail(e),
        },
    }
}

// ============================================================================
// Frame Reader
// ============================================================================

/// Read one top-level JSON object from the stream.
///
/// The controller never writes newlines between objects, so frames are
/// delimited by balanced braces. Braces inside strings and escaped
/// quotes are accounted for. Returns None on EOF; bytes outside any
/// object are skipped.
fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut frame = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut byte = [0u8; 1];

    loop {
        if reader.read(&mut byte)? == 0 {
            // EOF; a partial frame is unrecoverable.
            return Ok(None);
        }
        let c = byte[0];
        if depth == 0 && c != b'{' {
            continue;
        }
        frame.push(c);

        if in_string {
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == b'"' {
                in_string = false;
            }
            continue;
        }
        match c {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return String::from_utf8(frame)
                        .map(Some)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
                }
            }
            _ => {}
        }
    }
}

fn write_response<W: Write>(out: &mut W, response: &Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *out, response)?;
    out.write_all(b"\n")?;
    out.flush()
}

// ============================================================================
// Configuration
// ============================================================================

fn s3_from_env() -> Option<S3Config> {
    let bucket = std::env::var("PCDB_S3_BUCKET").ok()?;
    let access_key = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
    let base_url =
        std::env::var("PCDB_S3_URL").unwrap_or_else(|_| "s3.amazonaws.com".to_string());
    Some(S3Config::with_base_url(
        &access_key,
        &secret_key,
        &base_url,
        &bucket,
    ))
}

// ============================================================================
// Main
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("pcdb-session {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("pcdb-session {}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Point-cloud session handler driven over stdin/stdout");
        println!();
        println!("Usage: pcdb-session [--serial-root <dir>]");
        println!();
        println!("Options:");
        println!("  --serial-root  Root directory for serialized trees");
        println!("                 (default: /var/pcdb/serial)");
        println!("  -V, --version  Print version information");
        println!("  -h, --help     Print this help message");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let serial_root = args
        .iter()
        .position(|a| a == "--serial-root")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/pcdb/serial"));

    let config = SessionConfig {
        serial_root,
        s3: s3_from_env(),
    };
    let mut manager = SessionManager::new(Box::new(InlinePipeline), config);

    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])?;
    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(signal = sig, "shutting down");
            std::process::exit(0);
        }
    });

    let mut stdin = BufReader::new(std::io::stdin());
    let mut stdout = std::io::stdout();

    // Tell the controller we are ready for commands.
    stdout.write_all(b"{\"ready\":1}\n")?;
    stdout.flush()?;

    while let Some(frame) = read_frame(&mut stdin)? {
        let response = match serde_json::from_str::<Request>(&frame) {
            Ok(request) => handle_request(&mut manager, request),
            Err(e) => Response::Error {
                status: 0,
                message: format!("invalid request: {}", e),
                code: "INVALID_REQUEST",
            },
        };
        write_response(&mut stdout, &response)?;
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn test_manager(dir: &std::path::Path) -> SessionManager {
        SessionManager::new(
            Box::new(InlinePipeline),
            SessionConfig {
                serial_root: dir.to_path_buf(),
                s3: None,
            },
        )
    }

    // ========================================================================
    // Frame Reader
    // ========================================================================

    #[test]
    fn test_read_single_frame() {
        let mut input = Cursor::new(br#"{"command":"destroy"}"#.to_vec());
        let frame = read_frame(&mut input).unwrap().unwrap();
        assert_eq!(frame, r#"{"command":"destroy"}"#);
        assert!(read_frame(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_read_consecutive_frames_without_newlines() {
        let mut input = Cursor::new(br#"{"a":1}{"b":2}"#.to_vec());
        assert_eq!(read_frame(&mut input).unwrap().unwrap(), r#"{"a":1}"#);
        assert_eq!(read_frame(&mut input).unwrap().unwrap(), r#"{"b":2}"#);
        assert!(read_frame(&mut input).unwrap().is_none());
    }

    #[test]
    fn test_read_nested_objects() {
        let raw = r#"{"command":"create","params":{"pipelineId":"x"}}"#;
        let mut input = Cursor::new(raw.as_bytes().to_vec());
        assert_eq!(read_frame(&mut input).unwrap().unwrap(), raw);
    }

    #[test]
    fn test_braces_inside_strings_ignored() {
        let raw = r#"{"pipeline":"{\"stage\": \"}}{{\"}"}"#;
        let mut input = Cursor::new(raw.as_bytes().to_vec());
        assert_eq!(read_frame(&mut input).unwrap().unwrap(), raw);
    }

    #[test]
    fn test_interframe_noise_skipped() {
        let mut input = Cursor::new(b"  \n\t{\"a\":1} junk {\"b\":2}".to_vec());
        assert_eq!(read_frame(&mut input).unwrap().unwrap(), r#"{"a":1}"#);
        assert_eq!(read_frame(&mut input).unwrap().unwrap(), r#"{"b":2}"#);
    }

    #[test]
    fn test_partial_frame_is_eof() {
        let mut input = Cursor::new(br#"{"command": "crea"#.to_vec());
        assert!(read_frame(&mut input).unwrap().is_none());
    }

    // ========================================================================
    // Command Dispatch
    // ========================================================================

    fn dispatch(manager: &mut SessionManager, raw: &str) -> serde_json::Value {
        let request: Request = serde_json::from_str(raw).unwrap();
        let response = handle_request(manager, request);
        serde_json::to_value(&response).unwrap()
    }

    #[test]
    fn test_is_session_valid_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager(dir.path());

        let v = dispatch(&mut manager, r#"{"command":"isSessionValid"}"#);
        assert_eq!(v["status"], 1);
        assert_eq!(v["valid"], false);

        let create = r#"{"command":"create","params":{
            "pipelineId":"p1",
            "pipeline":"{\"dims\":[{\"name\":\"X\",\"type\":\"double\"},{\"name\":\"Y\",\"type\":\"double\"}],\"points\":[[1.0,2.0],[3.0,4.0]]}"
        }}"#;
        let v = dispatch(&mut manager, create);
        assert_eq!(v["status"], 1);

        let v = dispatch(&mut manager, r#"{"command":"isSessionValid"}"#);
        assert_eq!(v["valid"], true);

        let v = dispatch(&mut manager, r#"{"command":"getNumPoints"}"#);
        assert_eq!(v["count"], 2);

        let v = dispatch(&mut manager, r#"{"command":"destroy"}"#);
        assert_eq!(v["status"], 1);
        let v = dispatch(&mut manager, r#"{"command":"isSessionValid"}"#);
        assert_eq!(v["valid"], false);
    }

    #[test]
    fn test_commands_without_session_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager(dir.path());

        for cmd in ["getNumPoints", "getSchema", "getSRS", "serialize"] {
            let v = dispatch(&mut manager, &format!(r#"{{"command":"{}"}}"#, cmd));
            assert_eq!(v["status"], 0, "{} must fail without a session", cmd);
            assert!(v["message"].as_str().unwrap().contains("not valid"));
        }
    }

    #[test]
    fn test_get_schema_returns_xml() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager(dir.path());

        let create = r#"{"command":"create","params":{
            "pipelineId":"p1",
            "pipeline":"{\"dims\":[{\"name\":\"X\",\"type\":\"double\"},{\"name\":\"Y\",\"type\":\"double\"}],\"points\":[[0.0,0.0]]}"
        }}"#;
        dispatch(&mut manager, create);

        let v = dispatch(&mut manager, r#"{"command":"getSchema"}"#);
        assert_eq!(v["status"], 1);
        let xml = v["schema"].as_str().unwrap();
        assert!(xml.contains("<PointCloudSchema>"));
        assert!(xml.contains("<name>OriginId</name>"));

        let v = dispatch(&mut manager, r#"{"command":"getSRS"}"#);
        assert_eq!(v["status"], 1);
        assert!(v["srs"].is_string());
    }

    #[test]
    fn test_read_command_acknowledges_queued() {
        use std::net::TcpListener;

        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager(dir.path());

        let create = r#"{"command":"create","params":{
            "pipelineId":"p1",
            "pipeline":"{\"dims\":[{\"name\":\"X\",\"type\":\"double\"},{\"name\":\"Y\",\"type\":\"double\"}],\"points\":[[1.0,1.0],[2.0,2.0]]}"
        }}"#;
        dispatch(&mut manager, create);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let read = format!(
            r#"{{"command":"read","params":{{"transmitHost":"127.0.0.1","transmitPort":{}}}}}"#,
            port
        );
        let v = dispatch(&mut manager, &read);
        assert_eq!(v["status"], 1);
        assert_eq!(v["pointsRead"], 2);
        // X, Y, OriginId per record.
        assert_eq!(v["bytesCount"], 2 * 24);
        assert!(v["message"].as_str().unwrap().contains("queued"));
    }

    #[test]
    fn test_read_bbox_param_is_an_array() {
        use std::net::TcpListener;

        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager(dir.path());

        let create = r#"{"command":"create","params":{
            "pipelineId":"p1",
            "pipeline":"{\"dims\":[{\"name\":\"X\",\"type\":\"double\"},{\"name\":\"Y\",\"type\":\"double\"}],\"points\":[[1.0,1.0],[2.0,2.0],[9.0,9.0]]}"
        }}"#;
        dispatch(&mut manager, create);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let read = format!(
            r#"{{"command":"read","params":{{"bbox":[0.0,0.0,3.0,3.0],"transmitHost":"127.0.0.1","transmitPort":{}}}}}"#,
            port
        );
        let v = dispatch(&mut manager, &read);
        assert_eq!(v["status"], 1);
        assert_eq!(v["pointsRead"], 2);
    }

    #[test]
    fn test_read_negative_start_maps_to_status_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = test_manager(dir.path());

        let create = r#"{"command":"create","params":{
            "pipelineId":"p1",
            "pipeline":"{\"dims\":[{\"name\":\"X\",\"type\":\"double\"},{\"name\":\"Y\",\"type\":\"double\"}],\"points\":[[1.0,1.0]]}"
        }}"#;
        dispatch(&mut manager, create);

        let read = r#"{"command":"read","params":{
            "start":-5,"transmitHost":"127.0.0.1","transmitPort":1}}"#;
        let v = dispatch(&mut manager, read);
        assert_eq!(v["status"], 0);
        assert_eq!(v["code"], "INVALID_ARGUMENT");
    }

    #[test]
    fn test_unknown_command_is_invalid_request() {
        let raw = r#"{"command":"selfDestruct"}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }
}
