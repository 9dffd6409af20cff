//! `vf serve`: long-running host for terminal front-ends.
//!
//! Requests arrive on stdin, responses leave on stdout, one JSON object per
//! line. A [`FlowSupervisor`] thread drives idle detection and debounced
//! saves in the background. EOF on stdin ends every open session with reason
//! `shutdown` and exits.

use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use vibeflow_core::{
    resolve_repo_key, EndReason, FlowEngine, FlowSupervisor, DEFAULT_RECENT_LIMIT,
};

use crate::error::CliError;
use crate::protocol::{ErrorInfo, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};

pub fn run(engine: FlowEngine) -> Result<(), CliError> {
    let mut supervisor = FlowSupervisor::spawn(engine)?;
    info!("Serve loop started");

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    loop {
        let response = match read_line(&mut reader)? {
            Line::Eof => break,
            Line::TooLarge => Response::error(None, "request_too_large", "request exceeded maximum size"),
            Line::Data(bytes) => {
                if bytes.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                match serde_json::from_slice::<Request>(&bytes) {
                    Ok(request) => {
                        debug!(method = %request.method, id = ?request.id, "Serve request received");
                        supervisor.with_engine(|engine| handle_request(engine, request))
                    }
                    Err(err) => Response::error(
                        None,
                        "invalid_json",
                        format!("request was not valid JSON: {}", err),
                    ),
                }
            }
        };
        write_response(&mut out, &response)?;
    }

    let ended = supervisor.shutdown(EndReason::Shutdown)?;
    info!(ended, "Serve loop finished");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Data(Vec<u8>),
    TooLarge,
    Eof,
}

/// Reads one newline-terminated line without buffering more than
/// [`MAX_REQUEST_BYTES`] of it.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Line> {
    let mut buffer = Vec::new();
    let limit = MAX_REQUEST_BYTES as u64 + 1;
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut buffer)?;
    if read == 0 {
        return Ok(Line::Eof);
    }

    if buffer.last() == Some(&b'\n') {
        buffer.pop();
        return Ok(Line::Data(buffer));
    }
    if buffer.len() <= MAX_REQUEST_BYTES {
        // last line without a trailing newline
        return Ok(Line::Data(buffer));
    }

    // Discard the rest of the oversized line.
    let mut sink = Vec::new();
    loop {
        sink.clear();
        let n = reader.by_ref().take(limit).read_until(b'\n', &mut sink)?;
        if n == 0 || sink.last() == Some(&b'\n') {
            break;
        }
    }
    warn!("Oversized request discarded");
    Ok(Line::TooLarge)
}

fn write_response<W: Write>(out: &mut W, response: &Response) -> io::Result<()> {
    let line = serde_json::to_string(response).map_err(io::Error::other)?;
    writeln!(out, "{}", line)?;
    out.flush()
}

// ─────────────────────────────────────────────────────────────────────────────
// Params
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartParams {
    handle: String,
    cwd: PathBuf,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndParams {
    handle: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandleParams {
    handle: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivityParams {
    handle: String,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextParams {
    handle: String,
    text: String,
    #[serde(default)]
    delay_ms: Option<i64>,
}

impl TextParams {
    fn delay(&self) -> Result<Option<Duration>, ErrorInfo> {
        self.delay_ms
            .map(|ms| {
                Duration::try_milliseconds(ms).ok_or_else(|| {
                    ErrorInfo::new("invalid_params", format!("delayMs out of range: {}", ms))
                })
            })
            .transpose()
    }
}

/// A repo is addressed by its key, or by any path inside it.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoParams {
    #[serde(default)]
    repo_key: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
}

impl RepoParams {
    fn key(&self) -> Result<String, ErrorInfo> {
        match (&self.repo_key, &self.path) {
            (Some(key), _) if !key.trim().is_empty() => Ok(key.clone()),
            (_, Some(path)) => Ok(resolve_repo_key(path)),
            _ => Err(ErrorInfo::new("invalid_params", "repoKey or path is required")),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoItemParams {
    #[serde(flatten)]
    repo: RepoParams,
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoListParams {
    #[serde(flatten)]
    repo: RepoParams,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TraceParams {
    #[serde(flatten)]
    repo: RepoParams,
    include: bool,
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LimitParams {
    limit: Option<usize>,
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, ErrorInfo> {
    let params = params.unwrap_or_else(|| Value::Object(Default::default()));
    if !params.is_object() {
        return Err(ErrorInfo::new("invalid_params", "params must be an object"));
    }
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("invalid params: {}", err)))
}

fn repo_key_param(params: Option<Value>) -> Result<String, ErrorInfo> {
    parse_params::<RepoParams>(params)?.key()
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────────────────────────────────────

macro_rules! params_or_return {
    ($id:expr, $parsed:expr) => {
        match $parsed {
            Ok(value) => value,
            Err(err) => return Response::error_with_info($id, err),
        }
    };
}

pub fn handle_request(engine: &mut FlowEngine, request: Request) -> Response {
    let Request {
        protocol_version,
        method,
        id,
        params,
    } = request;

    if protocol_version.is_some_and(|v| v != PROTOCOL_VERSION) {
        return Response::error(id, "protocol_mismatch", "unsupported protocol version");
    }

    match method.as_str() {
        "get_health" => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            if let Ok(value) = serde_json::to_value(engine.health()) {
                data["engine"] = value;
            }
            Response::ok(id, data)
        }

        // Lifecycle
        "start_session" => {
            let p: StartParams = params_or_return!(id, parse_params(params));
            Response::from_result(id, engine.start_session(&p.handle, &p.cwd, p.reason.as_deref()))
        }
        "end_session" => {
            let p: EndParams = params_or_return!(id, parse_params(params));
            let reason = p
                .reason
                .as_deref()
                .map(EndReason::from)
                .unwrap_or(EndReason::Manual);
            Response::from_result(id, engine.end_session(&p.handle, reason))
        }
        "record_activity" => {
            let p: ActivityParams = params_or_return!(id, parse_params(params));
            let source = p.source.as_deref().unwrap_or("activity");
            Response::from_result(
                id,
                engine
                    .record_activity(&p.handle, source)
                    .map(|outcome| serde_json::json!({ "sampled": outcome.sampled, "closedGap": outcome.closed_gap })),
            )
        }
        "set_intent" => {
            let p: TextParams = params_or_return!(id, parse_params(params));
            Response::from_result(id, engine.set_intent(&p.handle, &p.text))
        }
        "add_parked_thought" => {
            let p: TextParams = params_or_return!(id, parse_params(params));
            Response::from_result(id, engine.add_parked_thought(&p.handle, &p.text))
        }
        "queue_time_echo" => {
            let p: TextParams = params_or_return!(id, parse_params(params));
            let delay = params_or_return!(id, p.delay());
            Response::from_result(id, engine.queue_time_echo(&p.handle, &p.text, delay))
        }

        // Reads
        "get_active_session" => {
            let p: HandleParams = params_or_return!(id, parse_params(params));
            Response::from_data(id, &engine.get_active_session(&p.handle))
        }
        "get_last_session" => {
            let p: RepoParams = params_or_return!(id, parse_params(params));
            let view = if p.repo_key.is_some() || p.path.is_some() {
                let key = params_or_return!(id, p.key());
                engine.get_last_session_for_repo(&key)
            } else {
                engine.get_last_session()
            };
            Response::from_data(id, &view)
        }
        "get_session" => {
            let p: IdParams = params_or_return!(id, parse_params(params));
            Response::from_data(id, &engine.get_session(&p.id))
        }
        "get_all_sessions" => Response::from_data(id, &engine.get_all_sessions()),
        "get_recent_sessions" => {
            let p: LimitParams = params_or_return!(id, parse_params(params));
            let limit = p.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
            Response::from_data(id, &engine.get_recent_sessions(limit))
        }
        "get_repo_sessions" => {
            let p: RepoListParams = params_or_return!(id, parse_params(params));
            let key = params_or_return!(id, p.repo.key());
            Response::from_data(id, &engine.get_repo_sessions(&key, p.limit))
        }

        // Deletion
        "delete_session" => {
            let p: IdParams = params_or_return!(id, parse_params(params));
            Response::from_result(id, engine.delete_session(&p.id).map(|s| s.id))
        }
        "delete_repo_context" => {
            let key = params_or_return!(id, repo_key_param(params));
            Response::from_result(
                id,
                engine
                    .delete_repo_context(&key)
                    .map(|removed| serde_json::json!({ "removedSessions": removed })),
            )
        }

        // Mailbox
        "drain_time_echoes" => {
            let key = params_or_return!(id, repo_key_param(params));
            Response::from_data(id, &engine.drain_time_echoes(&key))
        }
        "get_delivered_time_echoes" => {
            let key = params_or_return!(id, repo_key_param(params));
            Response::from_data(id, &engine.delivered_time_echoes(&key))
        }
        "park_time_echo" => {
            let p: RepoItemParams = params_or_return!(id, parse_params(params));
            let key = params_or_return!(id, p.repo.key());
            Response::from_result(id, engine.park_time_echo(&key, &p.id))
        }
        "discard_time_echo" => {
            let p: RepoItemParams = params_or_return!(id, parse_params(params));
            let key = params_or_return!(id, p.repo.key());
            Response::from_result(id, engine.discard_time_echo(&key, &p.id))
        }

        // Thoughts
        "get_parked_thoughts" => {
            let key = params_or_return!(id, repo_key_param(params));
            Response::from_data(id, &engine.get_parked_thoughts(&key))
        }
        "delete_parked_thought" => {
            let p: RepoItemParams = params_or_return!(id, parse_params(params));
            let key = params_or_return!(id, p.repo.key());
            Response::from_result(
                id,
                engine
                    .delete_parked_thought(&key, &p.id)
                    .map(|copies| serde_json::json!({ "removedCopies": copies })),
            )
        }

        // Trace
        "set_include_trace" => {
            let p: TraceParams = params_or_return!(id, parse_params(params));
            let key = params_or_return!(id, p.repo.key());
            Response::from_result(
                id,
                engine
                    .set_include_trace(&key, p.include)
                    .map(|()| serde_json::json!({ "include": p.include })),
            )
        }
        "get_include_trace" => {
            let key = params_or_return!(id, repo_key_param(params));
            Response::ok(id, serde_json::json!({ "include": engine.get_include_trace(&key) }))
        }
        "read_trace" => {
            let key = params_or_return!(id, repo_key_param(params));
            Response::from_result(id, engine.read_trace(&key))
        }

        other => Response::error(id, "unknown_method", format!("unknown method: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::io::Cursor;
    use std::sync::Arc;
    use vibeflow_core::{EngineConfig, ManualClock};

    fn engine() -> (FlowEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 31, 9, 0, 0).unwrap(),
        ));
        (FlowEngine::in_memory(EngineConfig::app(), clock.clone()), clock)
    }

    fn call(engine: &mut FlowEngine, method: &str, params: Value) -> Response {
        handle_request(
            engine,
            Request {
                protocol_version: None,
                method: method.to_string(),
                id: Some("1".to_string()),
                params: Some(params),
            },
        )
    }

    #[test]
    fn start_then_end_round_trip() {
        let (mut engine, clock) = engine();
        let started = call(
            &mut engine,
            "start_session",
            json!({"handle": "tab-1", "cwd": "/work/serve-test"}),
        );
        assert!(started.ok);
        assert_eq!(started.data.unwrap()["outcome"], "started");

        let again = call(
            &mut engine,
            "start_session",
            json!({"handle": "tab-1", "cwd": "/work/serve-test"}),
        );
        assert_eq!(again.data.unwrap()["outcome"], "alreadyActive");

        clock.advance(Duration::minutes(2));
        let ended = call(
            &mut engine,
            "end_session",
            json!({"handle": "tab-1", "reason": "tab-closed"}),
        );
        let data = ended.data.unwrap();
        assert_eq!(data["status"]["state"], "ended");
        assert_eq!(data["status"]["reason"], "tab-closed");

        let second = call(&mut engine, "end_session", json!({"handle": "tab-1"}));
        assert!(second.ok);
        assert_eq!(second.data.unwrap(), Value::Null);
    }

    #[test]
    fn missing_session_maps_to_error_code() {
        let (mut engine, _) = engine();
        let response = call(
            &mut engine,
            "set_intent",
            json!({"handle": "tab-9", "text": "ship"}),
        );
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, "no_active_session");
    }

    #[test]
    fn bad_params_and_unknown_methods_are_rejected() {
        let (mut engine, _) = engine();
        let response = call(&mut engine, "start_session", json!({"cwd": "/work"}));
        assert_eq!(response.error.unwrap().code, "invalid_params");

        let response = call(&mut engine, "drain_time_echoes", json!({}));
        assert_eq!(response.error.unwrap().code, "invalid_params");

        let response = call(&mut engine, "launch_rockets", json!({}));
        assert_eq!(response.error.unwrap().code, "unknown_method");

        let response = handle_request(
            &mut engine,
            Request {
                protocol_version: Some(99),
                method: "get_health".into(),
                id: None,
                params: None,
            },
        );
        assert_eq!(response.error.unwrap().code, "protocol_mismatch");
    }

    #[test]
    fn echo_delay_outside_time_range_is_rejected() {
        let (mut engine, _) = engine();
        call(
            &mut engine,
            "start_session",
            json!({"handle": "tab-1", "cwd": "/work/serve-echo-range"}),
        );

        for delay_ms in [i64::MAX, i64::MIN, 9_000_000_000_000_000] {
            let response = call(
                &mut engine,
                "queue_time_echo",
                json!({"handle": "tab-1", "text": "later", "delayMs": delay_ms}),
            );
            assert!(!response.ok, "delayMs {delay_ms} accepted");
            assert_eq!(response.error.unwrap().code, "invalid_params");
        }

        let queued = call(
            &mut engine,
            "queue_time_echo",
            json!({"handle": "tab-1", "text": "later", "delayMs": 60_000}),
        );
        assert!(queued.ok);
    }

    #[test]
    fn thought_and_trace_methods_accept_path() {
        let (mut engine, _) = engine();
        call(
            &mut engine,
            "start_session",
            json!({"handle": "tab-1", "cwd": "/work/serve-thoughts"}),
        );
        let parked = call(
            &mut engine,
            "add_parked_thought",
            json!({"handle": "tab-1", "text": "idea"}),
        );
        let thought_id = parked.data.unwrap()["id"].as_str().unwrap().to_string();

        let listed = call(
            &mut engine,
            "get_parked_thoughts",
            json!({"path": "/work/serve-thoughts"}),
        );
        assert_eq!(listed.data.unwrap().as_array().unwrap().len(), 1);

        let deleted = call(
            &mut engine,
            "delete_parked_thought",
            json!({"path": "/work/serve-thoughts", "id": thought_id}),
        );
        assert_eq!(deleted.data.unwrap()["removedCopies"], 2);

        let missing = call(
            &mut engine,
            "delete_parked_thought",
            json!({"path": "/work/serve-thoughts", "id": thought_id}),
        );
        assert_eq!(missing.error.unwrap().code, "not_found");

        let trace = call(&mut engine, "get_include_trace", json!({"path": "/work/serve-thoughts"}));
        assert_eq!(trace.data.unwrap()["include"], false);
    }

    #[test]
    fn health_reports_engine_state() {
        let (mut engine, _) = engine();
        let response = call(&mut engine, "get_health", json!({}));
        let data = response.data.unwrap();
        assert_eq!(data["status"], "ok");
        assert_eq!(data["engine"]["activeSessions"], 0);
        assert_eq!(data["engine"]["autoEnd"], "10m");
    }

    #[test]
    fn read_line_splits_and_detects_eof() {
        let mut reader = Cursor::new(b"{\"method\":\"a\"}\n\n{\"method\":\"b\"}".to_vec());
        assert_eq!(
            read_line(&mut reader).unwrap(),
            Line::Data(b"{\"method\":\"a\"}".to_vec())
        );
        assert_eq!(read_line(&mut reader).unwrap(), Line::Data(Vec::new()));
        assert_eq!(
            read_line(&mut reader).unwrap(),
            Line::Data(b"{\"method\":\"b\"}".to_vec())
        );
        assert_eq!(read_line(&mut reader).unwrap(), Line::Eof);
    }

    #[test]
    fn oversized_line_is_skipped_and_stream_continues() {
        let mut input = vec![b'x'; MAX_REQUEST_BYTES + 10];
        input.push(b'\n');
        input.extend_from_slice(b"{\"method\":\"get_health\"}\n");
        let mut reader = Cursor::new(input);

        assert_eq!(read_line(&mut reader).unwrap(), Line::TooLarge);
        assert_eq!(
            read_line(&mut reader).unwrap(),
            Line::Data(b"{\"method\":\"get_health\"}".to_vec())
        );
    }

    #[test]
    fn responses_are_single_lines() {
        let mut out: Vec<u8> = Vec::new();
        write_response(&mut out, &Response::ok(Some("1".into()), json!({"a": 1}))).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "{\"ok\":true,\"id\":\"1\",\"data\":{\"a\":1}}\n");
    }
}
