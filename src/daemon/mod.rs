//! HTTP runner daemon
//!
//! A small REST service for starting and stopping operator instances.
//! `POST /` with `{id, gens, props}` builds the referenced operator,
//! wraps it behind a fresh boundary, starts it, and answers
//! `{status, handle, url}`. `DELETE /` with `{handle}` stops and removes
//! the instance. Failures are reported as
//! `{status: "error", error: {msg, code}}`.
//!
//! Requests are processed sequentially; the running-instance table is
//! process-wide and guarded by a mutex.

use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use crate::loader::Environ;
use crate::runtime::builder::build_and_compile;
use crate::runtime::def::{InstanceDef, OperatorDef, MAIN_SERVICE};
use crate::runtime::error::{Result, RuntimeError};
use crate::runtime::operator::Operator;
use crate::runtime::registry::BuiltinCatalog;
use crate::runtime::typedef::Generics;
use crate::runtime::value::{Properties, Value};

/// Lowest port probed for instances
const PORT_FLOOR: u16 = 50000;

#[derive(Deserialize)]
struct RunInstruction {
    id: String,
    #[serde(default, alias = "gens")]
    generics: Generics,
    #[serde(default, alias = "props")]
    properties: Properties,
    #[serde(default)]
    stream: bool,
}

#[derive(Deserialize)]
struct StopInstruction {
    handle: String,
}

struct RunningInstance {
    port: u16,
    operator: Arc<Operator>,
}

/// The runner: builds, starts, and stops operator instances.
pub struct RunnerService {
    environ: Environ,
    instances: Mutex<HashMap<u64, RunningInstance>>,
}

impl RunnerService {
    /// Create a runner resolving operator ids through `environ`.
    pub fn new(environ: Environ) -> Self {
        Self {
            environ,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Serve requests from the listener until it fails. Connections are
    /// handled one at a time.
    pub fn serve(&self, listener: TcpListener) -> io::Result<()> {
        for stream in listener.incoming() {
            let stream = stream?;
            if let Err(err) = self.handle_connection(stream) {
                tracing::warn!(error = %err, "connection failed");
            }
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);

        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        let method = request_line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();

        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line)?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some(value) = line
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(str::trim)
            {
                content_length = value.parse().unwrap_or(0);
            }
        }

        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;
        let body = String::from_utf8_lossy(&body).to_string();

        let response = self.dispatch(&method, &body);
        let payload = response.to_string();

        let mut stream = stream;
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            payload.len(),
            payload
        )?;
        stream.flush()
    }

    /// Dispatch one request body by method, returning the response JSON.
    pub fn dispatch(&self, method: &str, body: &str) -> JsonValue {
        let outcome = match method {
            "POST" => self.start_instance(body),
            "DELETE" => self.stop_instance(body),
            other => Err(RuntimeError::UnknownOperator(format!(
                "unsupported method {other}"
            ))),
        };

        match outcome {
            Ok(response) => response,
            Err(err) => json!({
                "status": "error",
                "error": { "msg": err.to_string(), "code": "E000X" }
            }),
        }
    }

    fn start_instance(&self, body: &str) -> Result<JsonValue> {
        let instruction: RunInstruction = serde_json::from_str(body)?;

        let port = free_port()?;
        let def = self.wrap_operator(&instruction)?;
        let operator = build_and_compile(def, &Generics::new(), &Properties::new())?;

        operator.main().output().bufferize();
        operator.start()?;
        // Trigger-driven operators get kicked off right away.
        if operator.main().input().kind() == crate::runtime::typedef::TypeKind::Trigger {
            operator.main().input().push(Value::Null);
        }

        let handle: u64 = rand::thread_rng().gen();
        tracing::info!(
            operator = %instruction.id,
            handle = format!("{handle:x}"),
            port,
            streaming = instruction.stream,
            "instance started"
        );

        self.instances.lock().insert(
            handle,
            RunningInstance {
                port,
                operator,
            },
        );

        Ok(json!({
            "status": "success",
            "handle": format!("{handle:x}"),
            "url": format!("/instance/{handle:x}"),
        }))
    }

    fn stop_instance(&self, body: &str) -> Result<JsonValue> {
        let instruction: StopInstruction = serde_json::from_str(body)?;
        let handle = u64::from_str_radix(&instruction.handle, 16)
            .map_err(|_| RuntimeError::UnknownOperator(instruction.handle.clone()))?;

        let removed = self
            .instances
            .lock()
            .remove(&handle)
            .ok_or_else(|| RuntimeError::UnknownOperator(format!("unknown handle {handle:x}")))?;

        removed.operator.stop();
        tracing::info!(
            handle = %instruction.handle,
            port = removed.port,
            "instance stopped"
        );
        Ok(json!({ "status": "success" }))
    }

    /// Wrap the referenced operator behind a one-child boundary whose
    /// main service mirrors the target's specialized types.
    fn wrap_operator(&self, instruction: &RunInstruction) -> Result<OperatorDef> {
        let catalog = BuiltinCatalog::global();

        let mut instance = InstanceDef::new("op", instruction.id.clone());
        instance.generics = instruction.generics.clone();
        instance.properties = instruction.properties.clone();

        let inner = if catalog.is_registered(&instruction.id) {
            catalog.operator_def(&instruction.id)?
        } else {
            let def = self.environ.read_operator_id(&instruction.id)?;
            instance.operator_def = Some(def.clone());
            def
        };

        let mut boundary = inner.copy();
        boundary.specify_operator(&instruction.generics, &instruction.properties)?;
        let main = boundary
            .services
            .remove(MAIN_SERVICE)
            .ok_or_else(|| RuntimeError::UnknownOperator(instruction.id.clone()))?;

        let mut def = OperatorDef::default();
        def.services.insert(MAIN_SERVICE.to_string(), main);
        def.instances.push(instance);
        def.connections
            .insert("(".to_string(), vec!["op(".to_string()]);
        def.connections
            .insert("op)".to_string(), vec![")".to_string()]);
        Ok(def)
    }
}

/// Probe for a free TCP port above the floor.
fn free_port() -> Result<u16> {
    let mut port = PORT_FLOOR;
    loop {
        port = port
            .checked_add(1)
            .ok_or_else(|| RuntimeError::Io(io::Error::new(
                io::ErrorKind::AddrInUse,
                "no free port above 50000",
            )))?;
        match TcpListener::bind(("127.0.0.1", port)) {
            Ok(listener) => {
                drop(listener);
                return Ok(port);
            }
            Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elem::{RAND_RANGE_ID, VALUE_ID};
    use tempfile::TempDir;

    fn runner() -> (RunnerService, TempDir) {
        let temp = TempDir::new().unwrap();
        let service = RunnerService::new(Environ::new(temp.path()));
        (service, temp)
    }

    #[test]
    fn test_start_and_stop_builtin_instance() {
        let (service, _temp) = runner();

        let body = serde_json::json!({ "id": RAND_RANGE_ID.to_string() }).to_string();
        let response = service.dispatch("POST", &body);
        assert_eq!(response["status"], "success");
        let handle = response["handle"].as_str().unwrap().to_string();
        assert_eq!(
            response["url"].as_str().unwrap(),
            format!("/instance/{handle}")
        );

        let body = serde_json::json!({ "handle": handle }).to_string();
        let response = service.dispatch("DELETE", &body);
        assert_eq!(response["status"], "success");
    }

    #[test]
    fn test_trigger_instance_produces_output_after_post() {
        let (service, _temp) = runner();

        // A trigger-driven operator is kicked off by the daemon itself,
        // so output must show up without any further input.
        let body = serde_json::json!({
            "id": VALUE_ID.to_string(),
            "generics": { "valueType": { "type": "string" } },
            "properties": { "value": "hello" },
        })
        .to_string();
        let response = service.dispatch("POST", &body);
        assert_eq!(response["status"], "success");

        let handle_text = response["handle"].as_str().unwrap().to_string();
        let handle = u64::from_str_radix(&handle_text, 16).unwrap();
        let operator = service
            .instances
            .lock()
            .get(&handle)
            .unwrap()
            .operator
            .clone();
        assert_eq!(
            operator.main().output().pull(),
            Value::String("hello".into())
        );

        let body = serde_json::json!({ "handle": handle_text }).to_string();
        assert_eq!(service.dispatch("DELETE", &body)["status"], "success");
    }

    #[test]
    fn test_unknown_operator_reports_error() {
        let (service, _temp) = runner();
        let body = serde_json::json!({ "id": "no.such.operator" }).to_string();
        let response = service.dispatch("POST", &body);
        assert_eq!(response["status"], "error");
        assert!(response["error"]["msg"].as_str().unwrap().contains("no.such.operator"));
    }

    #[test]
    fn test_unknown_handle_reports_error() {
        let (service, _temp) = runner();
        let body = serde_json::json!({ "handle": "abcdef" }).to_string();
        let response = service.dispatch("DELETE", &body);
        assert_eq!(response["status"], "error");
    }

    #[test]
    fn test_malformed_body_reports_error() {
        let (service, _temp) = runner();
        let response = service.dispatch("POST", "{not json");
        assert_eq!(response["status"], "error");
        assert_eq!(response["error"]["code"], "E000X");
    }

    #[test]
    fn test_serve_over_socket() {
        let (service, _temp) = runner();
        let service = Arc::new(service);
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        let server = service.clone();
        std::thread::spawn(move || {
            let _ = server.serve(listener);
        });

        let body = serde_json::json!({ "id": RAND_RANGE_ID.to_string() }).to_string();
        let mut stream = TcpStream::connect(address).unwrap();
        write!(
            stream,
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let json_start = response.find("\r\n\r\n").unwrap() + 4;
        let payload: JsonValue = serde_json::from_str(&response[json_start..]).unwrap();
        assert_eq!(payload["status"], "success");
    }
}
