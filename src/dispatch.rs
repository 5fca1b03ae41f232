//! Request Dispatcher: the line-oriented request loop.
//!
//! [`serve`] writes the ready line, then reads one request per line and
//! writes exactly one response line for it before reading the next.
//! Nothing a single request does can stop the loop: bad JSON, unknown
//! methods, bad params and handler panics all become error responses.
//! Only end of input (clean stop) or an I/O error on either stream ends it.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::{self, BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::bridge::Bridge;
use crate::error::{panic_message, BridgeError, Result};
use crate::protocol::{parse_request, ready_line, Method, Response};

/// Run the loop until end of input. Returns the number of requests
/// answered.
pub fn serve<R: BufRead, W: Write>(bridge: &Bridge, mut input: R, mut output: W) -> io::Result<u64> {
    write_line(&mut output, &ready_line())?;
    tracing::info!("Bridge ready");

    let mut handled = 0u64;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            tracing::info!(handled, "Input closed, shutting down");
            return Ok(handled);
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = handle_line(bridge, line);
        write_line(&mut output, &response)?;
        handled += 1;
    }
}

fn write_line<W: Write, T: serde::Serialize>(output: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *output, value)?;
    output.write_all(b"\n")?;
    output.flush()
}

/// Produce the response for one input line.
pub fn handle_line(bridge: &Bridge, line: &str) -> Response {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err((id, err)) => {
            tracing::warn!("Rejected request: {}", err);
            return Response::error(id, &err);
        }
    };

    let Some(method) = Method::parse(&request.method) else {
        tracing::warn!(method = %request.method, "Unknown method");
        return Response::error(request.id, &BridgeError::UnknownMethod(request.method));
    };
    tracing::debug!(id = %request.id, method = method.as_str(), "Received request");

    let params = request.params;
    match catch_unwind(AssertUnwindSafe(|| dispatch(bridge, method, params))) {
        Ok(Ok(result)) => Response {
            id: request.id,
            result: Some(result),
            error: None,
        },
        Ok(Err(err)) => Response::error(request.id, &err),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(method = method.as_str(), "Handler panicked: {}", message);
            Response::error(request.id, &BridgeError::Internal(message))
        }
    }
}

fn dispatch(bridge: &Bridge, method: Method, params: Value) -> Result<Value> {
    match method {
        Method::Ping => to_value(bridge.ping()),
        Method::Encode => to_value(bridge.encode(params_of(method, params)?)),
        Method::Search => to_value(bridge.search(params_of(method, params)?)),
        Method::AddContent => to_value(bridge.add_content(params_of(method, params)?)),
        Method::Stats => to_value(bridge.stats(params_of(method, params)?)),
    }
}

fn params_of<T: DeserializeOwned>(method: Method, params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| BridgeError::InvalidParams {
        method: method.as_str().to_string(),
        message: e.to_string(),
    })
}

fn to_value(result: impl serde::Serialize) -> Result<Value> {
    serde_json::to_value(result).map_err(|e| BridgeError::Internal(format!("serialize result: {}", e)))
}
