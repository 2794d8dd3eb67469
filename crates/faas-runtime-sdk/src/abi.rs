//! C-compatible handler boundary
//!
//! A handler library exports three symbols:
//!
//! | Symbol | Signature |
//! |--------|-----------|
//! | `<entry>` (default `handler`) | `extern "C" fn(*const u8, usize) -> RawBuffer` |
//! | `faas_free_buffer` | `extern "C" fn(RawBuffer)` |
//! | `faas_abi_version` | `extern "C" fn() -> u32` |
//!
//! The entry point receives a UTF-8 JSON [`InvocationRequest`] and returns a
//! UTF-8 JSON [`InvocationResponse`] in a buffer owned by the library. The
//! caller copies the bytes and hands the buffer back to `faas_free_buffer`
//! so allocation and release happen on the same side of the boundary.
//!
//! Use [`export_handler!`](crate::export_handler) rather than writing these by hand.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{Context, Environment, Snapshot};
use crate::encode;
use crate::error::HandlerError;

/// Version of the request/response envelopes
pub const ABI_VERSION: u32 = 1;

/// Symbol of the buffer release function
pub const FREE_BUFFER_SYMBOL: &[u8] = b"faas_free_buffer";

/// Symbol reporting the ABI version
pub const ABI_VERSION_SYMBOL: &[u8] = b"faas_abi_version";

/// Handler entry point
pub type HandlerEntryFn = unsafe extern "C" fn(payload: *const u8, len: usize) -> RawBuffer;

/// Buffer release function
pub type FreeBufferFn = unsafe extern "C" fn(buffer: RawBuffer);

/// Reports the ABI version a library was built with
pub type AbiVersionFn = extern "C" fn() -> u32;

/// A byte buffer allocated on one side of the boundary
#[repr(C)]
#[derive(Debug)]
pub struct RawBuffer {
    pub ptr: *mut u8,
    pub len: usize,
    pub cap: usize,
}

impl RawBuffer {
    /// Leak a vector into a raw buffer
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let mut bytes = std::mem::ManuallyDrop::new(bytes);
        Self {
            ptr: bytes.as_mut_ptr(),
            len: bytes.len(),
            cap: bytes.capacity(),
        }
    }

    /// View the buffer contents
    ///
    /// # Safety
    /// `ptr` and `len` must describe a live allocation, or `ptr` must be null.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(self.ptr, self.len)
        }
    }

    /// Reclaim a buffer created by [`RawBuffer::from_vec`] in this same library
    ///
    /// # Safety
    /// The buffer must come from `from_vec` in the same allocator and must not
    /// be used afterwards.
    pub unsafe fn into_vec(self) -> Vec<u8> {
        if self.ptr.is_null() {
            Vec::new()
        } else {
            Vec::from_raw_parts(self.ptr, self.len, self.cap)
        }
    }
}

/// What the runtime sends to a handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub input: Snapshot,
    pub context: Context,
}

/// What a handler sends back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InvocationResponse {
    /// The handler returned and its output encoded cleanly
    Ok {
        output: Value,
        /// Environment as the handler left it
        environment: Environment,
    },
    /// The invocation did not produce an output
    Failed(Failure),
}

/// Why an invocation produced no output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The returned value could not be encoded as JSON
    Encoding,
    /// The handler returned an error
    Handler,
    /// The handler panicked
    Panic,
    /// The request or response envelope was malformed
    Protocol,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Encoding => "encoding",
            FailureKind::Handler => "handler",
            FailureKind::Panic => "panic",
            FailureKind::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// A failed invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} failure: {message}")]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Run a handler function against a snapshot and context
///
/// Panics are caught, handler errors are reported as [`FailureKind::Handler`],
/// and a returned value without a faithful JSON encoding (non-string map
/// keys, NaN or infinite floats) is reported as [`FailureKind::Encoding`].
/// Mutations to `ctx.environment` stay in place.
pub fn invoke<F, T>(func: F, input: &Snapshot, ctx: &mut Context) -> Result<Value, Failure>
where
    F: FnOnce(&Snapshot, &mut Context) -> Result<T, HandlerError>,
    T: Serialize,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| func(input, ctx)));

    match outcome {
        Err(payload) => Err(Failure::new(FailureKind::Panic, panic_message(payload.as_ref()))),
        Ok(Err(err)) => Err(Failure::new(FailureKind::Handler, err.to_string())),
        Ok(Ok(value)) => encode::to_value(&value)
            .map_err(|e| Failure::new(FailureKind::Encoding, e.to_string())),
    }
}

/// Decode a request payload, run the handler and build the response
pub fn dispatch<F, T>(payload: &[u8], func: F) -> InvocationResponse
where
    F: FnOnce(&Snapshot, &mut Context) -> Result<T, HandlerError>,
    T: Serialize,
{
    let request: InvocationRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            return InvocationResponse::Failed(Failure::new(
                FailureKind::Protocol,
                format!("Failed to parse invocation request: {}", e),
            ))
        }
    };

    let InvocationRequest { input, mut context } = request;
    match invoke(func, &input, &mut context) {
        Ok(output) => InvocationResponse::Ok { output, environment: context.environment },
        Err(failure) => InvocationResponse::Failed(failure),
    }
}

/// Raw entry point used by [`export_handler!`](crate::export_handler)
///
/// # Safety
/// `payload` must point to `len` readable bytes, or be null with `len == 0`.
pub unsafe fn dispatch_raw<F, T>(payload: *const u8, len: usize, func: F) -> RawBuffer
where
    F: FnOnce(&Snapshot, &mut Context) -> Result<T, HandlerError>,
    T: Serialize,
{
    let bytes = if payload.is_null() {
        &[][..]
    } else {
        std::slice::from_raw_parts(payload, len)
    };

    let response = dispatch(bytes, func);
    // A response only holds Values and Strings, so encoding cannot fail
    let encoded = serde_json::to_vec(&response).unwrap_or_else(|e| {
        format!(r#"{{"status":"failed","kind":"protocol","message":"{}"}}"#, e).into_bytes()
    });
    RawBuffer::from_vec(encoded)
}

/// Release a buffer returned by [`dispatch_raw`]
///
/// # Safety
/// See [`RawBuffer::into_vec`].
pub unsafe fn free_raw(buffer: RawBuffer) {
    drop(buffer.into_vec());
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StoreEndpoint;
    use serde_json::json;
    use std::collections::HashMap;

    fn context() -> Context {
        Context::new(
            StoreEndpoint { host: "localhost".into(), port: 6379, db: 0 },
            "metrics",
            "out",
        )
    }

    fn counting(input: &Snapshot, ctx: &mut Context) -> Result<Value, HandlerError> {
        let count: u64 = ctx.env_or_default("count");
        ctx.set_env("count", count + 1)?;
        Ok(json!({"count": count + 1, "keys": input.len()}))
    }

    #[test]
    fn test_invoke_keeps_environment_mutation() {
        let mut ctx = context();
        let input = Snapshot::new();

        assert_eq!(invoke(counting, &input, &mut ctx).unwrap(), json!({"count": 1, "keys": 0}));
        assert_eq!(invoke(counting, &input, &mut ctx).unwrap(), json!({"count": 2, "keys": 0}));
        assert_eq!(ctx.environment["count"], json!(2));
    }

    #[test]
    fn test_invoke_reports_unencodable_output() {
        let mut ctx = context();
        let failure = invoke(
            |_: &Snapshot, _: &mut Context| {
                let mut map = HashMap::new();
                map.insert((1, 2), "tuple keys are not JSON object keys");
                Ok(map)
            },
            &Snapshot::new(),
            &mut ctx,
        )
        .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Encoding);
    }

    #[test]
    fn test_invoke_rejects_non_finite_output() {
        let mut ctx = context();
        let failure = invoke(
            |_: &Snapshot, _: &mut Context| {
                let mut out = std::collections::BTreeMap::new();
                out.insert("avg-60sec-cpu_percent-0", f64::NAN);
                Ok(out)
            },
            &Snapshot::new(),
            &mut ctx,
        )
        .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Encoding);
    }

    #[test]
    fn test_invoke_catches_panic() {
        let mut ctx = context();
        let failure = invoke(
            |_: &Snapshot, _: &mut Context| -> Result<Value, HandlerError> { panic!("boom") },
            &Snapshot::new(),
            &mut ctx,
        )
        .unwrap_err();

        assert_eq!(failure, Failure::new(FailureKind::Panic, "boom"));
    }

    #[test]
    fn test_invoke_reports_handler_error() {
        let mut ctx = context();
        let failure = invoke(
            |_: &Snapshot, _: &mut Context| -> Result<Value, HandlerError> {
                Err(HandlerError::Internal("nope".into()))
            },
            &Snapshot::new(),
            &mut ctx,
        )
        .unwrap_err();

        assert_eq!(failure.kind, FailureKind::Handler);
        assert_eq!(failure.message, "Internal error: nope");
    }

    #[test]
    fn test_dispatch_returns_environment() {
        let mut input = Snapshot::new();
        input.insert("a".into(), json!(1));
        let request = InvocationRequest { input, context: context() };
        let payload = serde_json::to_vec(&request).unwrap();

        match dispatch(&payload, counting) {
            InvocationResponse::Ok { output, environment } => {
                assert_eq!(output, json!({"count": 1, "keys": 1}));
                assert_eq!(environment["count"], json!(1));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_rejects_garbage() {
        match dispatch(b"not json", counting) {
            InvocationResponse::Failed(failure) => assert_eq!(failure.kind, FailureKind::Protocol),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_raw_buffer_round_trip() {
        let request = InvocationRequest { input: Snapshot::new(), context: context() };
        let payload = serde_json::to_vec(&request).unwrap();

        let buffer = unsafe { dispatch_raw(payload.as_ptr(), payload.len(), counting) };
        let response: InvocationResponse =
            serde_json::from_slice(unsafe { buffer.as_slice() }).unwrap();
        unsafe { free_raw(buffer) };

        assert!(matches!(response, InvocationResponse::Ok { .. }));
    }

    #[test]
    fn test_response_wire_format() {
        let failed = InvocationResponse::Failed(Failure::new(FailureKind::Encoding, "bad"));
        assert_eq!(
            serde_json::to_value(&failed).unwrap(),
            json!({"status": "failed", "kind": "encoding", "message": "bad"})
        );
    }
}
