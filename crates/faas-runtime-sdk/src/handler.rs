//! Handler export macro
//!
//! Handlers are plain Rust functions compiled into a shared library
//! (`crate-type = ["cdylib"]`) and loaded by the runtime on every
//! change-triggered cycle.
//!
//! # Example
//!
//! ```ignore
//! use faas_runtime_sdk::prelude::*;
//!
//! fn aggregate(input: &Snapshot, ctx: &mut Context) -> Result<JsonValue, HandlerError> {
//!     let mut runs: u64 = ctx.env_or_default("runs");
//!     runs += 1;
//!     ctx.set_env("runs", runs)?;
//!     Ok(json!({"runs": runs, "keys": input.len()}))
//! }
//!
//! // Exported as `handler`, the runtime's default entry name
//! export_handler!(aggregate);
//!
//! // Or under a custom name, matched by USER_HANDLER_NAME
//! // export_handler!(aggregate as summarize);
//! ```
//!
//! One handler per library: the macro also exports the fixed
//! `faas_free_buffer` and `faas_abi_version` symbols.

/// Export a handler function through the C ABI
///
/// The function must have the shape
/// `fn(&Snapshot, &mut Context) -> Result<T, HandlerError>` with `T: Serialize`,
/// and must not share its name with the exported symbol.
#[macro_export]
macro_rules! export_handler {
    ($func:path as $symbol:ident) => {
        #[no_mangle]
        pub unsafe extern "C" fn $symbol(
            payload: *const u8,
            len: usize,
        ) -> $crate::abi::RawBuffer {
            $crate::abi::dispatch_raw(payload, len, $func)
        }

        #[no_mangle]
        pub unsafe extern "C" fn faas_free_buffer(buffer: $crate::abi::RawBuffer) {
            $crate::abi::free_raw(buffer)
        }

        #[no_mangle]
        pub extern "C" fn faas_abi_version() -> u32 {
            $crate::abi::ABI_VERSION
        }
    };
    ($func:path) => {
        $crate::export_handler!($func as handler);
    };
}

#[cfg(test)]
mod tests {
    mod exported {
        use crate::prelude::*;

        fn echo(input: &Snapshot, _ctx: &mut Context) -> Result<JsonValue, HandlerError> {
            Ok(JsonValue::Object(input.clone()))
        }

        crate::export_handler!(echo as echo_entry);
    }

    use crate::abi::{InvocationRequest, InvocationResponse, ABI_VERSION};
    use crate::context::{Context, Snapshot, StoreEndpoint};
    use serde_json::json;

    #[test]
    fn test_exported_symbols_follow_abi() {
        let mut input = Snapshot::new();
        input.insert("cpu_percent-0".into(), json!(10.0));
        let request = InvocationRequest {
            input: input.clone(),
            context: Context::new(
                StoreEndpoint { host: "localhost".into(), port: 6379, db: 0 },
                "metrics",
                "out",
            ),
        };
        let payload = serde_json::to_vec(&request).unwrap();

        let buffer = unsafe { exported::echo_entry(payload.as_ptr(), payload.len()) };
        let response: InvocationResponse =
            serde_json::from_slice(unsafe { buffer.as_slice() }).unwrap();
        unsafe { exported::faas_free_buffer(buffer) };

        assert_eq!(exported::faas_abi_version(), ABI_VERSION);
        match response {
            InvocationResponse::Ok { output, .. } => assert_eq!(output, json!(input)),
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
