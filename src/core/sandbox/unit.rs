use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wasmtime::*;

use super::capabilities::Capabilities;
use super::result::{AgentLogEntry, FailureKind, ResourceUsage};
use crate::core::error::ServiceError;

/// Import namespace of the host functions agent code may call.
pub(crate) const IMPORT_MODULE: &str = "agent";

const MAX_LOG_ENTRIES: usize = 1000;

/// Everything a single unit can see. Dropped together with its `Store`.
pub(crate) struct UnitState {
    agent_id: String,
    input: Vec<u8>,
    config: Vec<u8>,
    memory_blob: Vec<u8>,
    /// Last capability reply, or the message of the last service error.
    response: Vec<u8>,
    /// Service error the code has not read yet.
    unread_error: Option<String>,
    output: Option<Value>,
    staged_memory: Option<Value>,
    logs: Vec<AgentLogEntry>,
    capability_calls: u32,
    capabilities: Arc<Capabilities>,
    cancel: CancellationToken,
    rt: Handle,
    limiter: StoreLimits,
}

impl UnitState {
    pub(crate) fn new(
        agent_id: String,
        input: &Value,
        config: &Value,
        memory: &Value,
        capabilities: Arc<Capabilities>,
        cancel: CancellationToken,
        rt: Handle,
        max_memory_bytes: usize,
    ) -> Self {
        Self {
            agent_id,
            input: input.to_string().into_bytes(),
            config: config.to_string().into_bytes(),
            memory_blob: memory.to_string().into_bytes(),
            response: Vec::new(),
            unread_error: None,
            output: None,
            staged_memory: None,
            logs: Vec::new(),
            capability_calls: 0,
            capabilities,
            cancel,
            rt,
            limiter: StoreLimitsBuilder::new()
                .memory_size(max_memory_bytes)
                .instances(1)
                .build(),
        }
    }
}

/// What a unit posts back once `run` returns or traps.
pub(crate) struct UnitOutcome {
    /// `Ok(None)` means the code finished without calling `set_output`.
    pub result: Result<Option<Value>, (FailureKind, String)>,
    pub staged_memory: Option<Value>,
    pub logs: Vec<AgentLogEntry>,
    pub usage: ResourceUsage,
}

pub(crate) fn engine() -> Result<Engine> {
    let mut config = Config::new();
    config.epoch_interruption(true);
    Engine::new(&config)
}

/// Compile and run one invocation on the current (blocking) thread.
pub(crate) fn run_unit(engine: &Engine, code: &str, state: UnitState) -> UnitOutcome {
    let mut store = Store::new(engine, state);
    store.limiter(|state| &mut state.limiter);
    store.set_epoch_deadline(1);
    store.epoch_deadline_trap();

    // Terminated before the deadline was armed.
    let driven = if store.data().cancel.is_cancelled() {
        Err((FailureKind::Cancelled, "unit cancelled before start".to_string()))
    } else {
        drive(engine, code, &mut store)
    };
    let memory_bytes = driven.as_ref().map(|bytes| *bytes).unwrap_or(0);
    let state = store.into_data();

    let result = match driven {
        Err(failure) => Err(failure),
        Ok(_) => match state.unread_error {
            Some(message) => Err((
                FailureKind::UncaughtService,
                format!("uncaught service error: {}", message),
            )),
            None => Ok(state.output),
        },
    };

    let output_bytes = match &result {
        Ok(Some(output)) => output.to_string().len() as u64,
        _ => 0,
    };

    UnitOutcome {
        result,
        staged_memory: state.staged_memory,
        logs: state.logs,
        usage: ResourceUsage {
            capability_calls: state.capability_calls,
            memory_bytes,
            output_bytes,
        },
    }
}

/// Returns the final linear memory size on success.
fn drive(
    engine: &Engine,
    code: &str,
    store: &mut Store<UnitState>,
) -> std::result::Result<u64, (FailureKind, String)> {
    let module = Module::new(engine, code)
        .map_err(|e| (FailureKind::Parse, format!("code does not compile: {:#}", e)))?;
    let linker = build_linker(engine)
        .map_err(|e| (FailureKind::Runtime, format!("could not link host functions: {:#}", e)))?;
    let instance = linker
        .instantiate(&mut *store, &module)
        .map_err(|e| (FailureKind::Runtime, format!("instantiation failed: {:#}", e)))?;
    let run = instance
        .get_typed_func::<(), ()>(&mut *store, "run")
        .map_err(|e| (FailureKind::Parse, format!("missing `run` export: {:#}", e)))?;

    if let Err(e) = run.call(&mut *store, ()) {
        return Err(match e.downcast_ref::<Trap>() {
            Some(Trap::Interrupt) => (FailureKind::Cancelled, "unit interrupted".to_string()),
            Some(trap) => (FailureKind::Runtime, format!("agent code trapped: {}", trap)),
            None => (FailureKind::Runtime, format!("agent code failed: {:#}", e)),
        });
    }

    Ok(instance
        .get_memory(&mut *store, "memory")
        .map(|memory| memory.data_size(&*store) as u64)
        .unwrap_or(0))
}

// ─── Guest memory helpers ───

fn guest_memory(caller: &mut Caller<'_, UnitState>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| Error::msg("module does not export `memory`"))
}

fn read_bytes(caller: &mut Caller<'_, UnitState>, ptr: u32, len: u32) -> Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let start = ptr as usize;
    let end = start + len as usize;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| Error::msg(format!("range {}..{} is outside guest memory", start, end)))
}

fn read_str(caller: &mut Caller<'_, UnitState>, ptr: u32, len: u32) -> Result<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?)
        .map_err(|_| Error::msg("string argument is not valid UTF-8"))
}

/// Empty input reads as `null`; anything else must be valid JSON.
fn read_json(
    caller: &mut Caller<'_, UnitState>,
    ptr: u32,
    len: u32,
) -> Result<std::result::Result<Value, String>> {
    let bytes = read_bytes(caller, ptr, len)?;
    if bytes.is_empty() {
        return Ok(Ok(Value::Null));
    }
    Ok(serde_json::from_slice(&bytes).map_err(|e| format!("argument is not valid JSON: {}", e)))
}

/// Copy up to `cap` bytes into guest memory, returning the number copied.
fn write_bytes(caller: &mut Caller<'_, UnitState>, ptr: u32, cap: u32, bytes: &[u8]) -> Result<i32> {
    let memory = guest_memory(caller)?;
    let count = bytes.len().min(cap as usize);
    let start = ptr as usize;
    let target = memory
        .data_mut(&mut *caller)
        .get_mut(start..start + count)
        .ok_or_else(|| Error::msg(format!("range {}..{} is outside guest memory", start, start + count)))?;
    target.copy_from_slice(&bytes[..count]);
    Ok(clamp_len(count))
}

fn clamp_len(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

// ─── Capability plumbing ───

/// Run one capability on the coordinator's runtime, racing it against cancellation.
fn call_capability<F, Fut>(caller: &mut Caller<'_, UnitState>, name: &str, call: F) -> Result<i32>
where
    F: FnOnce(Arc<Capabilities>) -> Fut,
    Fut: Future<Output = std::result::Result<Value, ServiceError>>,
{
    let state = caller.data_mut();
    state.capability_calls += 1;
    let capabilities = state.capabilities.clone();
    let cancel = state.cancel.clone();
    let rt = state.rt.clone();

    let outcome = rt.block_on(async move {
        tokio::select! {
            _ = cancel.cancelled() => Err(ServiceError::Cancelled),
            reply = call(capabilities) => reply,
        }
    });
    finish_call(caller.data_mut(), name, outcome)
}

/// Store a capability reply in the response buffer and encode it as the return value.
fn finish_call(
    state: &mut UnitState,
    name: &str,
    outcome: std::result::Result<Value, ServiceError>,
) -> Result<i32> {
    match outcome {
        Ok(reply) => {
            state.response = reply.to_string().into_bytes();
            Ok(clamp_len(state.response.len()))
        }
        // The unit is being torn down; trap instead of handing control back.
        Err(ServiceError::Cancelled) => Err(Error::msg("capability call cancelled")),
        Err(e) => {
            let message = e.to_string();
            warn!("Agent [{}] {} failed: {}", state.agent_id, name, message);
            state.response = message.clone().into_bytes();
            state.unread_error = Some(message);
            Ok(-clamp_len(state.response.len()).max(1))
        }
    }
}

fn invalid_argument(state: &mut UnitState, name: &str, message: String) -> Result<i32> {
    state.capability_calls += 1;
    finish_call(state, name, Err(ServiceError::InvalidArgument(message)))
}

/// Host functions available to agent code under the `agent` namespace.
pub(crate) fn build_linker(engine: &Engine) -> Result<Linker<UnitState>> {
    let mut linker: Linker<UnitState> = Linker::new(engine);

    // ─── Payload plumbing ───

    linker.func_wrap(IMPORT_MODULE, "input_len", |caller: Caller<'_, UnitState>| -> i32 {
        clamp_len(caller.data().input.len())
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        "read_input",
        |mut caller: Caller<'_, UnitState>, ptr: u32, cap: u32| -> Result<i32> {
            let bytes = caller.data().input.clone();
            write_bytes(&mut caller, ptr, cap, &bytes)
        },
    )?;
    linker.func_wrap(IMPORT_MODULE, "config_len", |caller: Caller<'_, UnitState>| -> i32 {
        clamp_len(caller.data().config.len())
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        "read_config",
        |mut caller: Caller<'_, UnitState>, ptr: u32, cap: u32| -> Result<i32> {
            let bytes = caller.data().config.clone();
            write_bytes(&mut caller, ptr, cap, &bytes)
        },
    )?;
    linker.func_wrap(IMPORT_MODULE, "memory_len", |caller: Caller<'_, UnitState>| -> i32 {
        clamp_len(caller.data().memory_blob.len())
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        "read_memory",
        |mut caller: Caller<'_, UnitState>, ptr: u32, cap: u32| -> Result<i32> {
            let bytes = caller.data().memory_blob.clone();
            write_bytes(&mut caller, ptr, cap, &bytes)
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "set_memory",
        |mut caller: Caller<'_, UnitState>, ptr: u32, len: u32| -> Result<i32> {
            let bytes = read_bytes(&mut caller, ptr, len)?;
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    caller.data_mut().staged_memory = Some(value);
                    Ok(0)
                }
                Err(_) => Ok(-1),
            }
        },
    )?;
    linker.func_wrap(
        IMPORT_MODULE,
        "set_output",
        |mut caller: Caller<'_, UnitState>, ptr: u32, len: u32| -> Result<i32> {
            let bytes = read_bytes(&mut caller, ptr, len)?;
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    caller.data_mut().output = Some(value);
                    Ok(0)
                }
                Err(_) => Ok(-1),
            }
        },
    )?;

    // Reading the response buffer is how agent code acknowledges a service error.
    linker.func_wrap(IMPORT_MODULE, "response_len", |mut caller: Caller<'_, UnitState>| -> i32 {
        let state = caller.data_mut();
        state.unread_error = None;
        clamp_len(state.response.len())
    })?;
    linker.func_wrap(
        IMPORT_MODULE,
        "read_response",
        |mut caller: Caller<'_, UnitState>, ptr: u32, cap: u32| -> Result<i32> {
            let bytes = {
                let state = caller.data_mut();
                state.unread_error = None;
                state.response.clone()
            };
            write_bytes(&mut caller, ptr, cap, &bytes)
        },
    )?;

    // ─── Capabilities ───

    linker.func_wrap(
        IMPORT_MODULE,
        "send_email",
        |mut caller: Caller<'_, UnitState>,
         to_ptr: u32,
         to_len: u32,
         subject_ptr: u32,
         subject_len: u32,
         body_ptr: u32,
         body_len: u32|
         -> Result<i32> {
            let to = read_str(&mut caller, to_ptr, to_len)?;
            let subject = read_str(&mut caller, subject_ptr, subject_len)?;
            let body = read_str(&mut caller, body_ptr, body_len)?;
            call_capability(&mut caller, "send_email", move |caps| async move {
                caps.send_email(&to, &subject, &body).await
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "send_message",
        |mut caller: Caller<'_, UnitState>,
         channel_ptr: u32,
         channel_len: u32,
         text_ptr: u32,
         text_len: u32|
         -> Result<i32> {
            let channel = read_str(&mut caller, channel_ptr, channel_len)?;
            let text = read_str(&mut caller, text_ptr, text_len)?;
            call_capability(&mut caller, "send_message", move |caps| async move {
                caps.send_message(&channel, &text).await
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "analyze_with_model",
        |mut caller: Caller<'_, UnitState>,
         prompt_ptr: u32,
         prompt_len: u32,
         data_ptr: u32,
         data_len: u32|
         -> Result<i32> {
            let prompt = read_str(&mut caller, prompt_ptr, prompt_len)?;
            let data = match read_json(&mut caller, data_ptr, data_len)? {
                Ok(data) => data,
                Err(msg) => return invalid_argument(caller.data_mut(), "analyze_with_model", msg),
            };
            call_capability(&mut caller, "analyze_with_model", move |caps| async move {
                caps.analyze_with_model(&prompt, &data).await
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "append_rows",
        |mut caller: Caller<'_, UnitState>,
         sheet_ptr: u32,
         sheet_len: u32,
         range_ptr: u32,
         range_len: u32,
         values_ptr: u32,
         values_len: u32|
         -> Result<i32> {
            let sheet_id = read_str(&mut caller, sheet_ptr, sheet_len)?;
            let range = read_str(&mut caller, range_ptr, range_len)?;
            let values = match read_json(&mut caller, values_ptr, values_len)? {
                Ok(values) => values,
                Err(msg) => return invalid_argument(caller.data_mut(), "append_rows", msg),
            };
            call_capability(&mut caller, "append_rows", move |caps| async move {
                caps.append_rows(&sheet_id, &range, &values).await
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "create_issue",
        |mut caller: Caller<'_, UnitState>,
         owner_ptr: u32,
         owner_len: u32,
         repo_ptr: u32,
         repo_len: u32,
         title_ptr: u32,
         title_len: u32,
         body_ptr: u32,
         body_len: u32|
         -> Result<i32> {
            let owner = read_str(&mut caller, owner_ptr, owner_len)?;
            let repo = read_str(&mut caller, repo_ptr, repo_len)?;
            let title = read_str(&mut caller, title_ptr, title_len)?;
            let body = read_str(&mut caller, body_ptr, body_len)?;
            call_capability(&mut caller, "create_issue", move |caps| async move {
                caps.create_issue(&owner, &repo, &title, &body).await
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "http_request",
        |mut caller: Caller<'_, UnitState>,
         url_ptr: u32,
         url_len: u32,
         options_ptr: u32,
         options_len: u32|
         -> Result<i32> {
            let url = read_str(&mut caller, url_ptr, url_len)?;
            let options = match read_json(&mut caller, options_ptr, options_len)? {
                Ok(options) => options,
                Err(msg) => return invalid_argument(caller.data_mut(), "http_request", msg),
            };
            call_capability(&mut caller, "http_request", move |caps| async move {
                caps.http_request(&url, &options).await
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "wait",
        |mut caller: Caller<'_, UnitState>, ms: i64| -> Result<i32> {
            if ms < 0 {
                return invalid_argument(
                    caller.data_mut(),
                    "wait",
                    format!("wait duration must not be negative, got {}", ms),
                );
            }
            call_capability(&mut caller, "wait", move |_| async move {
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
                Ok(Value::Null)
            })
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "log",
        |mut caller: Caller<'_, UnitState>,
         message_ptr: u32,
         message_len: u32,
         data_ptr: u32,
         data_len: u32|
         -> Result<i32> {
            let message = read_str(&mut caller, message_ptr, message_len)?;
            let raw = read_bytes(&mut caller, data_ptr, data_len)?;
            let data = if raw.is_empty() {
                None
            } else {
                Some(
                    serde_json::from_slice(&raw)
                        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw).into_owned())),
                )
            };

            let state = caller.data_mut();
            state.capability_calls += 1;
            match &data {
                Some(data) => info!("Agent [{}] log: {} {}", state.agent_id, message, data),
                None => info!("Agent [{}] log: {}", state.agent_id, message),
            }
            if state.logs.len() < MAX_LOG_ENTRIES {
                state.logs.push(AgentLogEntry { message, data });
            }
            Ok(0)
        },
    )?;

    Ok(linker)
}
