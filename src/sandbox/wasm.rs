//! WebAssembly sandbox using Wasmtime
//!
//! Guests are core modules targeting WASI preview1. Besides WASI (env vars,
//! args, clocks, random, stderr) they import three functions from the
//! `wasmgate` host module to exchange the request and response:
//!
//! - `input_len() -> i32`: size of the serialized request
//! - `input_read(ptr: i32)`: copy the request into guest memory at `ptr`
//! - `output_write(ptr: i32, len: i32)`: append bytes to the response
//!
//! Outbound TCP goes through the same module, subject to the capabilities the
//! module was compiled with. All return a negative code on failure:
//!
//! - `net_connect(ptr: i32, len: i32) -> i32`: connect to the `host:port`
//!   string at `ptr`, returning a socket handle
//! - `net_write(sock: i32, ptr: i32, len: i32) -> i32`: send up to `len`
//!   bytes (one transfer is capped at 64 KiB), returning the count sent
//! - `net_read(sock: i32, ptr: i32, len: i32) -> i32`: receive up to `len`
//!   bytes, 0 at end of stream
//! - `net_close(sock: i32) -> i32`
//!
//! The entry point takes no parameters and either returns an `i32` exit code
//! or nothing (exit code 0). `proc_exit(n)` is reported as exit code `n`.
//!
//! Stores yield to the async executor on every epoch tick, so dropping the
//! call future stops even a guest stuck in a loop.

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use wasmtime::{
    Caller, Config, Engine, Extern, ExternType, Instance as WasmInstanceHandle, InstancePre,
    Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder, Val, WasmBacktraceDetails,
};
use wasmtime_wasi::pipe::MemoryOutputPipe;
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

use super::net::{SocketTable, ERR_ADDRESS, MAX_TRANSFER};
use super::{CallOutput, Capabilities, CompiledModule, Instance, InstanceConfig, SandboxRuntime};
use crate::config::SandboxConfig;
use crate::error::{Error, Result};

/// Import module name of the host ABI
pub const HOST_MODULE: &str = "wasmgate";

/// Guest stderr kept per call
const MAX_LOG_BYTES: usize = 64 * 1024;

/// Per-store host state
struct GuestState {
    wasi: WasiP1Ctx,
    limits: StoreLimits,
    input: Vec<u8>,
    output: Vec<u8>,
    max_output_bytes: usize,
    capabilities: Capabilities,
    sockets: SocketTable,
}

/// Wasmtime-backed sandbox runtime
pub struct WasmtimeRuntime {
    engine: Engine,
    linker: Linker<GuestState>,
    max_memory_bytes: usize,
    max_output_bytes: usize,
}

impl WasmtimeRuntime {
    /// Create a runtime and start its epoch ticker
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let mut wasm_config = Config::new();
        wasm_config.async_support(true);
        wasm_config.epoch_interruption(true);
        wasm_config.wasm_backtrace_details(WasmBacktraceDetails::Enable);

        let engine = Engine::new(&wasm_config)?;
        let linker = build_linker(&engine)?;

        // The ticker exits once the last engine handle is gone
        let weak = engine.weak();
        let tick = config.epoch_tick;
        std::thread::Builder::new()
            .name("wasmgate-epoch".to_string())
            .spawn(move || loop {
                std::thread::sleep(tick);
                match weak.upgrade() {
                    Some(engine) => engine.increment_epoch(),
                    None => break,
                }
            })?;

        info!(
            max_memory_bytes = config.max_memory_bytes,
            epoch_tick = ?config.epoch_tick,
            "Wasm runtime initialized"
        );

        Ok(WasmtimeRuntime {
            engine,
            linker,
            max_memory_bytes: config.max_memory_bytes,
            max_output_bytes: config.max_output_bytes,
        })
    }
}

impl SandboxRuntime for WasmtimeRuntime {
    fn compile(&self, bytes: &[u8], capabilities: &Capabilities) -> Result<Arc<dyn CompiledModule>> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| Error::Wasm(format!("Failed to compile module: {:#}", e)))?;

        // Resolving imports here turns a missing host function into a compile error
        let pre = self
            .linker
            .instantiate_pre(&module)
            .map_err(|e| Error::Wasm(format!("Failed to link module: {:#}", e)))?;

        debug!(bytes = bytes.len(), "Compiled module");

        Ok(Arc::new(WasmModule {
            engine: self.engine.clone(),
            pre,
            capabilities: capabilities.clone(),
            max_memory_bytes: self.max_memory_bytes,
            max_output_bytes: self.max_output_bytes,
        }))
    }
}

fn build_linker(engine: &Engine) -> Result<Linker<GuestState>> {
    let mut linker: Linker<GuestState> = Linker::new(engine);
    preview1::add_to_linker_async(&mut linker, |state: &mut GuestState| &mut state.wasi)?;

    linker.func_wrap(
        HOST_MODULE,
        "input_len",
        |caller: Caller<'_, GuestState>| -> i32 { caller.data().input.len() as i32 },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "input_read",
        |mut caller: Caller<'_, GuestState>, ptr: i32| -> anyhow::Result<()> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let start = ptr as u32 as usize;
            let dest = start
                .checked_add(state.input.len())
                .and_then(|end| data.get_mut(start..end))
                .ok_or_else(|| anyhow!("input_read: destination out of bounds"))?;
            dest.copy_from_slice(&state.input);
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "output_write",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let memory = guest_memory(&mut caller)?;
            let (data, state) = memory.data_and_store_mut(&mut caller);
            let start = ptr as u32 as usize;
            let src = start
                .checked_add(len as u32 as usize)
                .and_then(|end| data.get(start..end))
                .ok_or_else(|| anyhow!("output_write: source out of bounds"))?;
            if state.output.len() + src.len() > state.max_output_bytes {
                return Err(anyhow!(
                    "output_write: output exceeds {} bytes",
                    state.max_output_bytes
                ));
            }
            state.output.extend_from_slice(src);
            Ok(())
        },
    )?;

    linker.func_wrap_async(
        HOST_MODULE,
        "net_connect",
        |mut caller: Caller<'_, GuestState>, (ptr, len): (i32, i32)| {
            Box::new(async move { net_connect(&mut caller, ptr, len).await })
        },
    )?;

    linker.func_wrap_async(
        HOST_MODULE,
        "net_write",
        |mut caller: Caller<'_, GuestState>, (sock, ptr, len): (i32, i32, i32)| {
            Box::new(async move { net_write(&mut caller, sock, ptr, len).await })
        },
    )?;

    linker.func_wrap_async(
        HOST_MODULE,
        "net_read",
        |mut caller: Caller<'_, GuestState>, (sock, ptr, len): (i32, i32, i32)| {
            Box::new(async move { net_read(&mut caller, sock, ptr, len).await })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        "net_close",
        |mut caller: Caller<'_, GuestState>, sock: i32| -> i32 {
            match caller.data_mut().sockets.close(sock) {
                Ok(()) => 0,
                Err(code) => code,
            }
        },
    )?;

    Ok(linker)
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> anyhow::Result<Memory> {
    match caller.get_export("memory") {
        Some(Extern::Memory(memory)) => Ok(memory),
        _ => Err(anyhow!("guest does not export a memory named 'memory'")),
    }
}

async fn net_connect(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> anyhow::Result<i32> {
    let memory = guest_memory(caller)?;
    let address = guest_bytes(&memory, caller, ptr, len)
        .ok_or_else(|| anyhow!("net_connect: address out of bounds"))?;
    let Ok(address) = String::from_utf8(address) else {
        return Ok(ERR_ADDRESS);
    };
    let state = caller.data_mut();
    Ok(state.sockets.connect(&state.capabilities, &address).await)
}

async fn net_write(
    caller: &mut Caller<'_, GuestState>,
    sock: i32,
    ptr: i32,
    len: i32,
) -> anyhow::Result<i32> {
    let memory = guest_memory(caller)?;
    let data = guest_bytes(&memory, caller, ptr, len)
        .ok_or_else(|| anyhow!("net_write: source out of bounds"))?;
    Ok(match caller.data_mut().sockets.write(sock, &data).await {
        Ok(()) => data.len() as i32,
        Err(code) => code,
    })
}

async fn net_read(
    caller: &mut Caller<'_, GuestState>,
    sock: i32,
    ptr: i32,
    len: i32,
) -> anyhow::Result<i32> {
    let memory = guest_memory(caller)?;
    let start = ptr as u32 as usize;
    let len = (len as u32 as usize).min(MAX_TRANSFER);
    if start.saturating_add(len) > memory.data_size(&*caller) {
        return Err(anyhow!("net_read: destination out of bounds"));
    }

    let mut buf = vec![0u8; len];
    let read = match caller.data_mut().sockets.read(sock, &mut buf).await {
        Ok(read) => read,
        Err(code) => return Ok(code),
    };
    memory.write(&mut *caller, start, &buf[..read])?;
    Ok(read as i32)
}

/// Copy of `len` guest bytes at `ptr`, capped at one transfer
fn guest_bytes(memory: &Memory, caller: &Caller<'_, GuestState>, ptr: i32, len: i32) -> Option<Vec<u8>> {
    let start = ptr as u32 as usize;
    let len = (len as u32 as usize).min(MAX_TRANSFER);
    let end = start.checked_add(len)?;
    memory.data(caller).get(start..end).map(<[u8]>::to_vec)
}

/// Compiled, pre-linked module plus the capabilities it was bound to
struct WasmModule {
    engine: Engine,
    pre: InstancePre<GuestState>,
    capabilities: Capabilities,
    max_memory_bytes: usize,
    max_output_bytes: usize,
}

impl WasmModule {
    fn wasi_builder(&self, config: &InstanceConfig, stderr: MemoryOutputPipe) -> WasiCtxBuilder {
        let mut builder = WasiCtxBuilder::new();
        builder.stderr(stderr);
        for (key, value) in &config.envs {
            builder.env(key, value);
        }
        for arg in &config.args {
            builder.arg(arg);
        }
        // Sockets only through the host ABI
        builder
            .allow_tcp(false)
            .allow_udp(false)
            .allow_ip_name_lookup(false);
        builder
    }
}

#[async_trait]
impl CompiledModule for WasmModule {
    fn has_entry_point(&self, name: &str) -> bool {
        matches!(self.pre.module().get_export(name), Some(ExternType::Func(_)))
    }

    async fn instantiate(&self, config: &InstanceConfig) -> Result<Box<dyn Instance>> {
        let stderr = MemoryOutputPipe::new(MAX_LOG_BYTES);
        let wasi = self.wasi_builder(config, stderr.clone()).build_p1();

        let state = GuestState {
            wasi,
            limits: StoreLimitsBuilder::new()
                .memory_size(self.max_memory_bytes)
                .build(),
            input: Vec::new(),
            output: Vec::new(),
            max_output_bytes: self.max_output_bytes,
            capabilities: self.capabilities.clone(),
            sockets: SocketTable::default(),
        };

        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        store.epoch_deadline_async_yield_and_update(1);

        let instance = self
            .pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| Error::Wasm(format!("Failed to instantiate module: {:#}", e)))?;

        Ok(Box::new(WasmInstance {
            store,
            instance,
            stderr,
        }))
    }
}

struct WasmInstance {
    store: Store<GuestState>,
    instance: WasmInstanceHandle,
    stderr: MemoryOutputPipe,
}

#[async_trait]
impl Instance for WasmInstance {
    async fn call(&mut self, entry_point: &str, input: &[u8]) -> Result<CallOutput> {
        let func = self
            .instance
            .get_func(&mut self.store, entry_point)
            .ok_or_else(|| Error::Wasm(format!("Function '{}' not found", entry_point)))?;

        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];

        {
            let state = self.store.data_mut();
            state.input = input.to_vec();
            state.output.clear();
        }

        let exit_code = match func.call_async(&mut self.store, &[], &mut results).await {
            Ok(()) => match results.first() {
                None => 0,
                Some(Val::I32(code)) => *code,
                Some(other) => {
                    return Err(Error::Wasm(format!(
                        "Entry point returned a non-i32 value: {:?}",
                        other
                    )))
                }
            },
            Err(e) => match e.downcast_ref::<I32Exit>() {
                Some(exit) => exit.0,
                None => return Err(Error::Wasm(format!("Guest trapped: {:#}", e))),
            },
        };

        let output = std::mem::take(&mut self.store.data_mut().output);
        let logs = String::from_utf8_lossy(&self.stderr.contents()).into_owned();

        Ok(CallOutput {
            exit_code,
            output,
            logs,
        })
    }
}
