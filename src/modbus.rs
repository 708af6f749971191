//! Modbus TCP transport for the inverter gateway
//!
//! Wraps a single `tokio-modbus` TCP context with the timing rules the
//! inverter gateway requires: a minimum gap between any two commands, a
//! longer gap after writes, and settle delays around reconnects. Errors
//! are classified transient/permanent and only transient ones are
//! retried with backoff.

use crate::error::{NeovoltError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_modbus::Slave;
use tokio_modbus::client::{Context, Reader, Writer, tcp};

/// Minimum gap between any two Modbus commands
const COMMAND_INTERVAL: Duration = Duration::from_millis(350);
/// Extra gap required after a write before the next command
const WRITE_STABILIZATION: Duration = Duration::from_millis(100);
/// Settle delay after a dispatch-frame write
const DISPATCH_SETTLE: Duration = Duration::from_millis(50);
/// Per-request response deadline
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Retry ceiling for transient failures
const MAX_RETRIES: u32 = 3;
/// First retry backoff, doubled per attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
/// Backoff cap
const MAX_BACKOFF: Duration = Duration::from_secs(5);
/// Release delay before redialing a gateway that just dropped us
const CONNECT_RELEASE_DELAY: Duration = Duration::from_millis(200);
/// Stabilize delay after a fresh connection
const CONNECT_STABILIZE_DELAY: Duration = Duration::from_millis(100);
/// Battery SOC register probed by `test_connection`
const SOC_PROBE_ADDRESS: u16 = 0x0102;
/// Repeated identical failures log at error level every Nth occurrence
const ERROR_LOG_EVERY: u32 = 10;

/// Transport seam the coordinator and controller depend on. Tests inject
/// a mock implementation.
#[async_trait]
pub trait ModbusLike: Send + Sync {
    async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>>;
    async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<()>;
    async fn test_connection(&self) -> Result<bool>;
    async fn force_reconnect(&self) -> Result<()>;
    async fn close(&self);
}

struct TransportState {
    ctx: Option<Context>,
    last_command: Option<Instant>,
    last_write: Option<Instant>,
    last_error: Option<String>,
    repeat_count: u32,
}

/// Modbus TCP client for one inverter
pub struct ModbusTransport {
    host: String,
    port: u16,
    unit_id: u8,
    state: Mutex<TransportState>,
    closing: AtomicBool,
    logger: StructuredLogger,
}

impl ModbusTransport {
    pub fn new(name: &str, host: &str, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.to_string(),
            port,
            unit_id,
            state: Mutex::new(TransportState {
                ctx: None,
                last_command: None,
                last_write: None,
                last_error: None,
                repeat_count: 0,
            }),
            closing: AtomicBool::new(false),
            logger: get_logger_with_context(LogContext::new("modbus").with_inverter(name)),
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn dial(&self) -> Result<Context> {
        let addr = format!("{}:{}", self.host, self.port);
        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| NeovoltError::transient(format!("Cannot resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| NeovoltError::config(format!("No address for {}", addr)))?;

        match timeout(
            RESPONSE_TIMEOUT,
            tcp::connect_slave(socket_addr, Slave(self.unit_id)),
        )
        .await
        {
            Err(_) => Err(NeovoltError::timeout(format!(
                "Connect to {} timed out",
                addr
            ))),
            Ok(Err(e)) => Err(NeovoltError::from_io_class(&e)),
            Ok(Ok(ctx)) => Ok(ctx),
        }
    }

    /// Ensure `state.ctx` holds a live context, dialing if needed. A prior
    /// context is dropped first with a release delay; the dial itself is
    /// retried once for transient failures.
    async fn ensure_connected(&self, state: &mut TransportState) -> Result<()> {
        if state.ctx.is_some() {
            return Ok(());
        }
        sleep(CONNECT_RELEASE_DELAY).await;

        let ctx = match self.dial().await {
            Ok(ctx) => ctx,
            Err(e) if e.is_transient() && !self.is_closing() => {
                sleep(CONNECT_RELEASE_DELAY).await;
                self.dial().await?
            }
            Err(e) => return Err(e),
        };
        sleep(CONNECT_STABILIZE_DELAY).await;
        state.ctx = Some(ctx);
        self.logger
            .info(&format!("Connected to {}:{}", self.host, self.port));
        Ok(())
    }

    /// Wait out the inter-command spacing. Called with the state lock
    /// held so commands from concurrent tasks are serialized.
    async fn apply_spacing(&self, state: &mut TransportState) {
        let now = Instant::now();
        let mut wait = Duration::ZERO;
        if let Some(last) = state.last_command {
            let since = now.duration_since(last);
            if since < COMMAND_INTERVAL {
                wait = COMMAND_INTERVAL - since;
            }
        }
        if let Some(last_write) = state.last_write {
            let budget = COMMAND_INTERVAL + WRITE_STABILIZATION;
            let since = now.duration_since(last_write);
            if since < budget {
                wait = wait.max(budget - since);
            }
        }
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    /// Rate-limited failure logging; every failure is still surfaced to
    /// the caller.
    fn log_failure(&self, state: &mut TransportState, operation: &str, err: &NeovoltError) {
        let message = err.to_string();
        if state.last_error.as_deref() == Some(&message) {
            state.repeat_count = state.repeat_count.saturating_add(1);
            if state.repeat_count % ERROR_LOG_EVERY == 0 {
                self.logger.error(&format!(
                    "{} still failing after {} occurrences: {}",
                    operation, state.repeat_count, message
                ));
            }
        } else {
            state.last_error = Some(message.clone());
            state.repeat_count = 1;
            self.logger.warn(&format!("{} failed: {}", operation, message));
        }
    }

    fn clear_error_state(&self, state: &mut TransportState) {
        state.last_error = None;
        state.repeat_count = 0;
    }

    async fn read_once(&self, state: &mut TransportState, address: u16, count: u16) -> Result<Vec<u16>> {
        self.ensure_connected(state).await?;
        self.apply_spacing(state).await;
        let ctx = state
            .ctx
            .as_mut()
            .ok_or_else(|| NeovoltError::transient("Not connected"))?;

        let result = timeout(RESPONSE_TIMEOUT, ctx.read_holding_registers(address, count)).await;
        state.last_command = Some(Instant::now());

        match result {
            Err(_) => Err(NeovoltError::timeout(format!(
                "Read 0x{:04X} timed out",
                address
            ))),
            Ok(Err(tokio_modbus::Error::Transport(e))) => Err(NeovoltError::from_io_class(&e)),
            Ok(Err(e)) => Err(NeovoltError::permanent(format!(
                "Protocol error reading 0x{:04X}: {}",
                address, e
            ))),
            Ok(Ok(Err(code))) => Err(NeovoltError::permanent(format!(
                "Modbus exception reading 0x{:04X}: {}",
                address, code
            ))),
            Ok(Ok(Ok(words))) => Ok(words),
        }
    }

    async fn write_once(&self, state: &mut TransportState, address: u16, values: &[u16]) -> Result<()> {
        self.ensure_connected(state).await?;
        self.apply_spacing(state).await;
        let ctx = state
            .ctx
            .as_mut()
            .ok_or_else(|| NeovoltError::transient("Not connected"))?;

        let result = timeout(
            RESPONSE_TIMEOUT,
            ctx.write_multiple_registers(address, values),
        )
        .await;
        let now = Instant::now();
        state.last_command = Some(now);
        state.last_write = Some(now);

        match result {
            Err(_) => Err(NeovoltError::timeout(format!(
                "Write 0x{:04X} timed out",
                address
            ))),
            Ok(Err(tokio_modbus::Error::Transport(e))) => Err(NeovoltError::from_io_class(&e)),
            Ok(Err(e)) => Err(NeovoltError::permanent(format!(
                "Protocol error writing 0x{:04X}: {}",
                address, e
            ))),
            Ok(Ok(Err(code))) => Err(NeovoltError::permanent(format!(
                "Modbus exception writing 0x{:04X}: {}",
                address, code
            ))),
            Ok(Ok(Ok(()))) => {
                if address == crate::dispatch::DISPATCH_ADDRESS {
                    // The dispatch frame needs a moment before the gateway
                    // accepts the next command
                    sleep(DISPATCH_SETTLE).await;
                }
                Ok(())
            }
        }
    }

    /// Drop the context after a transient failure so the next attempt
    /// redials.
    fn invalidate(&self, state: &mut TransportState) {
        state.ctx = None;
    }

    fn backoff_for(attempt: u32) -> Duration {
        let backoff = INITIAL_BACKOFF * 2u32.saturating_pow(attempt);
        backoff.min(MAX_BACKOFF)
    }
}

#[async_trait]
impl ModbusLike for ModbusTransport {
    async fn read_holding_registers(&self, address: u16, count: u16) -> Result<Vec<u16>> {
        let mut state = self.state.lock().await;
        let mut last_err = NeovoltError::transient("No attempt made");
        for attempt in 0..MAX_RETRIES {
            if self.is_closing() {
                return Err(NeovoltError::transient("Transport is closing"));
            }
            match self.read_once(&mut state, address, count).await {
                Ok(words) => {
                    self.clear_error_state(&mut state);
                    return Ok(words);
                }
                Err(e) => {
                    self.log_failure(&mut state, "Read", &e);
                    if !e.is_transient() {
                        return Err(e);
                    }
                    self.invalidate(&mut state);
                    last_err = e;
                    if attempt + 1 < MAX_RETRIES {
                        sleep(Self::backoff_for(attempt)).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn write_multiple_registers(&self, address: u16, values: &[u16]) -> Result<()> {
        if values.is_empty() {
            return Err(NeovoltError::validation("values", "empty write frame"));
        }
        let mut state = self.state.lock().await;
        let mut last_err = NeovoltError::transient("No attempt made");
        for attempt in 0..MAX_RETRIES {
            if self.is_closing() {
                return Err(NeovoltError::transient("Transport is closing"));
            }
            match self.write_once(&mut state, address, values).await {
                Ok(()) => {
                    self.clear_error_state(&mut state);
                    return Ok(());
                }
                Err(e) => {
                    self.log_failure(&mut state, "Write", &e);
                    if !e.is_transient() {
                        return Err(e);
                    }
                    self.invalidate(&mut state);
                    last_err = e;
                    if attempt + 1 < MAX_RETRIES {
                        sleep(Self::backoff_for(attempt)).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn test_connection(&self) -> Result<bool> {
        match self.read_holding_registers(SOC_PROBE_ADDRESS, 1).await {
            Ok(words) => Ok(!words.is_empty()),
            Err(e) if e.is_transient() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn force_reconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ctx = None;
        self.clear_error_state(&mut state);
        self.logger.info("Forcing reconnect");
        self.ensure_connected(&mut state).await
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if state.ctx.take().is_some() {
            self.logger.info("Transport closed");
        }
    }
}
