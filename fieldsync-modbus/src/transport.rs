//! Transport backends and the serialized request channel in front of them.
//!
//! A [`BusTransport`] is non-reentrant: it is owned by a single request
//! task spawned by [`TransportHandle::spawn`], which processes commands
//! strictly one at a time from its queue. `send_read`/`send_write`
//! enqueue a command and return a [`PendingReply`] immediately; the
//! caller decides where (and whether) to await the completion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

use fieldsync_common::types::{ModbusErrorCode, RegisterKind};

/// Errors surfaced by transport backends.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Request timed out")]
    Timeout,

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Write failed: {0}")]
    Write(String),

    /// The device answered with a Modbus exception.
    #[error("Request rejected by device: {0}")]
    Rejected(String),

    #[error("Register kind {0} does not support this operation")]
    Unsupported(RegisterKind),

    /// The request task is gone; nothing was sent.
    #[error("Transport channel closed")]
    Closed,
}

impl TransportError {
    /// The last-error code this failure maps to.
    pub fn code(&self) -> ModbusErrorCode {
        match self {
            TransportError::Connect(_)
            | TransportError::NotConnected
            | TransportError::Closed => ModbusErrorCode::Connection,
            TransportError::Timeout => ModbusErrorCode::Timeout,
            TransportError::Read(_) => ModbusErrorCode::Read,
            TransportError::Write(_) => ModbusErrorCode::Write,
            TransportError::Rejected(_) | TransportError::Unsupported(_) => {
                ModbusErrorCode::Protocol
            }
        }
    }
}

/// A Modbus transport backend.
///
/// Implementations are owned by exactly one request task and are never
/// called concurrently. Coil/discrete data crosses this interface as one
/// 0/1 word per bit.
#[async_trait]
pub trait BusTransport: Send {
    /// Establish the connection.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear the connection down.
    async fn disconnect(&mut self);

    /// Read `count` elements of `kind` starting at `address` from `unit`.
    async fn read(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write elements of `kind` starting at `address` on `unit`.
    async fn write(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        words: Vec<u16>,
    ) -> Result<(), TransportError>;
}

// ============================================================================
// Modbus TCP
// ============================================================================

/// Modbus TCP backend over tokio-modbus.
pub struct TcpTransport {
    addr: SocketAddr,
    connect_timeout: Duration,
    ctx: Option<Context>,
}

impl TcpTransport {
    /// Create a backend for `host:port`.
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, TransportError> {
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|e| TransportError::Connect(format!("Invalid address: {}", e)))?;
        Ok(Self {
            addr,
            connect_timeout,
            ctx: None,
        })
    }
}

#[async_trait]
impl BusTransport for TcpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let ctx = tokio::time::timeout(self.connect_timeout, tcp::connect(self.addr))
            .await
            .map_err(|_| TransportError::Connect("Connection timeout".to_string()))?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }

    async fn read(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit));

        match kind {
            RegisterKind::Coils => {
                let bits = ctx
                    .read_coils(address, count)
                    .await
                    .map_err(|e| TransportError::Read(e.to_string()))?
                    .map_err(|e| TransportError::Rejected(format!("{:?}", e)))?;
                Ok(bits.into_iter().map(u16::from).collect())
            }
            RegisterKind::DiscreteInputs => {
                let bits = ctx
                    .read_discrete_inputs(address, count)
                    .await
                    .map_err(|e| TransportError::Read(e.to_string()))?
                    .map_err(|e| TransportError::Rejected(format!("{:?}", e)))?;
                Ok(bits.into_iter().map(u16::from).collect())
            }
            RegisterKind::InputRegisters => ctx
                .read_input_registers(address, count)
                .await
                .map_err(|e| TransportError::Read(e.to_string()))?
                .map_err(|e| TransportError::Rejected(format!("{:?}", e))),
            RegisterKind::HoldingRegisters => ctx
                .read_holding_registers(address, count)
                .await
                .map_err(|e| TransportError::Read(e.to_string()))?
                .map_err(|e| TransportError::Rejected(format!("{:?}", e))),
            RegisterKind::Invalid => Err(TransportError::Unsupported(kind)),
        }
    }

    async fn write(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        words: Vec<u16>,
    ) -> Result<(), TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit));

        match kind {
            RegisterKind::Coils => {
                let bits: Vec<bool> = words.iter().map(|w| *w != 0).collect();
                ctx.write_multiple_coils(address, &bits)
                    .await
                    .map_err(|e| TransportError::Write(e.to_string()))?
                    .map_err(|e| TransportError::Rejected(format!("{:?}", e)))
            }
            RegisterKind::HoldingRegisters => ctx
                .write_multiple_registers(address, &words)
                .await
                .map_err(|e| TransportError::Write(e.to_string()))?
                .map_err(|e| TransportError::Rejected(format!("{:?}", e))),
            RegisterKind::DiscreteInputs | RegisterKind::InputRegisters | RegisterKind::Invalid => {
                Err(TransportError::Unsupported(kind))
            }
        }
    }
}

// ============================================================================
// Modbus RTU (serial)
// ============================================================================

/// Modbus RTU backend over tokio-serial.
pub struct RtuTransport {
    builder: tokio_serial::SerialPortBuilder,
    ctx: Option<Context>,
}

impl RtuTransport {
    /// Create a backend for a serial port.
    ///
    /// `parity` accepts "none", "even", or "odd"; unknown strings fall
    /// back to none. Stop bits other than 2 mean 1; data bits outside
    /// 5-7 mean 8.
    pub fn new(port: &str, baud_rate: u32, data_bits: u8, parity: &str, stop_bits: u8) -> Self {
        let parity = match parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };
        let stop_bits = match stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };
        let data_bits = match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(port, baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);

        Self { builder, ctx: None }
    }
}

#[async_trait]
impl BusTransport for RtuTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let serial = tokio_serial::SerialStream::open(&self.builder)
            .map_err(|e| TransportError::Connect(format!("Serial open failed: {}", e)))?;
        self.ctx = Some(rtu::attach_slave(serial, Slave(1)));
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
    }

    async fn read(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit));

        match kind {
            RegisterKind::Coils => {
                let bits = ctx
                    .read_coils(address, count)
                    .await
                    .map_err(|e| TransportError::Read(e.to_string()))?
                    .map_err(|e| TransportError::Rejected(format!("{:?}", e)))?;
                Ok(bits.into_iter().map(u16::from).collect())
            }
            RegisterKind::DiscreteInputs => {
                let bits = ctx
                    .read_discrete_inputs(address, count)
                    .await
                    .map_err(|e| TransportError::Read(e.to_string()))?
                    .map_err(|e| TransportError::Rejected(format!("{:?}", e)))?;
                Ok(bits.into_iter().map(u16::from).collect())
            }
            RegisterKind::InputRegisters => ctx
                .read_input_registers(address, count)
                .await
                .map_err(|e| TransportError::Read(e.to_string()))?
                .map_err(|e| TransportError::Rejected(format!("{:?}", e))),
            RegisterKind::HoldingRegisters => ctx
                .read_holding_registers(address, count)
                .await
                .map_err(|e| TransportError::Read(e.to_string()))?
                .map_err(|e| TransportError::Rejected(format!("{:?}", e))),
            RegisterKind::Invalid => Err(TransportError::Unsupported(kind)),
        }
    }

    async fn write(
        &mut self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        words: Vec<u16>,
    ) -> Result<(), TransportError> {
        let ctx = self.ctx.as_mut().ok_or(TransportError::NotConnected)?;
        ctx.set_slave(Slave(unit));

        match kind {
            RegisterKind::Coils => {
                let bits: Vec<bool> = words.iter().map(|w| *w != 0).collect();
                ctx.write_multiple_coils(address, &bits)
                    .await
                    .map_err(|e| TransportError::Write(e.to_string()))?
                    .map_err(|e| TransportError::Rejected(format!("{:?}", e)))
            }
            RegisterKind::HoldingRegisters => ctx
                .write_multiple_registers(address, &words)
                .await
                .map_err(|e| TransportError::Write(e.to_string()))?
                .map_err(|e| TransportError::Rejected(format!("{:?}", e))),
            RegisterKind::DiscreteInputs | RegisterKind::InputRegisters | RegisterKind::Invalid => {
                Err(TransportError::Unsupported(kind))
            }
        }
    }
}

// ============================================================================
// Simulated transport
// ============================================================================

/// Shared in-memory register bank backing [`SimTransport`].
///
/// Tests and hardware-free runs seed and inspect device data here while
/// pollers read it through the normal transport path.
#[derive(Debug, Clone, Default)]
pub struct SimBank {
    inner: Arc<RwLock<HashMap<(RegisterKind, u16), u16>>>,
}

impl SimBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one element. Coil/discrete elements are 0/1 words.
    pub fn set(&self, kind: RegisterKind, address: u16, word: u16) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((kind, address), word);
    }

    /// Load consecutive elements starting at `start`.
    pub fn load(&self, kind: RegisterKind, start: u16, words: &[u16]) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (i, word) in words.iter().enumerate() {
            inner.insert((kind, start.wrapping_add(i as u16)), *word);
        }
    }

    /// Read one element; unset addresses read 0.
    pub fn get(&self, kind: RegisterKind, address: u16) -> u16 {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(kind, address))
            .copied()
            .unwrap_or(0)
    }

    fn read_range(&self, kind: RegisterKind, start: u16, count: u16) -> Vec<u16> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        (0..count)
            .map(|i| {
                inner
                    .get(&(kind, start.wrapping_add(i)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }
}

/// Request counters exposed by [`SimTransport`] for assertions.
#[derive(Debug, Clone, Default)]
pub struct SimProbe {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

impl SimProbe {
    /// Highest number of reads ever in flight simultaneously.
    pub fn max_in_flight(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Total completed read requests.
    pub fn total_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

/// In-memory transport with injectable latency and failures.
pub struct SimTransport {
    bank: SimBank,
    probe: SimProbe,
    latency: Duration,
    fail_reads: Arc<AtomicBool>,
    connected: bool,
}

impl SimTransport {
    pub fn new(bank: SimBank) -> Self {
        Self {
            bank,
            probe: SimProbe::default(),
            latency: Duration::ZERO,
            fail_reads: Arc::new(AtomicBool::new(false)),
            connected: false,
        }
    }

    /// Delay every read by `latency` (a slow device).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Counters for in-flight and completed requests.
    pub fn probe(&self) -> SimProbe {
        self.probe.clone()
    }

    /// Switch that makes every read fail while set.
    pub fn fail_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fail_reads)
    }
}

#[async_trait]
impl BusTransport for SimTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    async fn read(
        &mut self,
        _unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if kind == RegisterKind::Invalid {
            return Err(TransportError::Unsupported(kind));
        }

        let current = self.probe.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max.fetch_max(current, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let result = if self.fail_reads.load(Ordering::SeqCst) {
            Err(TransportError::Read("simulated read failure".to_string()))
        } else {
            Ok(self.bank.read_range(kind, address, count))
        };

        self.probe.current.fetch_sub(1, Ordering::SeqCst);
        self.probe.reads.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn write(
        &mut self,
        _unit: u8,
        kind: RegisterKind,
        address: u16,
        words: Vec<u16>,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if !kind.is_writable() {
            return Err(TransportError::Unsupported(kind));
        }
        self.bank.load(kind, address, &words);
        Ok(())
    }
}

// ============================================================================
// Serialized request channel
// ============================================================================

enum BusRequest {
    Connect {
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Read {
        unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
        reply: oneshot::Sender<Result<Vec<u16>, TransportError>>,
    },
    Write {
        unit: u8,
        kind: RegisterKind,
        address: u16,
        words: Vec<u16>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
}

/// A pending transport completion.
pub struct PendingReply<T> {
    rx: oneshot::Receiver<Result<T, TransportError>>,
}

impl<T> PendingReply<T> {
    /// Await the completion. Resolves with [`TransportError::Closed`] if
    /// the request task is gone (the immediate-failure arm).
    pub async fn wait(self) -> Result<T, TransportError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        }
    }
}

/// Handle to the request task owning a [`BusTransport`].
///
/// Requests are processed strictly one at a time, in submission order.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<BusRequest>,
}

impl TransportHandle {
    /// Spawn the request task around a transport backend.
    pub fn spawn(mut transport: Box<dyn BusTransport>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BusRequest>();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    BusRequest::Connect { reply } => {
                        let _ = reply.send(transport.connect().await);
                    }
                    BusRequest::Disconnect { reply } => {
                        transport.disconnect().await;
                        let _ = reply.send(Ok(()));
                    }
                    BusRequest::Read {
                        unit,
                        kind,
                        address,
                        count,
                        reply,
                    } => {
                        let _ = reply.send(transport.read(unit, kind, address, count).await);
                    }
                    BusRequest::Write {
                        unit,
                        kind,
                        address,
                        words,
                        reply,
                    } => {
                        let _ = reply.send(transport.write(unit, kind, address, words).await);
                    }
                }
            }
            debug!("Transport request task exited");
        });

        Self { tx }
    }

    pub fn send_connect(&self) -> PendingReply<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::Connect { reply });
        PendingReply { rx }
    }

    pub fn send_disconnect(&self) -> PendingReply<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::Disconnect { reply });
        PendingReply { rx }
    }

    pub fn send_read(
        &self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> PendingReply<Vec<u16>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::Read {
            unit,
            kind,
            address,
            count,
            reply,
        });
        PendingReply { rx }
    }

    pub fn send_write(
        &self,
        unit: u8,
        kind: RegisterKind,
        address: u16,
        words: Vec<u16>,
    ) -> PendingReply<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(BusRequest::Write {
            unit,
            kind,
            address,
            words,
            reply,
        });
        PendingReply { rx }
    }
}
