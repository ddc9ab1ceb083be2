//! Typed values decoded from a sub-range of a block's raw data.
//!
//! A value never stores its decoded result authoritatively: it is
//! re-derived on demand from the block's current raw data plus the
//! value's offset and type. A value whose window falls outside the raw
//! data reads as unreadable — an observable state, not a failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::debug;

use fieldsync_common::codec::{self, CodecError, ScalarValue, ValueType};
use fieldsync_common::types::ModbusErrorCode;
use fieldsync_store::{Change, EngineEvent};

use crate::block::BlockCore;

pub(crate) struct ValueCore {
    pub name: String,
    pub client_name: String,
    pub block_name: String,
    pub block: Weak<BlockCore>,
    pub events: tokio::sync::broadcast::Sender<EngineEvent>,
    pub ty: RwLock<ValueType>,
    /// Element offset into the block's raw data; negative = unset.
    pub offset: RwLock<i32>,
    pub last_error: RwLock<ModbusErrorCode>,
    pub alive: AtomicBool,
}

impl ValueCore {
    pub(crate) fn new(
        name: String,
        block: &Arc<BlockCore>,
        ty: ValueType,
        offset: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            client_name: block.client_name.clone(),
            block_name: block.name.clone(),
            block: Arc::downgrade(block),
            events: block.events.clone(),
            ty: RwLock::new(ty),
            offset: RwLock::new(offset),
            last_error: RwLock::new(ModbusErrorCode::None),
            alive: AtomicBool::new(true),
        })
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn publish(&self, change: Change) {
        let _ = self.events.send(EngineEvent::value(
            &self.client_name,
            &self.block_name,
            &self.name,
            change,
        ));
    }

    pub async fn set_last_error(&self, code: ModbusErrorCode) {
        let changed = {
            let mut guard = self.last_error.write().await;
            if *guard != code {
                *guard = code;
                true
            } else {
                false
            }
        };
        if changed {
            self.publish(Change::Error(code));
        }
    }

    /// Re-decode against fresh raw data and publish the outcome.
    pub(crate) async fn refresh(&self, words: &[u16]) {
        if !self.alive() {
            return;
        }
        let ty = *self.ty.read().await;
        let offset = *self.offset.read().await;
        match codec::decode(words, offset, ty) {
            Ok(value) => {
                self.set_last_error(ModbusErrorCode::None).await;
                self.publish(Change::Scalar(value));
            }
            Err(_) => {
                self.set_last_error(ModbusErrorCode::Unreadable).await;
            }
        }
    }
}

/// Handle to a typed value under a data block.
#[derive(Clone)]
pub struct BlockValue {
    pub(crate) core: Arc<ValueCore>,
}

impl std::fmt::Debug for BlockValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockValue")
            .field("name", &self.core.name)
            .finish_non_exhaustive()
    }
}

impl BlockValue {
    /// Value name, unique within the owning block.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub async fn value_type(&self) -> ValueType {
        *self.core.ty.read().await
    }

    pub async fn offset(&self) -> i32 {
        *self.core.offset.read().await
    }

    pub async fn last_error(&self) -> ModbusErrorCode {
        *self.core.last_error.read().await
    }

    /// Registers (elements) this value occupies, derived from its type.
    pub async fn registers_used(&self) -> u16 {
        self.core.ty.read().await.footprint()
    }

    /// Decode the current value from the block's raw data snapshot.
    pub async fn value(&self) -> Result<ScalarValue, CodecError> {
        let block = self.core.block.upgrade().ok_or(CodecError::Unreadable {
            offset: -1,
            footprint: 0,
            len: 0,
        })?;
        let snapshot = block.data.read().await.clone();
        let ty = *self.core.ty.read().await;
        let offset = *self.core.offset.read().await;
        codec::decode(&snapshot, offset, ty)
    }

    /// Change the scalar type; the value re-decodes immediately.
    pub fn set_type(&self, ty: ValueType) {
        let core = Arc::clone(&self.core);
        self.marshal(async move {
            if !core.alive() {
                return;
            }
            let changed = {
                let mut guard = core.ty.write().await;
                if *guard != ty {
                    *guard = ty;
                    true
                } else {
                    false
                }
            };
            if changed {
                core.publish(Change::Type(ty));
                redecode(&core).await;
            }
        });
    }

    /// Change the element offset; the value re-decodes immediately.
    pub fn set_offset(&self, offset: i32) {
        let core = Arc::clone(&self.core);
        self.marshal(async move {
            if !core.alive() {
                return;
            }
            let changed = {
                let mut guard = core.offset.write().await;
                if *guard != offset {
                    *guard = offset;
                    true
                } else {
                    false
                }
            };
            if changed {
                core.publish(Change::Offset(offset));
                redecode(&core).await;
            }
        });
    }

    /// Encode and write this value to the device.
    ///
    /// Gated on a writable block kind, a configured block address, and a
    /// non-negative offset; a rejected write records
    /// [`ModbusErrorCode::Write`] without touching the bus.
    pub fn write(&self, value: ScalarValue) {
        let core = Arc::clone(&self.core);
        self.marshal(async move {
            if !core.alive() {
                return;
            }
            let Some(block) = core.block.upgrade() else { return };
            let Some(client) = block.client.upgrade() else { return };

            let ty = *core.ty.read().await;
            let words = match codec::encode(&value, ty) {
                Ok(words) => words,
                Err(e) => {
                    debug!(
                        client = %core.client_name,
                        block = %core.block_name,
                        value = %core.name,
                        error = %e,
                        "Write rejected by codec"
                    );
                    core.set_last_error(ModbusErrorCode::Write).await;
                    return;
                }
            };

            let (kind, base) = {
                let config = block.config.read().await;
                (config.kind, config.address)
            };
            let offset = *core.offset.read().await;
            if !kind.is_writable() || base < 0 || offset < 0 {
                core.set_last_error(ModbusErrorCode::Write).await;
                return;
            }
            let Ok(address) = u16::try_from(i64::from(base) + i64::from(offset)) else {
                core.set_last_error(ModbusErrorCode::Write).await;
                return;
            };

            let unit = client.unit();
            let outcome = client
                .transport
                .send_write(unit, kind, address, words)
                .wait()
                .await;
            match outcome {
                Ok(()) => core.set_last_error(ModbusErrorCode::None).await,
                Err(e) => {
                    debug!(
                        client = %core.client_name,
                        block = %core.block_name,
                        value = %core.name,
                        error = %e,
                        "Value write failed"
                    );
                    core.set_last_error(e.code()).await;
                }
            }
        });
    }

    /// Re-decode against fresh raw data and publish the outcome.
    pub(crate) async fn refresh(&self, words: &[u16]) {
        self.core.refresh(words).await;
    }

    pub(crate) fn mark_removed(&self) {
        self.core.alive.store(false, Ordering::Release);
        self.core.publish(Change::Removed);
    }

    /// Submit a job onto the owning client's executor.
    fn marshal<F>(&self, job: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let Some(block) = self.core.block.upgrade() else { return };
        let Some(client) = block.client.upgrade() else { return };
        client.executor.submit(job);
    }
}

async fn redecode(core: &Arc<ValueCore>) {
    let Some(block) = core.block.upgrade() else { return };
    let snapshot = block.data.read().await.clone();
    core.refresh(&snapshot).await;
}
