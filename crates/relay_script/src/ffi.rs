//! FFI layer between the host gateway and the bridge
//!
//! Two kinds of handle cross boundaries here:
//!
//! - [`ScriptHandle`]: an opaque id for a value the host keeps alive inside
//!   the script heap (dispatcher types, instances, hooks).
//! - [`CoProcessMessage`]: the C view of a [`MessageBuffer`] for gateways that
//!   drive the bridge through the C ABI.
//!
//! Ownership across the C ABI: the host owns the message it passes to
//! [`relay_dispatch`] and keeps it; the returned message is allocated here and
//! must go back through [`relay_message_free`].

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::message::MessageBuffer;
use std::ffi::{c_char, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;

/// Opaque handle for script access
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(pub u64);

impl ScriptHandle {
    pub(crate) fn key(self) -> String {
        self.0.to_string()
    }
}

/// Wire shape of a message. `p_data == NULL` is the absent state.
#[repr(C)]
#[derive(Debug)]
pub struct CoProcessMessage {
    pub p_data: *mut u8,
    pub length: i32,
}

impl CoProcessMessage {
    /// Hand a buffer's bytes over to a heap-allocated C message.
    pub fn from_buffer(buffer: MessageBuffer) -> Box<Self> {
        let length = buffer.length();
        let p_data = match buffer.into_data() {
            Some(bytes) => Box::into_raw(bytes.into_boxed_slice()) as *mut u8,
            None => ptr::null_mut(),
        };
        Box::new(Self { p_data, length })
    }

    /// Copy the message into an owned buffer. `None` when `length` is negative
    /// or the absent state carries a length.
    ///
    /// # Safety
    /// When `p_data` is non-null it must point to `length` readable bytes.
    pub unsafe fn to_buffer(&self) -> Option<MessageBuffer> {
        if self.p_data.is_null() {
            return (self.length == 0).then(MessageBuffer::empty);
        }
        let length = usize::try_from(self.length).ok()?;
        let bytes = std::slice::from_raw_parts(self.p_data, length);
        MessageBuffer::new(bytes.to_vec()).ok()
    }
}

fn empty_message() -> *mut CoProcessMessage {
    Box::into_raw(CoProcessMessage::from_buffer(MessageBuffer::empty()))
}

/// Start a bridge from a JSON config (`NULL` for defaults). Returns `NULL` on
/// any startup failure; the cause is logged.
///
/// # Safety
/// `config_json` must be `NULL` or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn relay_bridge_init(config_json: *const c_char) -> *mut Bridge {
    let config = if config_json.is_null() {
        Ok(BridgeConfig::default())
    } else {
        match CStr::from_ptr(config_json).to_str() {
            Ok(json) => BridgeConfig::from_json_str(json),
            Err(err) => {
                tracing::error!(target: "coprocess", error = %err, "Config is not UTF-8");
                return ptr::null_mut();
            }
        }
    };

    let started = catch_unwind(AssertUnwindSafe(|| {
        config.map_err(BridgeError::from).and_then(Bridge::init)
    }));
    match started {
        Ok(Ok(bridge)) => Box::into_raw(Box::new(bridge)),
        Ok(Err(err)) => {
            tracing::error!(target: "coprocess", error = %err, "Bridge init failed");
            ptr::null_mut()
        }
        Err(_) => {
            tracing::error!(target: "coprocess", "Bridge init panicked");
            ptr::null_mut()
        }
    }
}

/// Dispatch one message. Always returns a message the caller must free with
/// [`relay_message_free`]; failures come back as the absent message.
///
/// # Safety
/// `bridge` must be `NULL` or come from [`relay_bridge_init`] and not yet be
/// freed. `message` must be `NULL` or point to a valid [`CoProcessMessage`]
/// whose `p_data` holds `length` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn relay_dispatch(
    bridge: *const Bridge,
    message: *const CoProcessMessage,
) -> *mut CoProcessMessage {
    let (Some(bridge), Some(message)) = (bridge.as_ref(), message.as_ref()) else {
        return empty_message();
    };
    let Some(input) = message.to_buffer() else {
        tracing::warn!(target: "coprocess", length = message.length, "Rejected inconsistent message");
        return empty_message();
    };

    match catch_unwind(AssertUnwindSafe(|| bridge.dispatch(input))) {
        Ok(output) => Box::into_raw(CoProcessMessage::from_buffer(output)),
        Err(_) => {
            tracing::error!(target: "coprocess", "Dispatch panicked");
            empty_message()
        }
    }
}

/// Release a message returned by [`relay_dispatch`].
///
/// # Safety
/// `message` must be `NULL` or a pointer returned by [`relay_dispatch`] that
/// has not been freed yet.
#[no_mangle]
pub unsafe extern "C" fn relay_message_free(message: *mut CoProcessMessage) {
    if message.is_null() {
        return;
    }
    let message = Box::from_raw(message);
    if !message.p_data.is_null() {
        let length = message.length as usize;
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            message.p_data,
            length,
        )));
    }
}

/// Shut a bridge down.
///
/// # Safety
/// `bridge` must be `NULL` or come from [`relay_bridge_init`], and no other
/// thread may be using it.
#[no_mangle]
pub unsafe extern "C" fn relay_bridge_free(bridge: *mut Bridge) {
    if !bridge.is_null() {
        drop(Box::from_raw(bridge));
    }
}
