// Conversions between `RpcError` and the engine's error type.
//
// Anything that is not an `RpcError` is reduced to UNKNOWN with the generic
// message on its way to the engine. The opposite direction keeps whatever the
// engine reported as long as it is well formed.

use std::any::Any;
use std::error::Error as StdError;

use log::warn;

use crate::engine::NativeError;
use crate::status::{Code, RpcError, GENERIC_MESSAGE};
use crate::utils::BoxError;

/// A handler or input sequence panicked; the payload text stays local.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub struct Panicked(String);

impl Panicked {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => "opaque panic payload".to_owned(),
            },
        };
        Self(message)
    }
}

/// Error for a caught panic. An `RpcError` payload, as raised by
/// `std::panic::panic_any`, is kept; anything else becomes [`Panicked`].
pub fn panic_error(payload: Box<dyn Any + Send>) -> BoxError {
    match payload.downcast::<RpcError>() {
        Ok(rpc) => rpc,
        Err(payload) => Box::new(Panicked::from_payload(payload)),
    }
}

pub fn to_engine_error(error: &(dyn StdError + 'static)) -> NativeError {
    match error.downcast_ref::<RpcError>() {
        Some(rpc) => NativeError::new(rpc.code().as_i32(), rpc.message()),
        None => {
            warn!("hiding non-status failure from peer: {}", error);
            NativeError::new(Code::Unknown.as_i32(), GENERIC_MESSAGE)
        }
    }
}

pub fn to_rpc_error(error: &(dyn StdError + 'static)) -> RpcError {
    if let Some(rpc) = error.downcast_ref::<RpcError>() {
        return rpc.clone();
    }
    let Some(native) = error.downcast_ref::<NativeError>() else {
        return RpcError::unknown();
    };
    let code = Code::from_i32(native.code).unwrap_or(Code::Unknown);
    if native.details.is_empty() {
        RpcError::new(code, GENERIC_MESSAGE)
    } else {
        RpcError::new(code, native.details.clone())
    }
}
