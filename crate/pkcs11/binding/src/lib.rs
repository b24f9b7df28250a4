//! Copyright 2024 Cosmian Tech SAS
//!
//! PKCS#11 provider binding.
//!
//! A [`Module`] loads a provider shared library and drives its global
//! lifecycle (`C_Initialize`, `C_GetInfo`, `C_Finalize`) and slot enumeration.
//! Slots open [`Session`]s, and a [`Cipher`] or [`Decipher`] runs one streaming
//! operation (`init → update* → finalize`) in a session with a key resident in
//! the token.
//!
//! All calls are synchronous and block the calling thread for as long as the
//! provider takes; none of them can be cancelled. Async callers should run them
//! on a blocking thread pool.

#![allow(non_snake_case)]

pub use cipher::{Cipher, CipherState, Decipher};
pub use error::{BResult, BindingError, CallStatus, rv_name};
pub use mechanism::{Algorithm, Mechanism, OaepHash};
pub use module::{Module, ModuleInfo, Version};
pub use native::{Attribute, AttributeValue, InitArgs, Pkcs11Api, Pkcs11Library};
pub use pkcs11_sys;
pub use session::{AesKeySize, KeyHandle, Session};
pub use slots::{Slot, SlotCollection, SlotInfo};

mod cipher;
mod error;
mod mechanism;
mod module;
mod native;
mod session;
mod slots;

#[cfg(test)]
mod tests;
