use std::{fmt, sync::Arc};

use pkcs11_sys::{
    CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_ULONG, CKA_CLASS, CKA_DECRYPT,
    CKA_ENCRYPT, CKA_EXTRACTABLE, CKA_KEY_TYPE, CKA_LABEL, CKA_PRIVATE, CKA_SENSITIVE, CKA_TOKEN,
    CKA_VALUE_LEN, CKK_AES, CKM_AES_KEY_GEN, CKO_SECRET_KEY, CKR_USER_ALREADY_LOGGED_IN, CKU_USER,
};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{Attribute, BResult, BindingError, Pkcs11Api, error::check_rv};

/// Handle of a key object resident in the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub CK_OBJECT_HANDLE);

impl KeyHandle {
    #[must_use]
    pub const fn handle(self) -> CK_OBJECT_HANDLE {
        self.0
    }
}

impl From<CK_OBJECT_HANDLE> for KeyHandle {
    fn from(handle: CK_OBJECT_HANDLE) -> Self {
        Self(handle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AesKeySize {
    Aes128,
    Aes192,
    Aes256,
}

impl AesKeySize {
    #[must_use]
    pub const fn key_length(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes192 => 24,
            Self::Aes256 => 32,
        }
    }
}

/// A session opened on a token.
///
/// Ciphers borrow the session for the duration of one operation. Operations on a
/// single session must be issued by one owner at a time: the provider does not
/// support concurrent operations on a session.
/// The session is logged out (if needed) and closed when dropped.
pub struct Session {
    api: Arc<dyn Pkcs11Api>,
    slot_id: CK_SLOT_ID,
    handle: CK_SESSION_HANDLE,
    logged_in: bool,
    open: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("slot_id", &self.slot_id)
            .field("handle", &self.handle)
            .field("logged_in", &self.logged_in)
            .field("open", &self.open)
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        api: Arc<dyn Pkcs11Api>,
        slot_id: CK_SLOT_ID,
        handle: CK_SESSION_HANDLE,
    ) -> Self {
        Self {
            api,
            slot_id,
            handle,
            logged_in: false,
            open: true,
        }
    }

    pub(crate) fn api(&self) -> &dyn Pkcs11Api {
        self.api.as_ref()
    }

    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Log the normal user in.
    ///
    /// A token reporting the user as already logged in is accepted.
    pub fn login(&mut self, pin: &str) -> BResult<()> {
        self.ensure_open("Login")?;
        let pin = Zeroizing::new(pin.as_bytes().to_vec());
        let rv = self.api.login(self.handle, CKU_USER, &pin);
        if rv == CKR_USER_ALREADY_LOGGED_IN {
            warn!("user already logged in, ignoring logging");
        } else {
            check_rv("Login", rv)?;
        }
        self.logged_in = true;
        Ok(())
    }

    pub fn logout(&mut self) -> BResult<()> {
        self.ensure_open("Logout")?;
        check_rv("Logout", self.api.logout(self.handle))?;
        self.logged_in = false;
        Ok(())
    }

    /// Log out if necessary and close the session.
    pub fn close(&mut self) -> BResult<()> {
        if !self.open {
            return Ok(());
        }
        if self.logged_in {
            if let Err(e) = self.logout() {
                warn!("Failed logging out of session {}: {e}", self.handle);
            }
        }
        check_rv("CloseSession", self.api.close_session(self.handle))?;
        debug!("Closed session {}", self.handle);
        self.open = false;
        Ok(())
    }

    /// Generate an AES key stored on the token.
    ///
    /// A `sensitive` key is flagged as such and cannot be extracted.
    pub fn generate_aes_key(
        &self,
        label: &[u8],
        size: AesKeySize,
        sensitive: bool,
    ) -> BResult<KeyHandle> {
        self.ensure_open("GenerateKey")?;
        let template = [
            Attribute::ulong(CKA_CLASS, CKO_SECRET_KEY),
            Attribute::ulong(CKA_KEY_TYPE, CKK_AES),
            Attribute::ulong(CKA_VALUE_LEN, CK_ULONG::try_from(size.key_length())?),
            Attribute::bool(CKA_TOKEN, true),
            Attribute::bool(CKA_PRIVATE, true),
            Attribute::bool(CKA_ENCRYPT, true),
            Attribute::bool(CKA_DECRYPT, true),
            Attribute::bool(CKA_SENSITIVE, sensitive),
            Attribute::bool(CKA_EXTRACTABLE, !sensitive),
            Attribute::bytes(CKA_LABEL, label),
        ];
        let mut key: CK_OBJECT_HANDLE = 0;
        check_rv(
            "GenerateKey",
            self.api
                .generate_key(self.handle, CKM_AES_KEY_GEN, &template, &mut key),
        )?;
        debug!("Generated {size:?} key {key} in session {}", self.handle);
        Ok(KeyHandle(key))
    }

    pub fn generate_random(&self, len: usize) -> BResult<Vec<u8>> {
        self.ensure_open("GenerateRandom")?;
        let mut values = vec![0_u8; len];
        check_rv(
            "GenerateRandom",
            self.api.generate_random(self.handle, &mut values),
        )?;
        Ok(values)
    }

    pub(crate) fn ensure_open(&self, operation: &str) -> BResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(BindingError::Usage(format!(
                "{operation} called on closed session {}",
                self.handle
            )))
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed closing session {}: {e}", self.handle);
        }
    }
}
