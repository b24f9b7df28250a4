use std::{path::Path, ptr};

use libloading::Library;
use pkcs11_sys::*;
use tracing::debug;

use crate::{BResult, Mechanism, mechanism::OaepHash};

/// Arguments passed to `C_Initialize`
#[derive(Debug, Clone, Copy)]
pub struct InitArgs {
    /// Let the provider use the native OS threading primitives (`CKF_OS_LOCKING_OK`)
    pub os_locking_ok: bool,
}

impl Default for InitArgs {
    fn default() -> Self {
        Self {
            os_locking_ok: true,
        }
    }
}

/// A template attribute handed to the provider, e.g. for key generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attribute_type: CK_ATTRIBUTE_TYPE,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
}

impl Attribute {
    #[must_use]
    pub const fn bool(attribute_type: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        Self {
            attribute_type,
            value: AttributeValue::Bool(value),
        }
    }

    #[must_use]
    pub const fn ulong(attribute_type: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self {
            attribute_type,
            value: AttributeValue::Ulong(value),
        }
    }

    pub fn bytes(attribute_type: CK_ATTRIBUTE_TYPE, value: impl Into<Vec<u8>>) -> Self {
        Self {
            attribute_type,
            value: AttributeValue::Bytes(value.into()),
        }
    }
}

/// The provider-call surface.
///
/// One method per PKCS#11 entry point used by this crate. Methods return the raw
/// `CK_RV` and keep the PKCS#11 length protocol: `*_len` parameters carry the
/// output buffer capacity in and the number of bytes produced out.
/// [`Pkcs11Library`] forwards them to a loaded shared object; tests and embedders
/// can provide their own implementation.
pub trait Pkcs11Api: Send + Sync {
    fn initialize(&self, args: &InitArgs) -> CK_RV;
    fn finalize(&self) -> CK_RV;
    fn get_info(&self, info: &mut CK_INFO) -> CK_RV;

    /// With `slot_list` set to `None`, only the number of slots is returned in `count`.
    fn get_slot_list(
        &self,
        token_present: bool,
        slot_list: Option<&mut [CK_SLOT_ID]>,
        count: &mut CK_ULONG,
    ) -> CK_RV;
    fn get_slot_info(&self, slot_id: CK_SLOT_ID, info: &mut CK_SLOT_INFO) -> CK_RV;

    fn open_session(
        &self,
        slot_id: CK_SLOT_ID,
        flags: CK_FLAGS,
        session: &mut CK_SESSION_HANDLE,
    ) -> CK_RV;
    fn close_session(&self, session: CK_SESSION_HANDLE) -> CK_RV;
    fn login(&self, session: CK_SESSION_HANDLE, user_type: CK_USER_TYPE, pin: &[u8]) -> CK_RV;
    fn logout(&self, session: CK_SESSION_HANDLE) -> CK_RV;

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        template: &[Attribute],
        key: &mut CK_OBJECT_HANDLE,
    ) -> CK_RV;
    fn generate_random(&self, session: CK_SESSION_HANDLE, output: &mut [u8]) -> CK_RV;

    fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV;
    fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV;
    fn encrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV;
    /// Single-part encryption (`C_Encrypt`), ending the operation
    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV;

    fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV;
    fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV;
    fn decrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV;
    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV;
}

/// A PKCS#11 provider loaded from a shared library.
///
/// All symbols are resolved when the library is loaded, so a provider missing
/// any of the entry points this crate uses is rejected up front.
/// The library stays loaded as long as this struct lives.
pub struct Pkcs11Library {
    _library: Library,
    C_Initialize: CK_C_Initialize,
    C_Finalize: CK_C_Finalize,
    C_GetInfo: CK_C_GetInfo,
    C_GetSlotList: CK_C_GetSlotList,
    C_GetSlotInfo: CK_C_GetSlotInfo,

    C_OpenSession: CK_C_OpenSession,
    C_CloseSession: CK_C_CloseSession,
    C_Login: CK_C_Login,
    C_Logout: CK_C_Logout,

    C_GenerateKey: CK_C_GenerateKey,
    C_GenerateRandom: CK_C_GenerateRandom,

    C_EncryptInit: CK_C_EncryptInit,
    C_EncryptUpdate: CK_C_EncryptUpdate,
    C_EncryptFinal: CK_C_EncryptFinal,
    C_Encrypt: CK_C_Encrypt,

    C_DecryptInit: CK_C_DecryptInit,
    C_DecryptUpdate: CK_C_DecryptUpdate,
    C_DecryptFinal: CK_C_DecryptFinal,
    C_Decrypt: CK_C_Decrypt,
}

/// Call a resolved entry point, `CKR_FUNCTION_NOT_SUPPORTED` if it is missing
macro_rules! entry_point {
    ($self:ident, $name:ident $(, $arg:expr)* $(,)?) => {
        match $self.$name {
            #[allow(unsafe_code)]
            Some(function) => unsafe { function($($arg),*) },
            None => CKR_FUNCTION_NOT_SUPPORTED,
        }
    };
}

impl Pkcs11Library {
    pub fn load<P>(path: P) -> BResult<Self>
    where
        P: AsRef<Path>,
    {
        debug!("Loading PKCS#11 provider from {}", path.as_ref().display());
        unsafe {
            let library = Library::new(path.as_ref())?;
            let pkcs11_library = Self {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetSlotInfo: Some(*library.get(b"C_GetSlotInfo")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_Logout: Some(*library.get(b"C_Logout")?),
                C_GenerateKey: Some(*library.get(b"C_GenerateKey")?),
                C_GenerateRandom: Some(*library.get(b"C_GenerateRandom")?),
                C_EncryptInit: Some(*library.get(b"C_EncryptInit")?),
                C_EncryptUpdate: Some(*library.get(b"C_EncryptUpdate")?),
                C_EncryptFinal: Some(*library.get(b"C_EncryptFinal")?),
                C_Encrypt: Some(*library.get(b"C_Encrypt")?),
                C_DecryptInit: Some(*library.get(b"C_DecryptInit")?),
                C_DecryptUpdate: Some(*library.get(b"C_DecryptUpdate")?),
                C_DecryptFinal: Some(*library.get(b"C_DecryptFinal")?),
                C_Decrypt: Some(*library.get(b"C_Decrypt")?),
                // the symbols above are only valid while the library is loaded
                _library: library,
            };
            Ok(pkcs11_library)
        }
    }
}

/// Marshal a descriptor into a `CK_MECHANISM` and hand it to `f`.
///
/// The parameter structures live on this stack frame, so the pointer given to
/// `f` must not outlive the call.
fn with_ck_mechanism<F>(mechanism: &Mechanism, f: F) -> BResult<CK_RV>
where
    F: FnOnce(CK_MECHANISM_PTR) -> CK_RV,
{
    let mechanism_type = mechanism.mechanism_type();
    let rv = match mechanism {
        Mechanism::AesEcb | Mechanism::RsaPkcs => {
            let mut ck_mechanism = CK_MECHANISM {
                mechanism: mechanism_type,
                pParameter: ptr::null_mut(),
                ulParameterLen: 0,
            };
            f(&raw mut ck_mechanism)
        }
        Mechanism::AesCbc { iv } | Mechanism::AesCbcPad { iv } => {
            let mut iv = *iv;
            let mut ck_mechanism = CK_MECHANISM {
                mechanism: mechanism_type,
                pParameter: iv.as_mut_ptr().cast::<std::ffi::c_void>(),
                ulParameterLen: CK_ULONG::try_from(iv.len())?,
            };
            f(&raw mut ck_mechanism)
        }
        Mechanism::AesCtr {
            counter_bits,
            counter_block,
        } => {
            let mut params = CK_AES_CTR_PARAMS {
                ulCounterBits: CK_ULONG::from(*counter_bits),
                cb: *counter_block,
            };
            let mut ck_mechanism = CK_MECHANISM {
                mechanism: mechanism_type,
                pParameter: (&raw mut params).cast::<std::ffi::c_void>(),
                ulParameterLen: CK_ULONG::try_from(size_of::<CK_AES_CTR_PARAMS>())?,
            };
            f(&raw mut ck_mechanism)
        }
        Mechanism::AesGcm { iv, aad, tag_bits } => {
            let mut iv = iv.clone();
            let mut aad = aad.clone();
            let iv_len = CK_ULONG::try_from(iv.len())?;
            let mut params = CK_AES_GCM_PARAMS {
                pIv: iv.as_mut_ptr(),
                ulIvLen: iv_len,
                ulIvBits: iv_len * 8,
                pAAD: if aad.is_empty() {
                    ptr::null_mut()
                } else {
                    aad.as_mut_ptr()
                },
                ulAADLen: CK_ULONG::try_from(aad.len())?,
                ulTagBits: CK_ULONG::from(*tag_bits),
            };
            let mut ck_mechanism = CK_MECHANISM {
                mechanism: mechanism_type,
                pParameter: (&raw mut params).cast::<std::ffi::c_void>(),
                ulParameterLen: CK_ULONG::try_from(size_of::<CK_AES_GCM_PARAMS>())?,
            };
            f(&raw mut ck_mechanism)
        }
        Mechanism::RsaPkcsOaep { hash } => {
            let (hash_alg, mgf) = match hash {
                OaepHash::Sha1 => (CKM_SHA_1, CKG_MGF1_SHA1),
                OaepHash::Sha256 => (CKM_SHA256, CKG_MGF1_SHA256),
            };
            let mut params = CK_RSA_PKCS_OAEP_PARAMS {
                hashAlg: hash_alg,
                mgf,
                source: CKZ_DATA_SPECIFIED,
                pSourceData: ptr::null_mut(),
                ulSourceDataLen: 0,
            };
            let mut ck_mechanism = CK_MECHANISM {
                mechanism: mechanism_type,
                pParameter: (&raw mut params).cast::<std::ffi::c_void>(),
                ulParameterLen: CK_ULONG::try_from(size_of::<CK_RSA_PKCS_OAEP_PARAMS>())?,
            };
            f(&raw mut ck_mechanism)
        }
    };
    Ok(rv)
}

/// Storage for template values, kept alive while the provider reads them
enum TemplateValue {
    Bool(CK_BBOOL),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
}

impl Pkcs11Api for Pkcs11Library {
    fn initialize(&self, args: &InitArgs) -> CK_RV {
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: if args.os_locking_ok {
                CKF_OS_LOCKING_OK
            } else {
                0
            },
            pReserved: ptr::null_mut(),
        };
        entry_point!(
            self,
            C_Initialize,
            (&raw mut init_args).cast::<std::ffi::c_void>()
        )
    }

    fn finalize(&self) -> CK_RV {
        entry_point!(self, C_Finalize, ptr::null_mut())
    }

    fn get_info(&self, info: &mut CK_INFO) -> CK_RV {
        entry_point!(self, C_GetInfo, info)
    }

    fn get_slot_list(
        &self,
        token_present: bool,
        slot_list: Option<&mut [CK_SLOT_ID]>,
        count: &mut CK_ULONG,
    ) -> CK_RV {
        let slot_list_ptr = slot_list.map_or(ptr::null_mut(), <[CK_SLOT_ID]>::as_mut_ptr);
        entry_point!(
            self,
            C_GetSlotList,
            CK_BBOOL::from(token_present),
            slot_list_ptr,
            count
        )
    }

    fn get_slot_info(&self, slot_id: CK_SLOT_ID, info: &mut CK_SLOT_INFO) -> CK_RV {
        entry_point!(self, C_GetSlotInfo, slot_id, info)
    }

    fn open_session(
        &self,
        slot_id: CK_SLOT_ID,
        flags: CK_FLAGS,
        session: &mut CK_SESSION_HANDLE,
    ) -> CK_RV {
        entry_point!(
            self,
            C_OpenSession,
            slot_id,
            flags,
            ptr::null_mut(),
            None,
            session
        )
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> CK_RV {
        entry_point!(self, C_CloseSession, session)
    }

    fn login(&self, session: CK_SESSION_HANDLE, user_type: CK_USER_TYPE, pin: &[u8]) -> CK_RV {
        let Ok(pin_len) = CK_ULONG::try_from(pin.len()) else {
            return CKR_ARGUMENTS_BAD;
        };
        let mut pin = zeroize::Zeroizing::new(pin.to_vec());
        entry_point!(
            self,
            C_Login,
            session,
            user_type,
            pin.as_mut_ptr(),
            pin_len
        )
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> CK_RV {
        entry_point!(self, C_Logout, session)
    }

    fn generate_key(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: CK_MECHANISM_TYPE,
        template: &[Attribute],
        key: &mut CK_OBJECT_HANDLE,
    ) -> CK_RV {
        let mut values: Vec<TemplateValue> = template
            .iter()
            .map(|attribute| match &attribute.value {
                AttributeValue::Bool(b) => TemplateValue::Bool(CK_BBOOL::from(*b)),
                AttributeValue::Ulong(u) => TemplateValue::Ulong(*u),
                AttributeValue::Bytes(bytes) => TemplateValue::Bytes(bytes.clone()),
            })
            .collect();
        let mut ck_template = Vec::with_capacity(values.len());
        for (attribute, value) in template.iter().zip(values.iter_mut()) {
            let (p_value, value_len) = match value {
                TemplateValue::Bool(b) => (
                    std::ptr::from_mut(b).cast::<std::ffi::c_void>(),
                    size_of::<CK_BBOOL>(),
                ),
                TemplateValue::Ulong(u) => (
                    std::ptr::from_mut(u).cast::<std::ffi::c_void>(),
                    size_of::<CK_ULONG>(),
                ),
                TemplateValue::Bytes(bytes) => {
                    (bytes.as_mut_ptr().cast::<std::ffi::c_void>(), bytes.len())
                }
            };
            let Ok(value_len) = CK_ULONG::try_from(value_len) else {
                return CKR_ARGUMENTS_BAD;
            };
            ck_template.push(CK_ATTRIBUTE {
                type_: attribute.attribute_type,
                pValue: p_value,
                ulValueLen: value_len,
            });
        }
        let Ok(template_len) = CK_ULONG::try_from(ck_template.len()) else {
            return CKR_ARGUMENTS_BAD;
        };
        let mut ck_mechanism = CK_MECHANISM {
            mechanism,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        entry_point!(
            self,
            C_GenerateKey,
            session,
            &raw mut ck_mechanism,
            ck_template.as_mut_ptr(),
            template_len,
            key
        )
    }

    fn generate_random(&self, session: CK_SESSION_HANDLE, output: &mut [u8]) -> CK_RV {
        let Ok(len) = CK_ULONG::try_from(output.len()) else {
            return CKR_ARGUMENTS_BAD;
        };
        entry_point!(self, C_GenerateRandom, session, output.as_mut_ptr(), len)
    }

    fn encrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        with_ck_mechanism(mechanism, |ck_mechanism| {
            entry_point!(self, C_EncryptInit, session, ck_mechanism, key)
        })
        .unwrap_or(CKR_MECHANISM_PARAM_INVALID)
    }

    fn encrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV {
        let Ok(input_len) = CK_ULONG::try_from(input.len()) else {
            return CKR_ARGUMENTS_BAD;
        };
        entry_point!(
            self,
            C_EncryptUpdate,
            session,
            input.as_ptr().cast_mut(),
            input_len,
            output.as_mut_ptr(),
            output_len
        )
    }

    fn encrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV {
        entry_point!(
            self,
            C_EncryptFinal,
            session,
            output.as_mut_ptr(),
            output_len
        )
    }

    fn encrypt(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV {
        let Ok(input_len) = CK_ULONG::try_from(input.len()) else {
            return CKR_ARGUMENTS_BAD;
        };
        entry_point!(
            self,
            C_Encrypt,
            session,
            input.as_ptr().cast_mut(),
            input_len,
            output.as_mut_ptr(),
            output_len
        )
    }

    fn decrypt_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> CK_RV {
        with_ck_mechanism(mechanism, |ck_mechanism| {
            entry_point!(self, C_DecryptInit, session, ck_mechanism, key)
        })
        .unwrap_or(CKR_MECHANISM_PARAM_INVALID)
    }

    fn decrypt_update(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV {
        let Ok(input_len) = CK_ULONG::try_from(input.len()) else {
            return CKR_ARGUMENTS_BAD;
        };
        entry_point!(
            self,
            C_DecryptUpdate,
            session,
            input.as_ptr().cast_mut(),
            input_len,
            output.as_mut_ptr(),
            output_len
        )
    }

    fn decrypt_final(
        &self,
        session: CK_SESSION_HANDLE,
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV {
        entry_point!(
            self,
            C_DecryptFinal,
            session,
            output.as_mut_ptr(),
            output_len
        )
    }

    fn decrypt(
        &self,
        session: CK_SESSION_HANDLE,
        input: &[u8],
        output: &mut [u8],
        output_len: &mut CK_ULONG,
    ) -> CK_RV {
        let Ok(input_len) = CK_ULONG::try_from(input.len()) else {
            return CKR_ARGUMENTS_BAD;
        };
        entry_point!(
            self,
            C_Decrypt,
            session,
            input.as_ptr().cast_mut(),
            input_len,
            output.as_mut_ptr(),
            output_len
        )
    }
}
