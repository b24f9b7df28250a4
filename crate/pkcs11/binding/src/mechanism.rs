//! Mechanism descriptors: an algorithm selector plus its parameters.
//!
//! A [`Mechanism`] is built once per `init` call and never mutated afterwards.
//! Callers either hand over a descriptor directly or name the mechanism and
//! pass its raw parameters; both forms go through [`Algorithm::resolve`] so the
//! provider only ever sees one canonical descriptor.

use std::fmt::{self, Display, Formatter};

use pkcs11_sys::{
    CK_MECHANISM_TYPE, CKM_AES_CBC, CKM_AES_CBC_PAD, CKM_AES_CTR, CKM_AES_ECB, CKM_AES_GCM,
    CKM_RSA_PKCS, CKM_RSA_PKCS_OAEP,
};

use crate::{BResult, BindingError};

/// AES block size in bytes
pub(crate) const AES_BLOCK_SIZE: usize = 16;
/// Largest RSA modulus (8192 bits) a single RSA block can span
pub(crate) const RSA_MAX_MODULUS_BYTES: usize = 1024;
const AES_GCM_DEFAULT_TAG_BITS: u32 = 128;
const AES_GCM_MAX_IV_LENGTH: usize = 256;

/// Hash used by RSA OAEP, together with the matching MGF1 function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OaepHash {
    Sha1,
    Sha256,
}

/// Mechanisms supported by the streaming pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mechanism {
    AesEcb,
    AesCbc {
        iv: [u8; AES_BLOCK_SIZE],
    },
    /// AES CBC with PKCS#7 padding applied by the provider
    AesCbcPad {
        iv: [u8; AES_BLOCK_SIZE],
    },
    AesCtr {
        counter_bits: u32,
        counter_block: [u8; AES_BLOCK_SIZE],
    },
    AesGcm {
        iv: Vec<u8>,
        aad: Vec<u8>,
        tag_bits: u32,
    },
    /// Single-part only: run it through `once`
    RsaPkcs,
    /// Single-part only: run it through `once`
    RsaPkcsOaep {
        hash: OaepHash,
    },
}

impl Mechanism {
    #[must_use]
    pub const fn mechanism_type(&self) -> CK_MECHANISM_TYPE {
        match self {
            Self::AesEcb => CKM_AES_ECB,
            Self::AesCbc { .. } => CKM_AES_CBC,
            Self::AesCbcPad { .. } => CKM_AES_CBC_PAD,
            Self::AesCtr { .. } => CKM_AES_CTR,
            Self::AesGcm { .. } => CKM_AES_GCM,
            Self::RsaPkcs => CKM_RSA_PKCS,
            Self::RsaPkcsOaep { .. } => CKM_RSA_PKCS_OAEP,
        }
    }

    /// The largest block the provider may hold back and release on `final`.
    #[must_use]
    pub const fn block_size(&self) -> usize {
        match self {
            Self::AesEcb
            | Self::AesCbc { .. }
            | Self::AesCbcPad { .. }
            | Self::AesCtr { .. }
            | Self::AesGcm { .. } => AES_BLOCK_SIZE,
            Self::RsaPkcs | Self::RsaPkcsOaep { .. } => RSA_MAX_MODULUS_BYTES,
        }
    }

    /// RSA mechanisms are defined for `C_Encrypt` / `C_Decrypt` only.
    #[must_use]
    pub const fn is_single_part(&self) -> bool {
        matches!(self, Self::RsaPkcs | Self::RsaPkcsOaep { .. })
    }

    /// Length of the authentication tag appended on `final`, in bytes
    #[must_use]
    pub const fn tag_length(&self) -> usize {
        match self {
            Self::AesGcm { tag_bits, .. } => (*tag_bits as usize).div_ceil(8),
            _ => 0,
        }
    }

    /// Build a descriptor from a mechanism name and its raw parameter bytes.
    ///
    /// Names are case-insensitive and may carry the `CKM_` prefix:
    /// - `AES_ECB`, `RSA_PKCS`, `RSA_PKCS_OAEP` (SHA-1), `RSA_PKCS_OAEP_SHA256`: no parameters
    /// - `AES_CBC`, `AES_CBC_PAD`: the 16 bytes IV
    /// - `AES_CTR`: the 16 bytes initial counter block, the whole block being the counter
    /// - `AES_GCM`: the IV, with no additional data and a 128 bits tag
    pub fn from_name(name: &str, params: &[u8]) -> BResult<Self> {
        let normalized = name.trim().to_ascii_uppercase().replace('-', "_");
        let normalized = normalized.strip_prefix("CKM_").unwrap_or(&normalized);
        let mechanism = match normalized {
            "AES_ECB" => {
                no_params(name, params)?;
                Self::AesEcb
            }
            "AES_CBC" => Self::AesCbc {
                iv: block_param(name, params)?,
            },
            "AES_CBC_PAD" => Self::AesCbcPad {
                iv: block_param(name, params)?,
            },
            "AES_CTR" => Self::AesCtr {
                counter_bits: 128,
                counter_block: block_param(name, params)?,
            },
            "AES_GCM" => {
                if params.is_empty() || params.len() > AES_GCM_MAX_IV_LENGTH {
                    return Err(BindingError::Mechanism(format!(
                        "{name}: the IV must be between 1 and {AES_GCM_MAX_IV_LENGTH} bytes, got \
                         {}",
                        params.len()
                    )));
                }
                Self::AesGcm {
                    iv: params.to_vec(),
                    aad: Vec::new(),
                    tag_bits: AES_GCM_DEFAULT_TAG_BITS,
                }
            }
            "RSA_PKCS" => {
                no_params(name, params)?;
                Self::RsaPkcs
            }
            "RSA_PKCS_OAEP" | "RSA_PKCS_OAEP_SHA1" => {
                no_params(name, params)?;
                Self::RsaPkcsOaep {
                    hash: OaepHash::Sha1,
                }
            }
            "RSA_PKCS_OAEP_SHA256" => {
                no_params(name, params)?;
                Self::RsaPkcsOaep {
                    hash: OaepHash::Sha256,
                }
            }
            _ => {
                return Err(BindingError::Mechanism(format!(
                    "unknown mechanism name: {name}"
                )));
            }
        };
        Ok(mechanism)
    }

    /// Check parameters a descriptor built by hand could get wrong.
    fn validate(&self) -> BResult<()> {
        match self {
            Self::AesCtr { counter_bits, .. }
                if *counter_bits == 0 || *counter_bits as usize > AES_BLOCK_SIZE * 8 =>
            {
                Err(BindingError::Mechanism(format!(
                    "AES CTR counter bits must be between 1 and 128, got {counter_bits}"
                )))
            }
            Self::AesGcm { iv, tag_bits, .. } => {
                if iv.is_empty() || iv.len() > AES_GCM_MAX_IV_LENGTH {
                    return Err(BindingError::Mechanism(format!(
                        "AES GCM IV must be between 1 and {AES_GCM_MAX_IV_LENGTH} bytes, got {}",
                        iv.len()
                    )));
                }
                if *tag_bits == 0 || *tag_bits > 128 || tag_bits % 8 != 0 {
                    return Err(BindingError::Mechanism(format!(
                        "AES GCM tag length must be a multiple of 8 bits up to 128, got \
                         {tag_bits}"
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Display for Mechanism {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AesEcb => "CKM_AES_ECB",
            Self::AesCbc { .. } => "CKM_AES_CBC",
            Self::AesCbcPad { .. } => "CKM_AES_CBC_PAD",
            Self::AesCtr { .. } => "CKM_AES_CTR",
            Self::AesGcm { .. } => "CKM_AES_GCM",
            Self::RsaPkcs => "CKM_RSA_PKCS",
            Self::RsaPkcsOaep {
                hash: OaepHash::Sha1,
            } => "CKM_RSA_PKCS_OAEP (SHA-1)",
            Self::RsaPkcsOaep {
                hash: OaepHash::Sha256,
            } => "CKM_RSA_PKCS_OAEP (SHA-256)",
        };
        f.write_str(name)
    }
}

fn no_params(name: &str, params: &[u8]) -> BResult<()> {
    if params.is_empty() {
        Ok(())
    } else {
        Err(BindingError::Mechanism(format!(
            "{name} takes no parameters, got {} bytes",
            params.len()
        )))
    }
}

fn block_param(name: &str, params: &[u8]) -> BResult<[u8; AES_BLOCK_SIZE]> {
    params.try_into().map_err(|_| {
        BindingError::Mechanism(format!(
            "{name} expects a {AES_BLOCK_SIZE} bytes parameter, got {} bytes",
            params.len()
        ))
    })
}

/// What a caller passes to `init`: a ready descriptor or a name with parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    Descriptor(Mechanism),
    Named { name: String, params: Vec<u8> },
}

impl Algorithm {
    pub fn named(name: impl Into<String>, params: impl Into<Vec<u8>>) -> Self {
        Self::Named {
            name: name.into(),
            params: params.into(),
        }
    }

    /// Resolve to the canonical descriptor handed to the provider.
    pub fn resolve(self) -> BResult<Mechanism> {
        let mechanism = match self {
            Self::Descriptor(mechanism) => mechanism,
            Self::Named { name, params } => Mechanism::from_name(&name, &params)?,
        };
        mechanism.validate()?;
        Ok(mechanism)
    }
}

impl From<Mechanism> for Algorithm {
    fn from(mechanism: Mechanism) -> Self {
        Self::Descriptor(mechanism)
    }
}

impl From<&str> for Algorithm {
    fn from(name: &str) -> Self {
        Self::named(name, Vec::new())
    }
}
