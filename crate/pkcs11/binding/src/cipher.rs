//! Streaming encryption and decryption bound to a session and a key.
//!
//! An operation goes strictly forward: `Uninitialized → Active → Finalized`.
//! `init` starts the provider context, `update` may be called any number of
//! times and returns the output produced for that chunk, `finalize` flushes what
//! the provider held back (padding block, authentication tag) and ends the
//! operation. A finalized operation cannot be reused.
//!
//! Output buffers are sized up front from what is known of the operation:
//! - `update`: the chunk length plus the bytes fed but not yet returned,
//! - `finalize`: the bytes still held back plus one block and the tag length
//!   of the mechanism.
//!
//! A provider reporting more output than that is a protocol violation and fails
//! with [`BindingError::BufferSize`].
//!
//! Any failed `update` or `finalize` ends the operation. PKCS#11 providers
//! terminate the operation on error, except on `CKR_BUFFER_TOO_SMALL` or when
//! they report more output than the buffer holds. In those two cases, and when
//! an active operation is dropped, the provider context is closed by a
//! `C_EncryptFinal` (`C_DecryptFinal`) whose output is discarded, so the session
//! can start a new operation.
//!
//! RSA mechanisms are single-part in PKCS#11 (`C_Encrypt` / `C_Decrypt`). Use
//! `once` on a freshly initialized operation to run them. Most providers refuse
//! `update` with these mechanisms.

use pkcs11_sys::{CK_RV, CK_ULONG, CKR_BUFFER_TOO_SMALL, CKR_OK};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::{
    Algorithm, BResult, BindingError, KeyHandle, Mechanism, Session,
    error::{check_rv, reported_len},
};

/// Where an operation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherState {
    Uninitialized,
    Active,
    Finalized,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    const fn init_operation(self) -> &'static str {
        match self {
            Self::Encrypt => "EncryptInit",
            Self::Decrypt => "DecryptInit",
        }
    }

    const fn update_operation(self) -> &'static str {
        match self {
            Self::Encrypt => "EncryptUpdate",
            Self::Decrypt => "DecryptUpdate",
        }
    }

    const fn final_operation(self) -> &'static str {
        match self {
            Self::Encrypt => "EncryptFinal",
            Self::Decrypt => "DecryptFinal",
        }
    }

    const fn single_part_operation(self) -> &'static str {
        match self {
            Self::Encrypt => "Encrypt",
            Self::Decrypt => "Decrypt",
        }
    }
}

#[derive(Debug)]
enum State {
    Uninitialized,
    Active {
        mechanism: Mechanism,
        /// input bytes fed to the provider and not yet returned as output
        pending: usize,
        /// whether `update` was called: a single-part call is no longer allowed
        streamed: bool,
    },
    Finalized,
}

/// Output capacity for `final`: the held back bytes, one block and the tag
fn final_capacity(
    operation: &'static str,
    mechanism: &Mechanism,
    pending: usize,
) -> BResult<usize> {
    pending
        .checked_add(mechanism.block_size())
        .and_then(|c| c.checked_add(mechanism.tag_length()))
        .ok_or_else(|| BindingError::invalid_length(operation))
}

/// The state machine shared by [`Cipher`] and [`Decipher`]
#[derive(Debug)]
struct StreamOperation<'a> {
    session: &'a Session,
    direction: Direction,
    state: State,
}

impl<'a> StreamOperation<'a> {
    const fn new(session: &'a Session, direction: Direction) -> Self {
        Self {
            session,
            direction,
            state: State::Uninitialized,
        }
    }

    const fn state(&self) -> CipherState {
        match self.state {
            State::Uninitialized => CipherState::Uninitialized,
            State::Active { .. } => CipherState::Active,
            State::Finalized => CipherState::Finalized,
        }
    }

    fn init(&mut self, algorithm: Algorithm, key: KeyHandle) -> BResult<()> {
        let operation = self.direction.init_operation();
        match self.state {
            State::Uninitialized => {}
            State::Active { .. } => {
                return Err(BindingError::Usage(format!(
                    "{operation}: the operation is already initialized"
                )));
            }
            State::Finalized => {
                return Err(BindingError::Usage(format!(
                    "{operation}: the operation is finalized and cannot be reused"
                )));
            }
        }
        self.session.ensure_open(operation)?;
        let mechanism = algorithm.resolve()?;
        let api = self.session.api();
        let session_handle = self.session.handle();
        let rv = match self.direction {
            Direction::Encrypt => api.encrypt_init(session_handle, &mechanism, key.handle()),
            Direction::Decrypt => api.decrypt_init(session_handle, &mechanism, key.handle()),
        };
        check_rv(operation, rv)?;
        debug!(
            "{operation} with {mechanism} and key {} in session {session_handle}",
            key.handle()
        );
        self.state = State::Active {
            mechanism,
            pending: 0,
            streamed: false,
        };
        Ok(())
    }

    fn update(&mut self, input: &[u8]) -> BResult<Vec<u8>> {
        let operation = self.direction.update_operation();
        let State::Active { pending, .. } = self.state else {
            return Err(self.not_active(operation));
        };
        let capacity = input.len().checked_add(pending).ok_or_else(|| {
            BindingError::Usage(format!("{operation}: input too large for the output buffer"))
        })?;
        let api = self.session.api();
        let session_handle = self.session.handle();
        let result = self.call_with_buffer(operation, capacity, |output, output_len| {
            match self.direction {
                Direction::Encrypt => {
                    api.encrypt_update(session_handle, input, output, output_len)
                }
                Direction::Decrypt => {
                    api.decrypt_update(session_handle, input, output, output_len)
                }
            }
        });
        match result {
            Ok(output) => {
                trace!(
                    "{operation}: {} bytes in, {} bytes out, {pending} bytes held before",
                    input.len(),
                    output.len()
                );
                if let State::Active {
                    pending, streamed, ..
                } = &mut self.state
                {
                    *pending = capacity.saturating_sub(output.len());
                    *streamed = true;
                }
                Ok(output)
            }
            Err(e) => {
                debug!("{operation} failed, ending the operation: {e}");
                if matches!(e, BindingError::BufferSize { .. }) {
                    self.abort();
                }
                self.state = State::Finalized;
                Err(e)
            }
        }
    }

    fn finalize(&mut self) -> BResult<Vec<u8>> {
        let operation = self.direction.final_operation();
        let State::Active {
            mechanism, pending, ..
        } = &self.state
        else {
            return Err(self.not_active(operation));
        };
        let capacity = final_capacity(operation, mechanism, *pending)?;
        let result = self.call_final(operation, capacity);
        if matches!(result, Err(BindingError::BufferSize { .. })) {
            self.abort();
        }
        self.state = State::Finalized;
        debug!(
            "{operation} in session {}: operation finalized",
            self.session.handle()
        );
        result
    }

    /// `update` then `finalize`, or a single `C_Encrypt` / `C_Decrypt` for a
    /// single-part mechanism that has not been fed yet.
    fn once(&mut self, input: &[u8]) -> BResult<Vec<u8>> {
        let single_part = matches!(
            &self.state,
            State::Active {
                mechanism,
                streamed: false,
                ..
            } if mechanism.is_single_part()
        );
        if single_part {
            return self.single_part(input);
        }
        let mut output = self.update(input)?;
        output.extend(self.finalize()?);
        Ok(output)
    }

    fn single_part(&mut self, input: &[u8]) -> BResult<Vec<u8>> {
        let operation = self.direction.single_part_operation();
        let State::Active { mechanism, .. } = &self.state else {
            return Err(self.not_active(operation));
        };
        let capacity = final_capacity(operation, mechanism, input.len())?;
        let api = self.session.api();
        let session_handle = self.session.handle();
        let result = self.call_with_buffer(operation, capacity, |output, output_len| {
            match self.direction {
                Direction::Encrypt => api.encrypt(session_handle, input, output, output_len),
                Direction::Decrypt => api.decrypt(session_handle, input, output, output_len),
            }
        });
        if matches!(result, Err(BindingError::BufferSize { .. })) {
            self.abort();
        }
        self.state = State::Finalized;
        debug!("{operation} in session {session_handle}: single-part operation done");
        result
    }

    fn call_final(&self, operation: &'static str, capacity: usize) -> BResult<Vec<u8>> {
        let api = self.session.api();
        let session_handle = self.session.handle();
        self.call_with_buffer(operation, capacity, |output, output_len| {
            match self.direction {
                Direction::Encrypt => api.encrypt_final(session_handle, output, output_len),
                Direction::Decrypt => api.decrypt_final(session_handle, output, output_len),
            }
        })
    }

    /// Close a provider context that may still be live, discarding its output.
    ///
    /// Any answer but a buffer size error means the provider context is gone.
    fn abort(&self) {
        let operation = self.direction.final_operation();
        let State::Active {
            mechanism, pending, ..
        } = &self.state
        else {
            return;
        };
        if self.session.ensure_open(operation).is_err() {
            return;
        }
        let session_handle = self.session.handle();
        let result = final_capacity(operation, mechanism, *pending)
            .and_then(|capacity| self.call_final(operation, capacity))
            .map(Zeroizing::new);
        match result {
            Ok(discarded) => debug!(
                "{operation}: aborted the operation in session {session_handle}, {} bytes discarded",
                discarded.len()
            ),
            Err(e @ BindingError::BufferSize { .. }) => warn!(
                "{operation}: failed to abort the operation in session {session_handle}, it stays \
                 active until the session is closed: {e}"
            ),
            Err(e) => debug!("{operation}: operation in session {session_handle} ended: {e}"),
        }
    }

    /// Call the provider with an output buffer of `capacity` bytes and keep the
    /// bytes it reports as produced.
    fn call_with_buffer<F>(
        &self,
        operation: &'static str,
        capacity: usize,
        call: F,
    ) -> BResult<Vec<u8>>
    where
        F: FnOnce(&mut [u8], &mut CK_ULONG) -> CK_RV,
    {
        let mut output = vec![0_u8; capacity];
        let mut output_len = CK_ULONG::try_from(capacity)?;
        let rv = call(&mut output, &mut output_len);
        if rv == CKR_BUFFER_TOO_SMALL {
            return Err(BindingError::BufferSize {
                operation,
                reported: output_len,
                capacity,
            });
        }
        if rv != CKR_OK {
            return Err(BindingError::native_call(operation, rv));
        }
        let produced = reported_len(operation, output_len)?;
        if produced > capacity {
            return Err(BindingError::BufferSize {
                operation,
                reported: output_len,
                capacity,
            });
        }
        output.truncate(produced);
        Ok(output)
    }

    fn not_active(&self, operation: &str) -> BindingError {
        match self.state {
            State::Uninitialized => BindingError::Usage(format!(
                "{operation} called before the operation was initialized"
            )),
            _ => BindingError::Usage(format!(
                "{operation} called after the operation was finalized"
            )),
        }
    }
}

impl Drop for StreamOperation<'_> {
    fn drop(&mut self) {
        if matches!(self.state, State::Active { .. }) {
            debug!("{}: active operation dropped", self.direction.init_operation());
            self.abort();
        }
    }
}

/// A streaming encryption bound to a session.
///
/// ```no_run
/// # use cosmian_pkcs11_binding::{Algorithm, BResult, Cipher, KeyHandle, Session};
/// # fn run(session: &Session, key: KeyHandle) -> BResult<Vec<u8>> {
/// let mut cipher = Cipher::new(session);
/// cipher.init(Algorithm::named("AES_CBC_PAD", [0_u8; 16]), key)?;
/// let mut ciphertext = cipher.update("hello ")?;
/// ciphertext.extend(cipher.update(b"world")?);
/// ciphertext.extend(cipher.finalize()?);
/// # Ok(ciphertext)
/// # }
/// ```
#[derive(Debug)]
pub struct Cipher<'a> {
    operation: StreamOperation<'a>,
}

impl<'a> Cipher<'a> {
    #[must_use]
    pub const fn new(session: &'a Session) -> Self {
        Self {
            operation: StreamOperation::new(session, Direction::Encrypt),
        }
    }

    #[must_use]
    pub const fn state(&self) -> CipherState {
        self.operation.state()
    }

    /// Start the encryption (`C_EncryptInit`).
    ///
    /// On failure the cipher stays uninitialized.
    pub fn init(&mut self, algorithm: impl Into<Algorithm>, key: KeyHandle) -> BResult<()> {
        self.operation.init(algorithm.into(), key)
    }

    /// Encrypt one chunk (`C_EncryptUpdate`).
    ///
    /// Text is encrypted as its UTF-8 bytes.
    pub fn update(&mut self, data: impl AsRef<[u8]>) -> BResult<Vec<u8>> {
        self.operation.update(data.as_ref())
    }

    /// Flush the remaining ciphertext and end the operation (`C_EncryptFinal`).
    pub fn finalize(&mut self) -> BResult<Vec<u8>> {
        self.operation.finalize()
    }

    /// `update` then `finalize`, concatenated.
    ///
    /// With an RSA mechanism on an operation not fed yet, a single `C_Encrypt`.
    pub fn once(&mut self, data: impl AsRef<[u8]>) -> BResult<Vec<u8>> {
        self.operation.once(data.as_ref())
    }
}

/// A streaming decryption bound to a session.
///
/// Plaintext is returned in zeroized buffers.
#[derive(Debug)]
pub struct Decipher<'a> {
    operation: StreamOperation<'a>,
}

impl<'a> Decipher<'a> {
    #[must_use]
    pub const fn new(session: &'a Session) -> Self {
        Self {
            operation: StreamOperation::new(session, Direction::Decrypt),
        }
    }

    #[must_use]
    pub const fn state(&self) -> CipherState {
        self.operation.state()
    }

    /// Start the decryption (`C_DecryptInit`).
    pub fn init(&mut self, algorithm: impl Into<Algorithm>, key: KeyHandle) -> BResult<()> {
        self.operation.init(algorithm.into(), key)
    }

    /// Decrypt one chunk (`C_DecryptUpdate`).
    pub fn update(&mut self, data: impl AsRef<[u8]>) -> BResult<Zeroizing<Vec<u8>>> {
        self.operation.update(data.as_ref()).map(Zeroizing::new)
    }

    /// Flush the remaining plaintext and end the operation (`C_DecryptFinal`).
    pub fn finalize(&mut self) -> BResult<Zeroizing<Vec<u8>>> {
        self.operation.finalize().map(Zeroizing::new)
    }

    /// See [`Cipher::once`]. RSA mechanisms go through `C_Decrypt`.
    pub fn once(&mut self, data: impl AsRef<[u8]>) -> BResult<Zeroizing<Vec<u8>>> {
        self.operation.once(data.as_ref()).map(Zeroizing::new)
    }
}
