use std::{
    ffi::CStr,
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    sync::Arc,
};

use pkcs11_sys::{CK_INFO, CK_SLOT_ID, CK_ULONG, CK_VERSION, CKR_CRYPTOKI_NOT_INITIALIZED};
use tracing::{debug, warn};

use crate::{
    BResult, BindingError, InitArgs, Pkcs11Api, Pkcs11Library, SlotCollection,
    error::{check_rv, reported_len},
};

/// A `major.minor` version as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl From<CK_VERSION> for Version {
    fn from(version: CK_VERSION) -> Self {
        Self {
            major: version.major,
            minor: version.minor,
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Provider metadata returned by `C_GetInfo`, blank padding removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub cryptoki_version: Version,
    pub manufacturer_id: String,
    pub flags: u64,
    pub library_description: String,
    pub library_version: Version,
}

impl From<&CK_INFO> for ModuleInfo {
    fn from(info: &CK_INFO) -> Self {
        #[cfg(target_os = "windows")]
        let flags = u64::from(info.flags);
        #[cfg(not(target_os = "windows"))]
        let flags = info.flags;
        Self {
            cryptoki_version: info.cryptokiVersion.into(),
            manufacturer_id: trim_padded(&info.manufacturerID),
            flags,
            library_description: trim_padded(&info.libraryDescription),
            library_version: info.libraryVersion.into(),
        }
    }
}

impl Display for ModuleInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}\nManufacturer ID: {}\nFlags: {}\nLibrary Description: \
             {}\nLibrary Version: {}",
            self.cryptoki_version,
            self.manufacturer_id,
            self.flags,
            self.library_description,
            self.library_version
        )
    }
}

/// Fixed width PKCS#11 strings are blank padded and not NUL terminated.
pub(crate) fn trim_padded(field: &[u8]) -> String {
    let bytes = CStr::from_bytes_until_nul(field).map_or(field, CStr::to_bytes);
    String::from_utf8_lossy(bytes)
        .trim_end_matches(' ')
        .to_owned()
}

pub(crate) const fn empty_version() -> CK_VERSION {
    CK_VERSION { major: 0, minor: 0 }
}

/// One loaded PKCS#11 provider.
///
/// The provider is process-wide state: there should be a single `Module` per
/// provider path, initialized at most once at a time. A `Module` that is still
/// initialized when dropped calls `C_Finalize`.
/// Sessions and ciphers hold the call surface, not the `Module`: finalizing
/// while they are in use is the caller's responsibility.
pub struct Module {
    api: Arc<dyn Pkcs11Api>,
    lib_file: PathBuf,
    lib_name: String,
    info: Option<ModuleInfo>,
    initialized: bool,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("lib_file", &self.lib_file)
            .field("lib_name", &self.lib_name)
            .field("info", &self.info)
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl Module {
    /// Load the provider at `lib_file` and query its metadata.
    ///
    /// `lib_name` defaults to the library path.
    /// A provider refusing `C_GetInfo` with `CKR_CRYPTOKI_NOT_INITIALIZED` still
    /// loads: [`Module::info`] stays `None` until [`Module::initialize`] fetches
    /// it. Any other `C_GetInfo` failure is returned.
    pub fn load<P: AsRef<Path>>(lib_file: P, lib_name: Option<&str>) -> BResult<Self> {
        let library = Pkcs11Library::load(lib_file.as_ref())?;
        Self::from_api(Arc::new(library), lib_file.as_ref(), lib_name)
    }

    /// Build a `Module` over an existing call surface.
    ///
    /// `C_GetInfo` is tolerated to fail with `CKR_CRYPTOKI_NOT_INITIALIZED`, as
    /// in [`Module::load`].
    pub fn from_api<P: AsRef<Path>>(
        api: Arc<dyn Pkcs11Api>,
        lib_file: P,
        lib_name: Option<&str>,
    ) -> BResult<Self> {
        let lib_file = lib_file.as_ref().to_path_buf();
        let lib_name = lib_name.map_or_else(|| lib_file.display().to_string(), ToOwned::to_owned);
        let mut module = Self {
            api,
            lib_file,
            lib_name,
            info: None,
            initialized: false,
        };
        let lib_name = module.lib_name.clone();
        match module.get_info() {
            Ok(info) => debug!("Loaded PKCS#11 provider {lib_name}:\n{info}"),
            // many providers refuse C_GetInfo before C_Initialize
            Err(e) if e.rv() == Some(CKR_CRYPTOKI_NOT_INITIALIZED) => {
                debug!(
                    "Provider {lib_name} not initialized yet, metadata will be fetched on \
                     initialize"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(module)
    }

    #[must_use]
    pub fn lib_file(&self) -> &Path {
        &self.lib_file
    }

    #[must_use]
    pub fn lib_name(&self) -> &str {
        &self.lib_name
    }

    /// The metadata fetched by the last successful `get_info`
    #[must_use]
    pub const fn info(&self) -> Option<&ModuleInfo> {
        self.info.as_ref()
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The call surface shared with slots, sessions and ciphers
    #[must_use]
    pub fn api(&self) -> Arc<dyn Pkcs11Api> {
        self.api.clone()
    }

    /// Query the provider metadata (`C_GetInfo`) and cache it.
    pub fn get_info(&mut self) -> BResult<&ModuleInfo> {
        let mut ck_info = CK_INFO {
            cryptokiVersion: empty_version(),
            manufacturerID: [b' '; 32],
            flags: 0,
            libraryDescription: [b' '; 32],
            libraryVersion: empty_version(),
        };
        check_rv("GetInfo", self.api.get_info(&mut ck_info))?;
        Ok(self.info.insert(ModuleInfo::from(&ck_info)))
    }

    /// Initialize the provider with OS locking enabled.
    pub fn initialize(&mut self) -> BResult<()> {
        self.initialize_with(InitArgs::default())
    }

    /// Initialize the provider (`C_Initialize`).
    ///
    /// Whatever the provider reports, including `CKR_CRYPTOKI_ALREADY_INITIALIZED`,
    /// is surfaced as is.
    pub fn initialize_with(&mut self, args: InitArgs) -> BResult<()> {
        debug!("Initializing PKCS#11 provider {} with {args:?}", self.lib_name);
        check_rv("Initialize", self.api.initialize(&args))?;
        self.initialized = true;
        if self.info.is_none() {
            self.get_info()?;
        }
        Ok(())
    }

    /// Finalize the provider (`C_Finalize`).
    pub fn finalize(&mut self) -> BResult<()> {
        debug!("Finalizing PKCS#11 provider {}", self.lib_name);
        check_rv("Finalize", self.api.finalize())?;
        self.initialized = false;
        Ok(())
    }

    /// List the slots of the provider, only those holding a token when
    /// `token_present` is set.
    ///
    /// The list is fetched in two calls: the first one returns the number of
    /// slots, the second one fills a buffer of that size. No second call is
    /// made when there are no slots.
    pub fn get_slots(&self, token_present: bool) -> BResult<SlotCollection> {
        let count = self.get_slot_count(token_present)?;
        if count == 0 {
            debug!("No slot reported by {}", self.lib_name);
            return Ok(SlotCollection::new(Vec::new(), self.api.clone()));
        }
        let slot_ids = self.fill_slot_list(token_present, count)?;
        debug!("Slots reported by {}: {slot_ids:?}", self.lib_name);
        Ok(SlotCollection::new(slot_ids, self.api.clone()))
    }

    fn get_slot_count(&self, token_present: bool) -> BResult<usize> {
        let mut count: CK_ULONG = 0;
        check_rv(
            "GetSlotList",
            self.api.get_slot_list(token_present, None, &mut count),
        )?;
        reported_len("GetSlotList", count)
    }

    fn fill_slot_list(&self, token_present: bool, count: usize) -> BResult<Vec<CK_SLOT_ID>> {
        let mut slot_ids: Vec<CK_SLOT_ID> = Vec::new();
        slot_ids
            .try_reserve_exact(count)
            .map_err(|_| BindingError::invalid_length("GetSlotList"))?;
        slot_ids.resize(count, 0);
        let mut filled = CK_ULONG::try_from(count)?;
        check_rv(
            "GetSlotList",
            self.api
                .get_slot_list(token_present, Some(&mut slot_ids), &mut filled),
        )?;
        let filled_len = reported_len("GetSlotList", filled)?;
        if filled_len > count {
            return Err(BindingError::BufferSize {
                operation: "GetSlotList",
                reported: filled,
                capacity: count,
            });
        }
        slot_ids.truncate(filled_len);
        Ok(slot_ids)
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        if self.initialized {
            if let Err(e) = self.finalize() {
                warn!("Failed finalizing PKCS#11 provider {}: {e}", self.lib_name);
            }
        }
    }
}
