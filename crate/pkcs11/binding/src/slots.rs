use std::{fmt, sync::Arc};

use pkcs11_sys::{
    CK_FLAGS, CK_SESSION_HANDLE, CK_SLOT_ID, CK_SLOT_INFO, CKF_HW_SLOT, CKF_REMOVABLE_DEVICE,
    CKF_RW_SESSION, CKF_SERIAL_SESSION, CKF_TOKEN_PRESENT,
};
use tracing::debug;

use crate::{
    BResult, Pkcs11Api, Session, Version,
    error::check_rv,
    module::{empty_version, trim_padded},
};

/// Slot metadata returned by `C_GetSlotInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot_description: String,
    pub manufacturer_id: String,
    pub flags: u64,
    pub hardware_version: Version,
    pub firmware_version: Version,
}

impl SlotInfo {
    #[must_use]
    pub fn is_token_present(&self) -> bool {
        self.has_flag(CKF_TOKEN_PRESENT)
    }

    #[must_use]
    pub fn is_removable_device(&self) -> bool {
        self.has_flag(CKF_REMOVABLE_DEVICE)
    }

    #[must_use]
    pub fn is_hardware_slot(&self) -> bool {
        self.has_flag(CKF_HW_SLOT)
    }

    #[allow(clippy::useless_conversion)]
    fn has_flag(&self, flag: CK_FLAGS) -> bool {
        self.flags & u64::from(flag) != 0
    }
}

impl From<&CK_SLOT_INFO> for SlotInfo {
    #[allow(clippy::useless_conversion)]
    fn from(info: &CK_SLOT_INFO) -> Self {
        Self {
            slot_description: trim_padded(&info.slotDescription),
            manufacturer_id: trim_padded(&info.manufacturerID),
            flags: u64::from(info.flags),
            hardware_version: info.hardwareVersion.into(),
            firmware_version: info.firmwareVersion.into(),
        }
    }
}

/// A token insertion point reported by the provider
#[derive(Clone)]
pub struct Slot {
    id: CK_SLOT_ID,
    api: Arc<dyn Pkcs11Api>,
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot").field("id", &self.id).finish()
    }
}

impl Slot {
    pub(crate) fn new(id: CK_SLOT_ID, api: Arc<dyn Pkcs11Api>) -> Self {
        Self { id, api }
    }

    #[must_use]
    pub const fn id(&self) -> CK_SLOT_ID {
        self.id
    }

    /// Query the slot metadata (`C_GetSlotInfo`).
    pub fn get_info(&self) -> BResult<SlotInfo> {
        let mut ck_info = CK_SLOT_INFO {
            slotDescription: [b' '; 64],
            manufacturerID: [b' '; 32],
            flags: 0,
            hardwareVersion: empty_version(),
            firmwareVersion: empty_version(),
        };
        check_rv("GetSlotInfo", self.api.get_slot_info(self.id, &mut ck_info))?;
        Ok(SlotInfo::from(&ck_info))
    }

    /// Open a session on the token in this slot.
    ///
    /// The session is read-only unless `read_write` is set. It is closed when dropped.
    pub fn open_session(&self, read_write: bool) -> BResult<Session> {
        let flags: CK_FLAGS = if read_write {
            CKF_RW_SESSION | CKF_SERIAL_SESSION
        } else {
            CKF_SERIAL_SESSION
        };
        let mut handle: CK_SESSION_HANDLE = 0;
        check_rv(
            "OpenSession",
            self.api.open_session(self.id, flags, &mut handle),
        )?;
        debug!(
            "Opened session {handle} on slot {}. Read/write? {read_write}",
            self.id
        );
        Ok(Session::new(self.api.clone(), self.id, handle))
    }
}

/// The ordered slots returned by `Module::get_slots`
pub struct SlotCollection {
    slot_ids: Vec<CK_SLOT_ID>,
    api: Arc<dyn Pkcs11Api>,
}

impl fmt::Debug for SlotCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.slot_ids).finish()
    }
}

impl SlotCollection {
    pub(crate) fn new(slot_ids: Vec<CK_SLOT_ID>, api: Arc<dyn Pkcs11Api>) -> Self {
        Self { slot_ids, api }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slot_ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slot_ids.is_empty()
    }

    /// The slot at `index` in provider order
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Slot> {
        self.slot_ids
            .get(index)
            .map(|id| Slot::new(*id, self.api.clone()))
    }

    /// The slot with the given identifier, if it is part of the collection
    #[must_use]
    pub fn find(&self, slot_id: CK_SLOT_ID) -> Option<Slot> {
        self.slot_ids
            .contains(&slot_id)
            .then(|| Slot::new(slot_id, self.api.clone()))
    }

    #[must_use]
    pub fn ids(&self) -> &[CK_SLOT_ID] {
        &self.slot_ids
    }

    pub fn iter(&self) -> impl Iterator<Item = Slot> + '_ {
        self.slot_ids
            .iter()
            .map(|id| Slot::new(*id, self.api.clone()))
    }
}
