use std::{path::Path, sync::Arc};

use pkcs11_sys::{
    CK_ULONG, CKA_EXTRACTABLE, CKA_SENSITIVE, CKA_VALUE_LEN, CKR_BUFFER_TOO_SMALL,
    CKR_CRYPTOKI_ALREADY_INITIALIZED, CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DEVICE_ERROR,
    CKR_GENERAL_ERROR, CKR_PIN_INCORRECT, CKR_TOKEN_NOT_PRESENT,
};

use super::{
    log_init, soft_module, soft_session,
    soft_token::{LIBRARY_DESCRIPTION, MANUFACTURER, SoftToken, USER_PIN},
};
use crate::{AesKeySize, Attribute, BindingError, CallStatus, InitArgs, Module, Version, rv_name};

#[test]
fn info_fields_are_trimmed() {
    let (_token, module) = soft_module();
    let info = module.info().unwrap();
    assert_eq!(info.manufacturer_id, MANUFACTURER);
    assert_eq!(info.library_description, LIBRARY_DESCRIPTION);
    assert_eq!(info.cryptoki_version, Version { major: 2, minor: 40 });
    assert_eq!(info.library_version.to_string(), "1.2");
    assert_eq!(module.lib_name(), "soft");
    assert_eq!(module.lib_file(), Path::new("soft-token.so"));
}

#[test]
fn lib_name_defaults_to_the_path() {
    log_init();
    let token = Arc::new(SoftToken::new());
    let module = Module::from_api(token, "/opt/hsm/libtoken.so", None).unwrap();
    assert_eq!(module.lib_name(), "/opt/hsm/libtoken.so");
    assert!(!module.is_initialized());
}

#[test]
fn info_is_fetched_on_initialize_when_refused_at_load() {
    log_init();
    let token = Arc::new(SoftToken::new());
    token.require_init_for_info();
    let mut module = Module::from_api(token.clone(), "soft-token.so", None).unwrap();
    assert!(module.info().is_none());
    assert_eq!(token.calls("GetInfo"), 1);

    module.initialize().unwrap();
    assert_eq!(module.info().unwrap().manufacturer_id, MANUFACTURER);
    assert_eq!(token.calls("GetInfo"), 2);
}

#[test]
fn get_info_failure_is_reported() {
    log_init();
    let token = Arc::new(SoftToken::new());
    token.fail_next("GetInfo", CKR_GENERAL_ERROR);
    let err = Module::from_api(token, "soft-token.so", None).unwrap_err();
    assert_eq!(err.operation(), Some("GetInfo"));
    assert_eq!(err.rv(), Some(CKR_GENERAL_ERROR));
    assert!(err.to_string().contains("CKR_GENERAL_ERROR"), "{err}");
}

#[test]
fn module_debug_shows_the_library() {
    let (_token, module) = soft_module();
    let debug = format!("{module:?}");
    assert!(debug.starts_with("Module {"), "{debug}");
    assert!(debug.contains("lib_name: \"soft\""), "{debug}");
    assert!(debug.contains("initialized: true"), "{debug}");
}

#[test]
fn double_initialize_surfaces_provider_status() {
    let (token, mut module) = soft_module();
    let err = module.initialize().unwrap_err();
    assert!(matches!(
        err,
        BindingError::NativeCall {
            operation: "Initialize",
            status: CallStatus::Rv(CKR_CRYPTOKI_ALREADY_INITIALIZED),
        }
    ));
    assert!(module.is_initialized());
    assert_eq!(token.calls("Initialize"), 2);
}

#[test]
fn initialize_passes_locking_arguments() {
    log_init();
    let token = Arc::new(SoftToken::new());
    let mut module = Module::from_api(token.clone(), "soft-token.so", None).unwrap();
    module
        .initialize_with(InitArgs {
            os_locking_ok: false,
        })
        .unwrap();
    assert_eq!(token.last_init_args(), Some(false));
}

#[test]
fn drop_finalizes_an_initialized_module() {
    let (token, module) = soft_module();
    assert!(token.is_initialized());
    drop(module);
    assert!(!token.is_initialized());
    assert_eq!(token.calls("Finalize"), 1);
}

#[test]
fn drop_after_finalize_does_not_finalize_again() {
    let (token, mut module) = soft_module();
    module.finalize().unwrap();
    assert!(!module.is_initialized());
    drop(module);
    assert_eq!(token.calls("Finalize"), 1);
}

#[test]
fn calls_before_initialize_fail_with_provider_status() {
    log_init();
    let token = Arc::new(SoftToken::new());
    let module = Module::from_api(token, "soft-token.so", None).unwrap();
    let err = module.get_slots(false).unwrap_err();
    assert_eq!(err.rv(), Some(CKR_CRYPTOKI_NOT_INITIALIZED));
    assert_eq!(err.operation(), Some("GetSlotList"));
}

#[test]
fn slots_are_listed_in_two_phases() {
    let (token, module) = soft_module();
    let all = module.get_slots(false).unwrap();
    assert_eq!(all.ids(), &[1, 2, 5]);
    assert_eq!(token.calls("GetSlotList"), 2);

    let with_token = module.get_slots(true).unwrap();
    assert_eq!(with_token.ids(), &[1, 5]);
    assert_eq!(with_token.len(), 2);
    assert_eq!(with_token.get(1).unwrap().id(), 5);
    assert!(with_token.get(2).is_none());
    assert!(with_token.find(2).is_none());
    assert_eq!(
        with_token.iter().map(|slot| slot.id()).collect::<Vec<_>>(),
        vec![1, 5]
    );
    assert_eq!(token.calls("GetSlotList"), 4);
}

#[test]
fn no_slot_means_a_single_call() {
    log_init();
    let token = Arc::new(SoftToken::with_slots(Vec::new()));
    let mut module = Module::from_api(token.clone(), "soft-token.so", None).unwrap();
    module.initialize().unwrap();
    let slots = module.get_slots(false).unwrap();
    assert!(slots.is_empty());
    assert_eq!(token.calls("GetSlotList"), 1);
}

#[test]
fn slot_list_is_truncated_to_the_filled_count() {
    let (token, module) = soft_module();
    token.report_slot_count(3);
    let slots = module.get_slots(true).unwrap();
    assert_eq!(slots.ids(), &[1, 5]);
}

#[test]
fn growing_slot_list_surfaces_buffer_too_small() {
    let (token, module) = soft_module();
    token.report_slot_count(1);
    let err = module.get_slots(true).unwrap_err();
    assert_eq!(err.operation(), Some("GetSlotList"));
    assert_eq!(err.rv(), Some(CKR_BUFFER_TOO_SMALL));
}

#[test]
fn unrepresentable_slot_count_is_an_invalid_length() {
    let (token, module) = soft_module();
    token.report_slot_count(CK_ULONG::MAX);
    let err = module.get_slots(false).unwrap_err();
    assert!(matches!(
        err,
        BindingError::NativeCall {
            operation: "GetSlotList",
            status: CallStatus::InvalidLength,
        }
    ));
    assert_eq!(err.rv(), None);
    assert_eq!(token.calls("GetSlotList"), 1);
}

#[test]
fn slot_list_fill_failure_is_reported() {
    let (token, module) = soft_module();
    token.fail_after("GetSlotList", 1, CKR_DEVICE_ERROR);
    let err = module.get_slots(false).unwrap_err();
    assert_eq!(err.rv(), Some(CKR_DEVICE_ERROR));
    assert_eq!(token.calls("GetSlotList"), 2);
}

#[test]
fn slot_info_is_trimmed() {
    let (_token, module) = soft_module();
    let slots = module.get_slots(false).unwrap();
    let info = slots.get(0).unwrap().get_info().unwrap();
    assert_eq!(info.slot_description, "Soft Slot 1");
    assert_eq!(info.manufacturer_id, MANUFACTURER);
    assert!(info.is_token_present());
    assert!(info.is_removable_device());
    assert!(!info.is_hardware_slot());

    let empty = slots.find(2).unwrap().get_info().unwrap();
    assert!(!empty.is_token_present());
}

#[test]
fn sessions_need_a_token() {
    let (_token, module) = soft_module();
    let slot = module.get_slots(false).unwrap().find(2).unwrap();
    let err = slot.open_session(false).unwrap_err();
    assert_eq!(err.rv(), Some(CKR_TOKEN_NOT_PRESENT));
    assert_eq!(rv_name(CKR_TOKEN_NOT_PRESENT), "CKR_TOKEN_NOT_PRESENT");
}

#[test]
fn session_lifecycle() {
    let (token, module) = soft_module();
    let slot = module.get_slots(true).unwrap().get(0).unwrap();
    let mut session = slot.open_session(false).unwrap();
    assert_eq!(session.slot_id(), 1);
    assert_eq!(token.open_sessions(), 1);

    let err = session.login("0000").unwrap_err();
    assert_eq!(err.rv(), Some(CKR_PIN_INCORRECT));
    assert!(!session.is_logged_in());

    session.login(USER_PIN).unwrap();
    assert!(session.is_logged_in());
    // the token already knows the user: accepted
    session.login(USER_PIN).unwrap();

    drop(session);
    assert_eq!(token.calls("Logout"), 1);
    assert_eq!(token.calls("CloseSession"), 1);
    assert_eq!(token.open_sessions(), 0);
}

#[test]
fn closed_session_rejects_calls() {
    let (token, module) = soft_module();
    let mut session = soft_session(&module);
    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(token.calls("CloseSession"), 1);
    assert!(matches!(
        session.generate_random(8),
        Err(BindingError::Usage(_))
    ));
    assert_eq!(token.calls("GenerateRandom"), 0);
}

#[test]
fn aes_key_template() {
    let (token, module) = soft_module();
    let session = soft_session(&module);
    let key = session
        .generate_aes_key(b"label", AesKeySize::Aes256, true)
        .unwrap();
    assert!(key.handle() > 0);
    let template = token.last_template();
    assert!(template.contains(&Attribute::ulong(CKA_VALUE_LEN, 32)));
    assert!(template.contains(&Attribute::bool(CKA_SENSITIVE, true)));
    assert!(template.contains(&Attribute::bool(CKA_EXTRACTABLE, false)));
}

#[test]
fn random_bytes_have_the_requested_length() {
    let (_token, module) = soft_module();
    let session = soft_session(&module);
    assert_eq!(session.generate_random(33).unwrap().len(), 33);
    assert!(session.generate_random(0).unwrap().is_empty());
}
