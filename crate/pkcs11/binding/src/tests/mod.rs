#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;

use crate::{Module, Session};

mod module_tests;

use soft_token::{SoftToken, USER_PIN};

static LOG_INIT: Once = Once::new();

/// Install a test subscriber filtered by `RUST_LOG`.
pub(crate) fn log_init() {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// An initialized module over a fresh soft token
pub(crate) fn soft_module() -> (Arc<SoftToken>, Module) {
    log_init();
    let token = Arc::new(SoftToken::new());
    let mut module = Module::from_api(token.clone(), "soft-token.so", Some("soft")).unwrap();
    module.initialize().unwrap();
    (token, module)
}

/// A logged in read/write session on the first slot holding a token
pub(crate) fn soft_session(module: &Module) -> Session {
    let slot = module.get_slots(true).unwrap().get(0).unwrap();
    let mut session = slot.open_session(true).unwrap();
    session.login(USER_PIN).unwrap();
    session
}
