use crate::CoreError;
use dsk_store::{FileSystem, LockGuard, StateLayout};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Single-writer lock on one product's state directory.
///
/// [`crate::Engine`] takes it for the whole of an apply, resume or rollback,
/// so two writers for the same product can never interleave journal entries.
/// A second writer is refused instead of waiting.
#[derive(Debug)]
pub struct InstallLock {
    product_id: String,
    _guard: LockGuard,
}

impl InstallLock {
    pub fn try_acquire(
        fs: &dyn FileSystem,
        layout: &StateLayout,
        product_id: &str,
    ) -> Result<Self, CoreError> {
        fs.make_dir(layout.dir())?;
        let lock_file = layout.lock_file();
        match fs.try_lock(&lock_file)? {
            Some(guard) => {
                debug!("install lock for '{product_id}' taken");
                Ok(Self {
                    product_id: product_id.to_owned(),
                    _guard: guard,
                })
            }
            None => Err(CoreError::Locked(product_id.to_owned())),
        }
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C asks the engine to stop at the next step boundary; a second
/// one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(130);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, stopping after the current step...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
