//! Process-wide vindex factory registry.
//!
//! Factories register once at initialization, keyed by lowercase name. The
//! registry freezes at the first lookup: late registrations are rejected so a
//! plugin loaded after planning has started cannot change routing behavior
//! mid-flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, OnceLock, RwLock};

use kmx_common::{KmxError, Result};

use crate::binary::Binary;
use crate::vindex::Vindex;

/// Factory signature: `(instance name, params) -> vindex`.
///
/// Factories must preserve unknown parameter names for diagnostics.
pub type VindexFactory =
    fn(name: &str, params: &HashMap<String, String>) -> Result<std::sync::Arc<dyn Vindex>>;

struct Registry {
    factories: RwLock<HashMap<String, VindexFactory>>,
    frozen: AtomicBool,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static BUILTINS: Once = Once::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        factories: RwLock::new(HashMap::new()),
        frozen: AtomicBool::new(false),
    })
}

/// Register a vindex factory under `vindex_type` (lowercased).
///
/// Fails once the registry has served a lookup, and on duplicate names.
pub fn register(vindex_type: &str, factory: VindexFactory) -> Result<()> {
    let reg = registry();
    if reg.frozen.load(Ordering::Acquire) {
        return Err(KmxError::InvalidConfig(format!(
            "vindex registry is frozen; cannot register {vindex_type:?}"
        )));
    }
    let mut factories = reg.factories.write().expect("vindex registry poisoned");
    let key = vindex_type.to_lowercase();
    if factories.contains_key(&key) {
        return Err(KmxError::InvalidConfig(format!(
            "vindex {key:?} is already registered"
        )));
    }
    factories.insert(key, factory);
    Ok(())
}

/// Instantiate a vindex of type `vindex_type` named `name`.
///
/// The first call freezes the registry against further registrations.
pub fn create_vindex(
    vindex_type: &str,
    name: &str,
    params: &HashMap<String, String>,
) -> Result<std::sync::Arc<dyn Vindex>> {
    ensure_builtins();
    let reg = registry();
    reg.frozen.store(true, Ordering::Release);
    let factories = reg.factories.read().expect("vindex registry poisoned");
    let factory = factories.get(&vindex_type.to_lowercase()).ok_or_else(|| {
        KmxError::InvalidConfig(format!("unknown vindex type: {vindex_type}"))
    })?;
    factory(name, params)
}

fn ensure_builtins() {
    BUILTINS.call_once(|| {
        // Registration can only fail on duplicates; builtins run first.
        let _ = register("binary", Binary::create);
    });
}

#[cfg(test)]
mod tests {
    use super::{create_vindex, register};
    use std::collections::HashMap;

    #[test]
    fn creates_builtin_binary() {
        let v = create_vindex("binary", "user_index", &HashMap::new()).expect("create");
        assert_eq!(v.name(), "user_index");
        assert!(v.as_hashing().is_some());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let v = create_vindex("BINARY", "b", &HashMap::new()).expect("create");
        assert!(v.is_unique());
    }

    #[test]
    fn unknown_type_is_an_error() {
        let err = create_vindex("consistent_lookup", "x", &HashMap::new()).expect_err("unknown");
        assert!(err.to_string().contains("unknown vindex type"), "{err}");
    }

    #[test]
    fn registration_after_first_lookup_is_rejected() {
        let _ = create_vindex("binary", "freeze_trigger", &HashMap::new());
        let err =
            register("late_vindex", crate::binary::Binary::create).expect_err("must be frozen");
        assert!(err.to_string().contains("frozen"), "{err}");
    }
}
