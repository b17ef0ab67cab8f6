//! PPT invariants for management code: checked assertions plus a contract log.
//!
//! Setup, the controller and garbage collection call [`assert_invariant`];
//! tests then ask [`contract_test`] whether the invariants they rely on were
//! actually exercised. The log sits behind a mutex, so nothing on the tick
//! path may call into this module.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::BTreeSet;
#[cfg(feature = "ppt")]
use std::sync::Mutex;

/// Engine configuration passed validation.
pub const CONFIG_VALID: u32 = 1;
/// Freshly allocated bus storage is silent.
pub const BUS_ZEROED: u32 = 2;
/// A newly allocated process handle is not already live.
pub const HANDLE_FRESH: u32 = 3;
/// A writer spawned with a bus declares that bus, or none.
pub const WRITER_BOUND_ON_ATTACH: u32 = 4;
/// Teardown only runs for processes the controller spawned and the engine detached.
pub const TEARDOWN_AFTER_DETACH: u32 = 5;
/// Output routes name an existing output channel and bus channel.
pub const ROUTE_IN_RANGE: u32 = 6;

/// Label for diagnostics.
pub const fn invariant_label(id: u32) -> &'static str {
    match id {
        CONFIG_VALID => "CONFIG_VALID",
        BUS_ZEROED => "BUS_ZEROED",
        HANDLE_FRESH => "HANDLE_FRESH",
        WRITER_BOUND_ON_ATTACH => "WRITER_BOUND_ON_ATTACH",
        TEARDOWN_AFTER_DETACH => "TEARDOWN_AFTER_DETACH",
        ROUTE_IN_RANGE => "ROUTE_IN_RANGE",
        _ => "UNKNOWN",
    }
}

fn failure(id: u32, message: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) => format!(
            "Invariant {} ({}) failed: {} (in {})",
            id,
            invariant_label(id),
            message,
            ctx
        ),
        None => format!("Invariant {} ({}) failed: {}", id, invariant_label(id), message),
    }
}

#[cfg(feature = "ppt")]
lazy_static! {
    static ref ENFORCED: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());
}

/// Check `condition`, record `id` as enforced, and panic with a labeled
/// message if it does not hold.
#[cfg(feature = "ppt")]
pub fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let text = failure(id, message, context);
        tracing::error!(invariant = id, "{}", text);
        panic!("{}", text);
    }
    if let Ok(mut enforced) = ENFORCED.lock() {
        enforced.insert(id);
    }
}

/// Check `condition` and panic with a labeled message if it does not hold.
#[cfg(not(feature = "ppt"))]
pub fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        panic!("{}", failure(id, message, context));
    }
}

/// Panic unless every id in `required` has been enforced at least once.
#[cfg(feature = "ppt")]
pub fn contract_test(test_name: &str, required: &[u32]) {
    let missing: Vec<&str> = match ENFORCED.lock() {
        Ok(enforced) => required
            .iter()
            .filter(|&&id| !enforced.contains(&id))
            .map(|&id| invariant_label(id))
            .collect(),
        // A poisoned log proves nothing.
        Err(_) => required.iter().map(|&id| invariant_label(id)).collect(),
    };
    if !missing.is_empty() {
        panic!(
            "Contract '{}' failed: invariants never enforced: {:?}",
            test_name, missing
        );
    }
}

/// No-op without the `ppt` feature.
#[cfg(not(feature = "ppt"))]
pub fn contract_test(_test_name: &str, _required: &[u32]) {}

/// Forget every enforced invariant.
#[cfg(feature = "ppt")]
pub fn clear_invariant_log() {
    if let Ok(mut enforced) = ENFORCED.lock() {
        enforced.clear();
    }
}

/// No-op without the `ppt` feature.
#[cfg(not(feature = "ppt"))]
pub fn clear_invariant_log() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holding_invariant_passes() {
        assert_invariant(ROUTE_IN_RANGE, true, "channel in range", Some("test"));
    }

    #[test]
    #[should_panic(expected = "Invariant 3 (HANDLE_FRESH) failed: reused (in test)")]
    fn broken_invariant_names_itself() {
        assert_invariant(HANDLE_FRESH, false, "reused", Some("test"));
    }

    #[test]
    fn bus_creation_enforces_silence() {
        let _bus = crate::bus::Bus::new(crate::bus::BusLayout::mono(8));
        contract_test("bus creation", &[BUS_ZEROED]);
    }

    #[test]
    fn unknown_ids_get_a_label() {
        assert_eq!(invariant_label(WRITER_BOUND_ON_ATTACH), "WRITER_BOUND_ON_ATTACH");
        assert_eq!(invariant_label(99), "UNKNOWN");
    }
}
