//! Bundle types the aggregator accepts and how each is scheduled.

use std::sync::Arc;

use hubstat_services::{BundleHandler, ConflationManager, Registration, RegistrationError};

/// (bundle type, priority, dependency). Dependencies come first.
const COMPLETE_BUNDLES: &[(&str, u32, Option<&str>)] = &[
    ("ControlInfo", 0, None),
    ("ManagedClusters", 1, None),
    ("Policies", 2, None),
    ("ClustersPerPolicy", 3, None),
    ("CompleteCompliance", 4, Some("ClustersPerPolicy")),
    ("MinimalCompliance", 6, None),
    ("Placements", 7, None),
    ("PlacementRules", 7, None),
    ("PlacementDecisions", 8, None),
    ("SubscriptionStatuses", 9, None),
    ("LocalPolicies", 10, None),
];

/// Register every standard bundle type with `handler`.
pub fn register_all(
    manager: &mut ConflationManager,
    handler: Arc<dyn BundleHandler>,
) -> Result<(), RegistrationError> {
    for (bundle_type, priority, depends_on) in COMPLETE_BUNDLES {
        let mut registration = Registration::new(*bundle_type, *priority, handler.clone());
        if let Some(dep) = depends_on {
            registration = registration.depends_on(*dep);
        }
        manager.register(registration)?;
    }
    // Per-cluster compliance changes, applied on top of the last complete
    // snapshot.
    manager.register(
        Registration::new("DeltaCompliance", 5, handler)
            .depends_on("CompleteCompliance")
            .delta(Some("cluster")),
    )?;
    Ok(())
}
