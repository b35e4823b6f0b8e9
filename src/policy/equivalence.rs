use super::EligibleTask;

/// Interchangeability of two eligible tasks for the purpose of sharing one
/// resource search: same owner, same priority and an identical rendered
/// selection-script set, with neither task in parallel mode and neither
/// demanding exclusive node access.
///
/// Scripts are compared after variable binding; two scripts differing only
/// in unbound references are not equivalent. The relation never merges task
/// identities, it only lets a pass reuse the outcome of a search.
pub fn tasks_equivalent(a: &EligibleTask, b: &EligibleTask) -> bool {
    a.owner == b.owner
        && a.priority == b.priority
        && a.rendered_scripts == b.rendered_scripts
        && !a.parallel
        && !b.parallel
        && !a.exclusive_node_access
        && !b.exclusive_node_access
}
