//! Pure decision logic: does a task queue's stored requirement set accept
//! a given resource capability description? Nothing here mutates state or
//! fails; absent queue-side data is permissive by design.

use std::collections::BTreeSet;

use crate::types::{DimensionFilter, MatchRequest, QueueFilter, TaskQueueDefinition};

/// Decide whether a queue is compatible with a match request. All
/// dimensions are conjunctive. `check_owner` is false for job-sharing
/// groups, where any owner may match any other owner's queues.
pub fn matches(def: &TaskQueueDefinition, req: &MatchRequest, check_owner: bool) -> bool {
    if check_owner && def.owner != req.owner {
        return false;
    }
    if def.owner_group != req.owner_group {
        return false;
    }
    if def.cpu_time > req.cpu_time {
        return false;
    }

    if !membership_matches(&def.sites, &req.sites) {
        return false;
    }
    if !membership_matches(&def.grid_ces, &req.grid_ces) {
        return false;
    }
    if !membership_matches(&def.platforms, &req.platforms) {
        return false;
    }
    if !membership_matches(&def.job_types, &req.job_types) {
        return false;
    }

    if !tags_match(&def.tags, &req.tags) {
        return false;
    }
    if !required_tags_match(&req.required_tags, &req.tags) {
        return false;
    }

    if banned_hits(&def.sites, &req.banned_sites) {
        return false;
    }
    if banned_hits(&def.grid_ces, &req.banned_grid_ces) {
        return false;
    }

    true
}

/// True when no filter in the list excludes the queue.
pub fn passes_filters(def: &TaskQueueDefinition, filters: &[QueueFilter]) -> bool {
    !filters.iter().any(|f| filter_excludes(def, f))
}

/// Plain multi-value rule: an empty queue-side set means "no requirement";
/// otherwise at least one offered value must be declared by the queue.
fn membership_matches(declared: &BTreeSet<String>, filter: &DimensionFilter) -> bool {
    if declared.is_empty() {
        return true;
    }
    match filter {
        DimensionFilter::Unfiltered => true,
        DimensionFilter::Values(offered) => offered.iter().any(|v| declared.contains(v)),
    }
}

/// Tag rule: every tag the queue demands must be among the offered tags.
fn tags_match(declared: &BTreeSet<String>, filter: &DimensionFilter) -> bool {
    if declared.is_empty() {
        return true;
    }
    match filter {
        DimensionFilter::Unfiltered => true,
        DimensionFilter::Values(offered) => declared.iter().all(|t| offered.contains(t)),
    }
}

/// Required tags must be a subset of the offered tags. An unfiltered tag
/// dimension offers everything.
fn required_tags_match(required: &[String], offered: &DimensionFilter) -> bool {
    if required.is_empty() {
        return true;
    }
    match offered {
        DimensionFilter::Unfiltered => true,
        DimensionFilter::Values(offered) => required.iter().all(|t| offered.contains(t)),
    }
}

fn banned_hits(declared: &BTreeSet<String>, banned: &[String]) -> bool {
    banned.iter().any(|b| declared.contains(b))
}

/// A filter excludes a queue only if every field it carries matches the
/// queue's stored values. An empty filter excludes nothing.
fn filter_excludes(def: &TaskQueueDefinition, filter: &QueueFilter) -> bool {
    if filter.is_empty() {
        return false;
    }
    if let Some(owner) = &filter.owner {
        if def.owner != *owner {
            return false;
        }
    }
    if let Some(group) = &filter.owner_group {
        if def.owner_group != *group {
            return false;
        }
    }
    if let Some(cpu_time) = filter.cpu_time {
        if def.cpu_time != cpu_time {
            return false;
        }
    }
    contains_all(&def.sites, &filter.sites)
        && contains_all(&def.grid_ces, &filter.grid_ces)
        && contains_all(&def.platforms, &filter.platforms)
        && contains_all(&def.job_types, &filter.job_types)
        && contains_all(&def.tags, &filter.tags)
}

fn contains_all(declared: &BTreeSet<String>, values: &[String]) -> bool {
    values.iter().all(|v| declared.contains(v))
}
