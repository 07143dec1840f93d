use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TqError};

pub type JobId = u64;
pub type TqId = u64;

/// Returns true for the wildcard token that disables filtering on a
/// dimension. The comparison ignores case and punctuation, so "any",
/// "Any" and "ANY " all count.
pub fn is_wildcard(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    normalized == "any"
}

/// The full requirement tuple of a task queue. Equality of this struct is
/// the structural identity used to deduplicate queues at enqueue time and
/// to re-merge near-duplicates during priority recalculation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskQueueDefinition {
    pub owner: String,
    pub owner_group: String,
    pub vo: String,
    /// Quantized CPU-time bucket, in seconds.
    pub cpu_time: i64,
    pub sites: BTreeSet<String>,
    pub grid_ces: BTreeSet<String>,
    pub banned_sites: BTreeSet<String>,
    pub platforms: BTreeSet<String>,
    pub job_types: BTreeSet<String>,
    pub tags: BTreeSet<String>,
}

/// A job's scheduling requirements as submitted for enqueueing. CPU time
/// is raw seconds here; it is quantized when the definition is derived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub owner: String,
    pub owner_group: String,
    pub cpu_time: i64,
    pub priority: i64,
    pub sites: Vec<String>,
    pub grid_ces: Vec<String>,
    pub banned_sites: Vec<String>,
    pub platforms: Vec<String>,
    pub job_types: Vec<String>,
    pub tags: Vec<String>,
}

impl JobDescription {
    pub fn new(owner: impl Into<String>, owner_group: impl Into<String>, cpu_time: i64) -> Self {
        Self {
            owner: owner.into(),
            owner_group: owner_group.into(),
            cpu_time,
            priority: 1,
            sites: Vec::new(),
            grid_ces: Vec::new(),
            banned_sites: Vec::new(),
            platforms: Vec::new(),
            job_types: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sites<I: IntoIterator<Item = S>, S: Into<String>>(mut self, sites: I) -> Self {
        self.sites = sites.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_grid_ces<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ces: I) -> Self {
        self.grid_ces = ces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_banned_sites<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        sites: I,
    ) -> Self {
        self.banned_sites = sites.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_platforms<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        platforms: I,
    ) -> Self {
        self.platforms = platforms.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_job_types<I: IntoIterator<Item = S>, S: Into<String>>(mut self, types: I) -> Self {
        self.job_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Shape check for an enqueue request. Errors name the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(TqError::invalid("Owner", "must not be empty"));
        }
        if self.owner_group.trim().is_empty() {
            return Err(TqError::invalid("OwnerGroup", "must not be empty"));
        }
        if self.cpu_time < 0 {
            return Err(TqError::invalid("CPUTime", "must not be negative"));
        }
        for (field, values) in [
            ("Sites", &self.sites),
            ("GridCEs", &self.grid_ces),
            ("BannedSites", &self.banned_sites),
            ("Platforms", &self.platforms),
            ("JobTypes", &self.job_types),
            ("Tags", &self.tags),
        ] {
            if values.iter().any(|v| v.trim().is_empty()) {
                return Err(TqError::invalid(field, "contains an empty value"));
            }
        }
        Ok(())
    }

    /// Derive the structural identity of the queue this job belongs in.
    /// Duplicate list entries collapse into the ordered sets here.
    pub(crate) fn to_definition(&self, vo: String, cpu_time_bucket: i64) -> TaskQueueDefinition {
        TaskQueueDefinition {
            owner: self.owner.clone(),
            owner_group: self.owner_group.clone(),
            vo,
            cpu_time: cpu_time_bucket,
            sites: self.sites.iter().cloned().collect(),
            grid_ces: self.grid_ces.iter().cloned().collect(),
            banned_sites: self.banned_sites.iter().cloned().collect(),
            platforms: self.platforms.iter().cloned().collect(),
            job_types: self.job_types.iter().cloned().collect(),
            tags: self.tags.iter().cloned().collect(),
        }
    }
}

/// Request-side filter for one multi-value dimension, resolved at
/// construction time. `Unfiltered` covers both an absent field and the
/// `any` wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimensionFilter {
    #[default]
    Unfiltered,
    Values(Vec<String>),
}

impl DimensionFilter {
    /// An empty list or any wildcard entry disables the filter.
    pub fn from_values<I: IntoIterator<Item = S>, S: Into<String>>(values: I) -> Self {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() || values.iter().any(|v| is_wildcard(v)) {
            DimensionFilter::Unfiltered
        } else {
            DimensionFilter::Values(values)
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        matches!(self, DimensionFilter::Unfiltered)
    }
}

/// A transient description of a resource's capabilities submitted for
/// matching. Owner, OwnerGroup and CPUTime are mandatory; everything else
/// defaults to "no constraint".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    pub owner: String,
    pub owner_group: String,
    /// CPU-time ceiling the resource offers, in seconds.
    pub cpu_time: i64,
    /// Administrative pin: match only this job, bypassing attribute
    /// matching and the capacity-bounded candidate selection.
    pub job_id: Option<JobId>,
    pub sites: DimensionFilter,
    pub grid_ces: DimensionFilter,
    pub platforms: DimensionFilter,
    pub job_types: DimensionFilter,
    pub tags: DimensionFilter,
    /// Extra request-side guard: every required tag must be among the
    /// offered tags. Wildcard entries disable the guard.
    pub required_tags: Vec<String>,
    pub banned_sites: Vec<String>,
    pub banned_grid_ces: Vec<String>,
}

impl MatchRequest {
    pub fn new(owner: impl Into<String>, owner_group: impl Into<String>, cpu_time: i64) -> Self {
        Self {
            owner: owner.into(),
            owner_group: owner_group.into(),
            cpu_time,
            job_id: None,
            sites: DimensionFilter::Unfiltered,
            grid_ces: DimensionFilter::Unfiltered,
            platforms: DimensionFilter::Unfiltered,
            job_types: DimensionFilter::Unfiltered,
            tags: DimensionFilter::Unfiltered,
            required_tags: Vec::new(),
            banned_sites: Vec::new(),
            banned_grid_ces: Vec::new(),
        }
    }

    pub fn for_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_sites<I: IntoIterator<Item = S>, S: Into<String>>(mut self, sites: I) -> Self {
        self.sites = DimensionFilter::from_values(sites);
        self
    }

    pub fn with_grid_ces<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ces: I) -> Self {
        self.grid_ces = DimensionFilter::from_values(ces);
        self
    }

    pub fn with_platforms<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        platforms: I,
    ) -> Self {
        self.platforms = DimensionFilter::from_values(platforms);
        self
    }

    pub fn with_job_types<I: IntoIterator<Item = S>, S: Into<String>>(mut self, types: I) -> Self {
        self.job_types = DimensionFilter::from_values(types);
        self
    }

    pub fn with_tags<I: IntoIterator<Item = S>, S: Into<String>>(mut self, tags: I) -> Self {
        self.tags = DimensionFilter::from_values(tags);
        self
    }

    pub fn with_required_tags<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        tags: I,
    ) -> Self {
        self.required_tags = normalize_banned(tags);
        self
    }

    pub fn with_banned_sites<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        sites: I,
    ) -> Self {
        self.banned_sites = normalize_banned(sites);
        self
    }

    pub fn with_banned_grid_ces<I: IntoIterator<Item = S>, S: Into<String>>(
        mut self,
        ces: I,
    ) -> Self {
        self.banned_grid_ces = normalize_banned(ces);
        self
    }

    /// Mandatory-field check. A request failing here is rejected before
    /// any queue is examined.
    pub fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            return Err(TqError::invalid("Owner", "is mandatory for matching"));
        }
        if self.owner_group.trim().is_empty() {
            return Err(TqError::invalid("OwnerGroup", "is mandatory for matching"));
        }
        if self.cpu_time <= 0 {
            return Err(TqError::invalid("CPUTime", "must be a positive ceiling"));
        }
        Ok(())
    }
}

/// A wildcard among banned or required values disables the whole guard.
fn normalize_banned<I: IntoIterator<Item = S>, S: Into<String>>(values: I) -> Vec<String> {
    let values: Vec<String> = values.into_iter().map(Into::into).collect();
    if values.iter().any(|v| is_wildcard(v)) {
        Vec::new()
    } else {
        values
    }
}

/// One negative condition used to exclude previously-tried queues within a
/// matching session. A queue is excluded when every present field matches
/// its stored values; a list of filters is OR'd together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueFilter {
    pub owner: Option<String>,
    pub owner_group: Option<String>,
    pub cpu_time: Option<i64>,
    pub sites: Vec<String>,
    pub grid_ces: Vec<String>,
    pub platforms: Vec<String>,
    pub job_types: Vec<String>,
    pub tags: Vec<String>,
}

impl QueueFilter {
    pub fn is_empty(&self) -> bool {
        self.owner.is_none()
            && self.owner_group.is_none()
            && self.cpu_time.is_none()
            && self.sites.is_empty()
            && self.grid_ces.is_empty()
            && self.platforms.is_empty()
            && self.job_types.is_empty()
            && self.tags.is_empty()
    }
}

/// A successfully popped job: removed from its queue and owned by the
/// caller from this point on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoppedJob {
    pub job_id: JobId,
    pub tq_id: TqId,
}

/// Terminal outcomes of a match call. Retry exhaustion under contention is
/// reported separately, as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(PoppedJob),
    NoMatch,
}

/// What an orphan sweep actually removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub queues_removed: usize,
    pub orphan_jobs_removed: usize,
}

/// Read-only view of one task queue, for monitoring callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueSummary {
    pub tq_id: TqId,
    pub definition: TaskQueueDefinition,
    pub priority: f64,
    pub enabled: i64,
    pub job_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_detection() {
        assert!(is_wildcard("any"));
        assert!(is_wildcard("Any"));
        assert!(is_wildcard("ANY"));
        assert!(is_wildcard("\"any\""));
        assert!(!is_wildcard("anywhere"));
        assert!(!is_wildcard("CERN"));
    }

    #[test]
    fn dimension_filter_wildcard_disables() {
        assert!(DimensionFilter::from_values(["any"]).is_unfiltered());
        assert!(DimensionFilter::from_values(["CERN", "Any"]).is_unfiltered());
        assert!(DimensionFilter::from_values(Vec::<String>::new()).is_unfiltered());
        assert_eq!(
            DimensionFilter::from_values(["CERN"]),
            DimensionFilter::Values(vec!["CERN".to_string()])
        );
    }

    #[test]
    fn job_description_validation() {
        let ok = JobDescription::new("alice", "g1", 100);
        assert!(ok.validate().is_ok());

        let no_owner = JobDescription::new("", "g1", 100);
        let err = no_owner.validate().unwrap_err();
        assert!(err.to_string().contains("Owner"));

        let bad_cpu = JobDescription::new("alice", "g1", -1);
        let err = bad_cpu.validate().unwrap_err();
        assert!(err.to_string().contains("CPUTime"));

        let empty_site = JobDescription::new("alice", "g1", 100).with_sites([""]);
        let err = empty_site.validate().unwrap_err();
        assert!(err.to_string().contains("Sites"));
    }

    #[test]
    fn match_request_validation() {
        assert!(MatchRequest::new("alice", "g1", 100).validate().is_ok());
        assert!(MatchRequest::new("", "g1", 100).validate().is_err());
        assert!(MatchRequest::new("alice", "", 100).validate().is_err());
        assert!(MatchRequest::new("alice", "g1", 0).validate().is_err());
    }

    #[test]
    fn banned_wildcard_disables_guard() {
        let req = MatchRequest::new("alice", "g1", 100).with_banned_sites(["any"]);
        assert!(req.banned_sites.is_empty());
    }

    #[test]
    fn definition_collapses_duplicates() {
        let desc = JobDescription::new("alice", "g1", 100).with_sites(["CERN", "CERN", "IN2P3"]);
        let def = desc.to_definition("g1".to_string(), 360);
        assert_eq!(def.sites.len(), 2);
        assert_eq!(def.cpu_time, 360);
    }
}
