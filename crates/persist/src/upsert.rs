//! Version-gated upsert decisions.
//!
//! Watch notifications arrive at least once and in no particular order. The
//! decision below only depends on the stored record and the incoming one, so
//! applying it repeatedly or out of order converges on the newest version.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::store::{job_state, JobRecord, PodRecord};
use crate::{Error, Result};

/// Record kinds that carry a cluster resource version.
pub trait Versioned: Clone {
    fn resource_version(&self) -> &str;

    /// Human readable identity used in logs.
    fn identity(&self) -> String;

    fn is_terminal(&self) -> bool;

    /// Status and deletion flag match.
    fn same_state(&self, other: &Self) -> bool;

    fn keep_status(&mut self, old: &Self);

    /// Copies timestamps that are set on `old` and unset on `self`.
    fn carry_timestamps(&mut self, old: &Self);

    fn prepare_insert(&mut self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision<R> {
    Insert(R),
    Update(R),
    /// Same state is already stored.
    Skip,
    /// Older than the stored record.
    Discard,
}

pub fn parse_version(version: &str) -> Result<u64> {
    version
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::VersionParse(format!("{:?}: {}", version, e)))
}

pub fn decide<R: Versioned>(old: Option<&R>, mut new: R) -> Result<Decision<R>> {
    let old = match old {
        None => {
            new.prepare_insert();
            return Ok(Decision::Insert(new));
        }
        Some(old) => old,
    };

    let old_version = parse_version(old.resource_version())?;
    let new_version = parse_version(new.resource_version())?;

    if old_version > new_version {
        warn!(
            "Discarding stale update of {}: stored version {} is newer than {}",
            new.identity(),
            old_version,
            new_version
        );
        return Ok(Decision::Discard);
    }

    if old.is_terminal() && !new.is_terminal() {
        new.keep_status(old);
    }
    new.carry_timestamps(old);

    if old_version == new_version && old.same_state(&new) {
        return Ok(Decision::Skip);
    }

    Ok(Decision::Update(new))
}

fn keep<T: Copy>(new: &mut Option<T>, old: Option<T>) {
    if new.is_none() {
        *new = old;
    }
}

impl Versioned for JobRecord {
    fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn identity(&self) -> String {
        format!("{} {}/{}", self.kind, self.namespace, self.name)
    }

    fn is_terminal(&self) -> bool {
        job_state::is_terminal(&self.status)
    }

    fn same_state(&self, other: &Self) -> bool {
        self.status == other.status && self.is_deleted == other.is_deleted
    }

    fn keep_status(&mut self, old: &Self) {
        self.status = old.status.clone();
        self.reason_code = old.reason_code.clone();
        self.reason = old.reason.clone();
    }

    fn carry_timestamps(&mut self, old: &Self) {
        keep(&mut self.gmt_job_submitted, old.gmt_job_submitted);
        keep(&mut self.gmt_job_running, old.gmt_job_running);
        keep(&mut self.gmt_job_stopped, old.gmt_job_stopped);
        // Finished is written once.
        if old.gmt_job_finished.is_some() {
            self.gmt_job_finished = old.gmt_job_finished;
        }
    }

    fn prepare_insert(&mut self) {
        if self.gmt_job_submitted.is_none() {
            self.gmt_job_submitted = self.gmt_created;
        }
    }
}

impl Versioned for PodRecord {
    fn resource_version(&self) -> &str {
        &self.resource_version
    }

    fn identity(&self) -> String {
        format!("pod {}/{}", self.namespace, self.name)
    }

    fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn same_state(&self, other: &Self) -> bool {
        self.status == other.status
            && self.gmt_pod_running == other.gmt_pod_running
            && self.gmt_pod_finished == other.gmt_pod_finished
    }

    fn keep_status(&mut self, old: &Self) {
        self.status = old.status;
        self.extended = old.extended.clone();
    }

    fn carry_timestamps(&mut self, old: &Self) {
        keep(&mut self.gmt_pod_running, old.gmt_pod_running);
        if old.gmt_pod_finished.is_some() {
            self.gmt_pod_finished = old.gmt_pod_finished;
        }
    }
}

/// Sets `slot` to `now` unless it already holds a value.
pub fn set_once(slot: &mut Option<DateTime<Utc>>, now: DateTime<Utc>) {
    if slot.is_none() {
        *slot = Some(now);
    }
}
