use serde::Serialize;
use tracing::debug;

use crate::crd::{Cron, CONSOLE_USER_LABEL};
use crate::store::{cron_state, CronRecord};
use crate::Result;

#[derive(Debug, Serialize)]
struct ActiveEntry<'a> {
    name: &'a str,
    namespace: &'a str,
    uid: &'a str,
}

pub fn convert(cron: &Cron, region: &str) -> Result<CronRecord> {
    let meta = &cron.metadata;
    let spec = &cron.spec;
    let status = cron.status.clone().unwrap_or_default();
    debug!(
        "Converting cron {}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    );

    let active: Vec<ActiveEntry> = status
        .active
        .iter()
        .map(|a| ActiveEntry {
            name: a.name.as_deref().unwrap_or_default(),
            namespace: a.namespace.as_deref().unwrap_or_default(),
            uid: a.uid.as_deref().unwrap_or_default(),
        })
        .collect();

    let suspended = spec.suspend == Some(true);

    Ok(CronRecord {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        uid: meta.uid.clone().unwrap_or_default(),
        kind: spec.cron_template.kind.clone().unwrap_or_default(),
        status: if suspended { cron_state::SUSPEND } else { cron_state::RUNNING }.to_string(),
        region_id: (!region.is_empty()).then(|| region.to_string()),
        schedule: spec.schedule.clone(),
        concurrency_policy: spec.concurrency_policy.clone().unwrap_or_default(),
        active: serde_json::to_string(&active)?,
        history: serde_json::to_string(&status.history)?,
        history_limit: spec.history_limit,
        is_in_k8s: true,
        is_deleted: Some(0),
        suspend: spec.suspend.map(|s| s as i8),
        deadline: spec.deadline.as_ref().map(|t| t.0),
        user_id: meta
            .labels
            .as_ref()
            .and_then(|l| l.get(CONSOLE_USER_LABEL))
            .cloned(),
        last_schedule_time: status.last_schedule_time.as_ref().map(|t| t.0),
        gmt_created: meta.creation_timestamp.as_ref().map(|t| t.0),
        ..Default::default()
    })
}
