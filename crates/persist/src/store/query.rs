use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// 1-based page number
    pub page_num: i64,
    pub page_size: i64,
}

impl Pagination {
    pub fn new(page_num: i64, page_size: i64) -> Self {
        Self { page_num, page_size }
    }

    pub fn offset(&self) -> i64 {
        (self.page_num.max(1) - 1) * self.page_size
    }
}

/// One page of results together with the number of rows matching the query.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub job_id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub allocated_namespaces: Vec<String>,
    pub kind: Option<String>,
    pub region_id: Option<String>,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub deleted: Option<i32>,
    pub is_cron: bool,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct CronQuery {
    pub cron_id: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub allocated_namespaces: Vec<String>,
    pub kind: Option<String>,
    pub region_id: Option<String>,
    pub status: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub deleted: Option<i32>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct EvaluateJobQuery {
    pub allocated_namespaces: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelQuery {
    pub model_name: Option<String>,
    pub model_version: Option<String>,
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Default)]
pub struct NotebookQuery {
    pub namespace: Option<String>,
    pub user_name: Option<String>,
    pub user_id: Option<String>,
}
