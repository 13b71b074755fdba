//! Query log and the aggregates built on it.
//!
//! Records are append-only in a sled tree keyed by a big-endian id from
//! `generate_id`, so iteration order is insertion order. Only the `clicked`
//! flag is ever rewritten.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::config::AnalyticsConfig;
use crate::error::AnalyticsError;
use crate::filter::AppliedFilters;
use crate::query::sanitize;

lazy_static! {
    static ref EMAIL: Regex =
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email pattern");
    /// Phone, card and account numbers: seven or more digits, optionally
    /// separated by single spaces, dots or dashes.
    static ref LONG_NUMBER: Regex = Regex::new(r"\+?\d(?:[\s.\-]?\d){6,}").expect("number pattern");
}

/// Ids are reserved before their record is written, so neighbouring ids may
/// carry slightly out-of-order timestamps.
const WRITE_SLACK: time::Duration = time::Duration::minutes(1);

/// Remove PII-shaped substrings from free text.
pub fn redact(text: &str) -> String {
    let without_email = EMAIL.replace_all(text, " ");
    LONG_NUMBER.replace_all(&without_email, " ").into_owned()
}

fn cap(value: Option<String>, max_chars: usize) -> Option<String> {
    value.map(|v| v.chars().take(max_chars).collect())
}

#[derive(Debug, Clone, Default)]
pub struct ClientMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// One executed search, as handed over by the planner.
#[derive(Debug, Clone)]
pub struct SearchEvent {
    /// Raw user input; redacted and sanitized before it is stored.
    pub query: String,
    pub results_count: usize,
    pub search_time_ms: u64,
    pub filters: AppliedFilters,
    pub client: ClientMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query: String,
    pub results_count: u64,
    pub search_time_ms: u64,
    pub filters_applied: AppliedFilters,
    pub clicked: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopularQuery {
    pub query: String,
    pub search_count: u64,
    pub avg_results: f64,
    pub click_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZeroResultQuery {
    pub query: String,
    pub search_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_searched: OffsetDateTime,
}

pub struct AnalyticsRecorder {
    db: sled::Db,
    records: sled::Tree,
    config: AnalyticsConfig,
    max_query_len: usize,
}

impl AnalyticsRecorder {
    pub fn open(path: &Path, config: AnalyticsConfig, max_query_len: usize) -> Result<Self, AnalyticsError> {
        let db = sled::open(path)?;
        Self::from_db(db, config, max_query_len)
    }

    pub fn temporary(config: AnalyticsConfig, max_query_len: usize) -> Result<Self, AnalyticsError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, config, max_query_len)
    }

    fn from_db(db: sled::Db, config: AnalyticsConfig, max_query_len: usize) -> Result<Self, AnalyticsError> {
        let records = db.open_tree("search_queries")?;
        Ok(Self { db, records, config, max_query_len })
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    /// Reserve the id for the next record, so it can be returned to the
    /// caller before the record is written.
    pub fn next_id(&self) -> Result<u64, AnalyticsError> {
        Ok(self.db.generate_id()?)
    }

    pub fn record(&self, id: u64, event: SearchEvent) -> Result<(), AnalyticsError> {
        let record = QueryRecord {
            query: sanitize(&redact(&event.query), self.max_query_len),
            results_count: event.results_count as u64,
            search_time_ms: event.search_time_ms,
            filters_applied: event.filters,
            clicked: false,
            ip_address: cap(event.client.ip_address, self.config.max_ip_len),
            user_agent: cap(event.client.user_agent, self.config.max_user_agent_len),
            created_at: OffsetDateTime::now_utc(),
        };
        self.records.insert(&id.to_be_bytes()[..], bincode::serialize(&record)?)?;
        debug!(id, query = %record.query, results = record.results_count, "search recorded");
        Ok(())
    }

    pub fn get(&self, id: u64) -> Result<Option<QueryRecord>, AnalyticsError> {
        match self.records.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Set `clicked` on a record inside the correlation window. Returns
    /// whether the flag was set.
    pub fn mark_clicked(&self, id: u64) -> Result<bool, AnalyticsError> {
        let Some(mut record) = self.get(id)? else {
            return Ok(false);
        };
        if OffsetDateTime::now_utc() - record.created_at > self.config.click_window() {
            return Ok(false);
        }
        if !record.clicked {
            record.clicked = true;
            self.records.insert(&id.to_be_bytes()[..], bincode::serialize(&record)?)?;
        }
        Ok(true)
    }

    /// Non-empty records created at or after `cutoff`, newest first. Ids
    /// grow with time, so the scan walks backwards and stops once records
    /// fall more than [`WRITE_SLACK`] behind the cutoff.
    fn records_since(&self, cutoff: OffsetDateTime) -> Result<Vec<QueryRecord>, AnalyticsError> {
        let stop = cutoff - WRITE_SLACK;
        let mut out = Vec::new();
        for entry in self.records.iter().rev() {
            let (_, bytes) = entry?;
            let record: QueryRecord = bincode::deserialize(&bytes)?;
            if record.created_at < stop {
                break;
            }
            if record.created_at >= cutoff && !record.query.is_empty() {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Queries that found something, most searched first.
    pub fn popular(&self, window: time::Duration, limit: usize) -> Result<Vec<PopularQuery>, AnalyticsError> {
        #[derive(Default)]
        struct Acc {
            count: u64,
            results: u64,
            clicks: u64,
        }
        let mut groups: HashMap<String, Acc> = HashMap::new();
        for r in self.records_since(OffsetDateTime::now_utc() - window)? {
            if r.results_count == 0 {
                continue;
            }
            let acc = groups.entry(r.query.to_lowercase()).or_default();
            acc.count += 1;
            acc.results += r.results_count;
            acc.clicks += u64::from(r.clicked);
        }
        let mut out: Vec<PopularQuery> = groups
            .into_iter()
            .map(|(query, acc)| PopularQuery {
                query,
                search_count: acc.count,
                avg_results: acc.results as f64 / acc.count as f64,
                click_rate: acc.clicks as f64 / acc.count as f64,
            })
            .collect();
        out.sort_by(|a, b| b.search_count.cmp(&a.search_count).then_with(|| a.query.cmp(&b.query)));
        out.truncate(limit);
        Ok(out)
    }

    /// Queries that found nothing, most searched first.
    pub fn zero_results(
        &self,
        window: time::Duration,
        limit: usize,
    ) -> Result<Vec<ZeroResultQuery>, AnalyticsError> {
        let mut groups: HashMap<String, (u64, OffsetDateTime)> = HashMap::new();
        for r in self.records_since(OffsetDateTime::now_utc() - window)? {
            if r.results_count != 0 {
                continue;
            }
            let entry = groups.entry(r.query.to_lowercase()).or_insert((0, r.created_at));
            entry.0 += 1;
            entry.1 = entry.1.max(r.created_at);
        }
        let mut out: Vec<ZeroResultQuery> = groups
            .into_iter()
            .map(|(query, (search_count, last_searched))| ZeroResultQuery { query, search_count, last_searched })
            .collect();
        out.sort_by(|a, b| {
            b.search_count
                .cmp(&a.search_count)
                .then(b.last_searched.cmp(&a.last_searched))
                .then_with(|| a.query.cmp(&b.query))
        });
        out.truncate(limit);
        Ok(out)
    }

    /// Drop records older than `retention`.
    pub fn prune(&self, retention: time::Duration) -> Result<usize, AnalyticsError> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for entry in self.records.iter() {
            let (key, bytes) = entry?;
            let record: QueryRecord = bincode::deserialize(&bytes)?;
            if record.created_at < cutoff {
                batch.remove(key);
                removed += 1;
            }
        }
        self.records.apply_batch(batch)?;
        info!(removed, "query records pruned");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[cfg(test)]
    fn backdate(&self, id: u64, by: time::Duration) {
        let mut record = self.get(id).unwrap().unwrap();
        record.created_at -= by;
        self.records.insert(&id.to_be_bytes()[..], bincode::serialize(&record).unwrap()).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> AnalyticsRecorder {
        AnalyticsRecorder::temporary(AnalyticsConfig::default(), 200).unwrap()
    }

    fn log(rec: &AnalyticsRecorder, query: &str, results: usize) -> u64 {
        let id = rec.next_id().unwrap();
        rec.record(
            id,
            SearchEvent {
                query: query.to_string(),
                results_count: results,
                search_time_ms: 3,
                filters: AppliedFilters::default(),
                client: ClientMeta::default(),
            },
        )
        .unwrap();
        id
    }

    #[test]
    fn redacts_emails_and_long_numbers() {
        assert_eq!(sanitize(&redact("mail jane.doe@example.com lamp"), 200), "mail lamp");
        assert_eq!(sanitize(&redact("call 555-123-4567"), 200), "call");
        assert_eq!(sanitize(&redact("iphone 15 pro"), 200), "iphone 15 pro");
    }

    #[test]
    fn caps_client_metadata() {
        let config = AnalyticsConfig { max_user_agent_len: 4, ..AnalyticsConfig::default() };
        let rec = AnalyticsRecorder::temporary(config, 200).unwrap();
        let id = rec.next_id().unwrap();
        rec.record(
            id,
            SearchEvent {
                query: "lamp".into(),
                results_count: 1,
                search_time_ms: 1,
                filters: AppliedFilters { min_price: Some(5.0), ..Default::default() },
                client: ClientMeta { ip_address: Some("10.0.0.1".into()), user_agent: Some("Mozilla/5.0".into()) },
            },
        )
        .unwrap();
        let stored = rec.get(id).unwrap().unwrap();
        assert_eq!(stored.user_agent.as_deref(), Some("Mozi"));
        assert_eq!(stored.filters_applied.min_price, Some(5.0));
        assert!(!stored.clicked);
    }

    #[test]
    fn popular_orders_by_count_and_is_prefix_stable() {
        let rec = recorder();
        for _ in 0..3 {
            log(&rec, "lamp", 4);
        }
        log(&rec, "Desk", 2);
        log(&rec, "desk", 6);
        log(&rec, "chair", 1);
        log(&rec, "laptp", 0);

        let all = rec.popular(time::Duration::days(7), 10).unwrap();
        let queries: Vec<&str> = all.iter().map(|p| p.query.as_str()).collect();
        assert_eq!(queries, vec!["lamp", "desk", "chair"]);
        assert_eq!(all[1].avg_results, 4.0);

        let top2 = rec.popular(time::Duration::days(7), 2).unwrap();
        assert_eq!(top2[..], all[..2]);
    }

    #[test]
    fn zero_results_and_window() {
        let rec = recorder();
        let old = log(&rec, "zzz", 0);
        log(&rec, "laptp", 0);
        log(&rec, "laptp", 0);
        rec.backdate(old, time::Duration::days(40));

        let zero = rec.zero_results(time::Duration::days(30), 10).unwrap();
        assert_eq!(zero.len(), 1);
        assert_eq!(zero[0].query, "laptp");
        assert_eq!(zero[0].search_count, 2);
    }

    #[test]
    fn window_scan_tolerates_late_writes() {
        let rec = recorder();
        log(&rec, "lamp", 1);
        let late = log(&rec, "desk", 1);
        log(&rec, "chair", 1);
        rec.backdate(late, time::Duration::hours(1) + time::Duration::seconds(30));

        let recent = rec.popular(time::Duration::hours(1), 10).unwrap();
        let queries: Vec<&str> = recent.iter().map(|p| p.query.as_str()).collect();
        assert_eq!(queries, vec!["chair", "lamp"]);
    }

    #[test]
    fn click_marks_only_recent_records() {
        let rec = recorder();
        let fresh = log(&rec, "lamp", 1);
        let stale = log(&rec, "desk", 1);
        rec.backdate(stale, time::Duration::hours(2));

        assert!(rec.mark_clicked(fresh).unwrap());
        assert!(!rec.mark_clicked(stale).unwrap());
        assert!(!rec.mark_clicked(9999).unwrap());
        assert_eq!(rec.popular(time::Duration::days(7), 10).unwrap()[1].click_rate, 1.0);
    }

    #[test]
    fn prune_drops_expired_records() {
        let rec = recorder();
        let old = log(&rec, "old", 1);
        log(&rec, "new", 1);
        rec.backdate(old, time::Duration::days(31));
        assert_eq!(rec.prune(time::Duration::days(30)).unwrap(), 1);
        assert_eq!(rec.len(), 1);
    }
}
