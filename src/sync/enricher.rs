//! Reference discovery and sub-resource merging.
//!
//! A record embeds links to other resources either as objects carrying a
//! `uri` field or as bare URL strings. Every distinct URL is fetched once,
//! concurrently, and the flattened bodies are merged into an `extra` map that
//! never shadows the record's own fields.

use crate::client::ResourceClient;
use crate::error::FetchError;
use crate::sync::RawRecord;
use crate::sync::flatten::{FlatRecord, flatten, join};
use crate::sync::ledger::{FetchLedger, Prior};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A link found inside a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Flattened path of the value the link was found at.
    pub path: String,
    pub url: String,
}

/// A record together with the merged content of its sub-resources.
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    pub record: RawRecord,
    /// Union of the flattened sub-resource bodies.
    pub extra: FlatRecord,
    /// URLs whose fetch failed; their content is absent from `extra`.
    pub failed: Vec<String>,
}

impl EnrichedRecord {
    /// Flatten the record and fill in sub-resource paths it does not define itself.
    pub fn flatten(&self) -> FlatRecord {
        let mut flat = flatten(&self.record, "");
        for (path, value) in self.extra.iter() {
            flat.insert_if_absent(path.clone(), value.clone());
        }
        flat
    }
}

/// True for `http`/`https` URLs that parse as absolute.
pub fn is_absolute_url(candidate: &str) -> bool {
    reqwest::Url::parse(candidate)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false)
}

/// Every absolute link inside `record`, one entry per distinct URL, in walk order.
pub fn discover(record: &Value) -> Vec<Reference> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    walk(record, "", &mut seen, &mut found);
    found
}

fn walk(value: &Value, path: &str, seen: &mut HashSet<String>, found: &mut Vec<Reference>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(uri)) = map.get("uri") {
                push_reference(path, uri, seen, found);
            }
            for (key, child) in map {
                walk(child, &join(path, key), seen, found);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                walk(child, &join(path, &index.to_string()), seen, found);
            }
        }
        Value::String(text) => push_reference(path, text, seen, found),
        _ => {}
    }
}

fn push_reference(path: &str, url: &str, seen: &mut HashSet<String>, found: &mut Vec<Reference>) {
    if is_absolute_url(url) && seen.insert(url.to_string()) {
        found.push(Reference {
            path: path.to_string(),
            url: url.to_string(),
        });
    }
}

pub struct ReferenceEnricher {
    client: Arc<dyn ResourceClient>,
    ledger: Arc<FetchLedger>,
    cancel: CancellationToken,
}

impl ReferenceEnricher {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        ledger: Arc<FetchLedger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            ledger,
            cancel,
        }
    }

    /// Fetch every sub-resource of `record` and merge the results.
    ///
    /// Bodies already fetched during this run are reused from the ledger and
    /// URLs that failed earlier are not requested again. Individual failures
    /// are logged and leave the rest of the record untouched.
    pub async fn enrich(&self, record: RawRecord) -> EnrichedRecord {
        let record_id = super::record_id(&record);
        let references = discover(&record);
        let mut extra = FlatRecord::new();
        let mut failed = Vec::new();
        let mut requests: JoinSet<(Reference, Result<Value, FetchError>)> = JoinSet::new();

        for reference in references {
            match self.ledger.prior(&reference.url) {
                Some(Prior::Fetched(body)) => {
                    log::debug!("record {}: reusing cached {}", record_id, reference.url);
                    merge_body(&mut extra, &reference, &body);
                }
                Some(Prior::Failed) => {
                    log::debug!("record {}: skipping previously failed {}", record_id, reference.url);
                    failed.push(reference.url);
                }
                Some(Prior::Page) => {
                    log::debug!("record {}: {} is a listing page, not fetched", record_id, reference.url);
                }
                None => {
                    let client = Arc::clone(&self.client);
                    requests.spawn(async move {
                        let result = client.get(&reference.url).await;
                        (reference, result)
                    });
                }
            }
        }

        loop {
            let joined = tokio::select! {
                _ = self.cancel.cancelled() => {
                    requests.abort_all();
                    log::warn!("record {}: enrichment cancelled", record_id);
                    break;
                }
                joined = requests.join_next() => joined,
            };

            let Some(joined) = joined else {
                break;
            };

            match joined {
                Ok((reference, Ok(body))) => {
                    log::debug!("record {}: fetched {} at {}", record_id, reference.url, reference.path);
                    let body = Arc::new(body);
                    self.ledger.record_success(&reference.url, Arc::clone(&body));
                    merge_body(&mut extra, &reference, &body);
                }
                Ok((reference, Err(err))) => {
                    log::warn!("record {}: sub-resource at {} omitted: {}", record_id, reference.path, err);
                    self.ledger.record_failure(&reference.url);
                    failed.push(reference.url);
                }
                Err(join_err) => {
                    log::warn!("record {}: sub-resource task failed: {}", record_id, join_err);
                }
            }
        }

        EnrichedRecord {
            record,
            extra,
            failed,
        }
    }
}

/// Later bodies overwrite earlier ones on colliding paths.
fn merge_body(extra: &mut FlatRecord, reference: &Reference, body: &Value) {
    let flat = match body {
        Value::Object(_) | Value::Array(_) => flatten(body, ""),
        scalar => flatten(scalar, &reference.path),
    };
    for (path, value) in flat.iter() {
        extra.insert(path.clone(), value.clone());
    }
}
