//! Query engine
//!
//! Executes queries inside a KV transaction.
//!
//! Execution flow:
//! 1. Validate the query shape
//! 2. Optimize: pick the index and its bounds
//! 3. Scan the index; secondary entries are resolved through the primary index
//! 4. Join each row against other collections
//! 5. Post-filter with every predicate
//! 6. Group and aggregate, then apply `having`
//! 7. Sort
//! 8. Paginate
//! 9. Project the select list

use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use super::aggregate;
use super::result::{Page, PageStats};
use super::sorter::ResultSorter;
use crate::context::Context;
use crate::document::{Document, Where, SELF_REF_PREFIX};
use crate::error::{DbError, DbResult};
use crate::index::{entry_document_id, get_document};
use crate::kv::{IterOptions, KvTx};
use crate::lock::CollectionLocks;
use crate::planner::{Explain, Join, Optimizer, OrderBy, Query, Select};
use crate::schema::{CollectionSchema, SchemaRegistry};

/// Executes reads against one transaction
pub struct QueryEngine<'a> {
    tx: &'a dyn KvTx,
    schemas: &'a SchemaRegistry,
    optimizer: &'a dyn Optimizer,
    locks: &'a CollectionLocks,
    ctx: &'a Context,
}

impl<'a> QueryEngine<'a> {
    pub fn new(
        tx: &'a dyn KvTx,
        schemas: &'a SchemaRegistry,
        optimizer: &'a dyn Optimizer,
        locks: &'a CollectionLocks,
        ctx: &'a Context,
    ) -> Self {
        Self {
            tx,
            schemas,
            optimizer,
            locks,
            ctx,
        }
    }

    /// Fetches a document by primary key
    pub fn get(&self, collection: &str, id: &str) -> DbResult<Option<Document>> {
        let schema = self.schema(collection)?;
        get_document(self.tx, &schema, id)
    }

    /// Runs a query and returns one page
    pub fn query(&self, collection: &str, query: &Query) -> DbResult<Page> {
        query.validate()?;
        let started = Instant::now();
        let schema = self.schema(collection)?;

        let aggregating = query.is_aggregate();
        let stop_after = (!aggregating && query.order_by.is_empty() && query.limit > 0)
            .then(|| (query.page + 1).saturating_mul(query.limit));

        let mut rows = Vec::new();
        let explain = self.scan(
            &schema,
            &query.filter,
            &query.join,
            &query.order_by,
            &mut |doc| {
                rows.push(doc);
                Ok(stop_after.map_or(true, |n| rows.len() < n))
            },
        )?;

        if aggregating {
            rows = aggregate::aggregate(rows, &query.group_by, &query.select)?;
            if !query.having.is_empty() {
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows {
                    if row.matches(&query.having)? {
                        kept.push(row);
                    }
                }
                rows = kept;
            }
        }

        ResultSorter::sort(&mut rows, &query.order_by);
        let rows = paginate(rows, query.limit, query.page);
        let documents = if aggregating {
            rows
        } else {
            rows.iter()
                .map(|row| project(row, &query.select))
                .collect::<DbResult<Vec<_>>>()?
        };

        debug!(
            target: "docudb::query",
            collection = %collection,
            index = %explain.index,
            returned = documents.len(),
            "query executed"
        );
        Ok(Page {
            count: documents.len(),
            documents,
            next_page: query.page + 1,
            stats: PageStats {
                execution_time_micros: u64::try_from(started.elapsed().as_micros())
                    .unwrap_or(u64::MAX),
                explain,
            },
        })
    }

    /// Streams every document matching `filter` until `f` returns `false`
    pub fn for_each(
        &self,
        collection: &str,
        filter: &[Where],
        f: &mut dyn FnMut(Document) -> DbResult<bool>,
    ) -> DbResult<Explain> {
        for predicate in filter {
            crate::document::path::validate_path(&predicate.field)?;
        }
        let schema = self.schema(collection)?;
        self.scan(&schema, filter, &[], &[], f)
    }

    /// Scans the chosen index, joining and post-filtering each row.
    ///
    /// `f` receives matching rows in index order and returns `false` to stop.
    pub fn scan(
        &self,
        schema: &CollectionSchema,
        filter: &[Where],
        joins: &[Join],
        order_by: &[OrderBy],
        f: &mut dyn FnMut(Document) -> DbResult<bool>,
    ) -> DbResult<Explain> {
        let explain = self.optimizer.optimize(schema, filter, order_by)?;
        let index = schema.index(&explain.index).ok_or_else(|| {
            DbError::internal(format!(
                "optimizer chose unknown index {} on {}",
                explain.index, schema.collection
            ))
        })?;

        let mut opts = IterOptions::prefix(explain.scan_prefix()).reverse(explain.reverse);
        if let Some(seek) = explain.seek_key() {
            opts = opts.seek(seek);
        }

        let mut it = self.tx.new_iterator(opts)?;
        while it.valid() {
            self.ctx.check_cancelled()?;
            let doc = if index.primary {
                Document::from_bytes(it.value())?
            } else {
                let id = entry_document_id(it.value())?;
                get_document(self.tx, schema, &id)?.ok_or_else(|| {
                    DbError::internal(format!(
                        "index {} on {} references missing document {}",
                        index.name, schema.collection, id
                    ))
                })?
            };

            for row in self.join(doc, joins)? {
                if row.matches(filter)? && !f(row)? {
                    return Ok(explain);
                }
            }
            it.next();
        }
        Ok(explain)
    }

    /// Left nested-loop join; each match fans out into its own row
    fn join(&self, doc: Document, joins: &[Join]) -> DbResult<Vec<Document>> {
        let mut rows = vec![doc];
        for join in joins {
            let schema = self.schema(&join.collection)?;
            let mut joined = Vec::with_capacity(rows.len());
            for row in rows {
                let on: Vec<Where> = join.on.iter().map(|w| bind_outer(w, &row)).collect();
                let mut matches = Vec::new();
                self.scan(&schema, &on, &[], &[], &mut |m| {
                    matches.push(m);
                    Ok(true)
                })?;
                if matches.is_empty() {
                    joined.push(row);
                    continue;
                }
                for m in matches {
                    let mut merged = row.clone();
                    merged.set(join.output_name(), m.into_value())?;
                    joined.push(merged);
                }
            }
            rows = joined;
        }
        Ok(rows)
    }

    fn schema(&self, collection: &str) -> DbResult<std::sync::Arc<CollectionSchema>> {
        let schema = self.schemas.get(collection)?;
        if !self.ctx.is_internal() {
            self.locks.ensure_unlocked(collection)?;
        }
        Ok(schema)
    }
}

/// Substitutes `$.path` with the outer row's value
fn bind_outer(predicate: &Where, outer: &Document) -> Where {
    match predicate.value.as_str().and_then(|s| s.strip_prefix(SELF_REF_PREFIX)) {
        Some(path) => Where {
            value: outer.get(path).cloned().unwrap_or(Value::Null),
            ..predicate.clone()
        },
        None => predicate.clone(),
    }
}

/// Skips `page * limit` rows and keeps `limit`; a zero limit keeps everything
fn paginate(rows: Vec<Document>, limit: usize, page: usize) -> Vec<Document> {
    if limit == 0 {
        return rows;
    }
    rows.into_iter()
        .skip(page.saturating_mul(limit))
        .take(limit)
        .collect()
}

/// Applies the select list; `*` keeps the whole row
fn project(row: &Document, selects: &[Select]) -> DbResult<Document> {
    if selects.iter().all(|s| s.is_all()) {
        return Ok(row.clone());
    }
    let mut out = Document::new();
    for select in selects {
        if select.is_all() {
            out.merge(row)?;
        } else if let Some(value) = row.get(&select.field) {
            out.set(&select.output_name(), value.clone())?;
        }
    }
    Ok(out)
}
