use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::catalog::{frequency_flag, Catalog};
use crate::compiler::group_params;
use crate::error::HostdbError;
use crate::interface::{HostDb, QueryResult};
use crate::record::{Record, RecordSet};

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordsResponse {
    pub count: u64,
    pub query_time: String,
    pub records: BTreeMap<String, Record>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogResponse {
    pub count: usize,
    pub query_time: String,
    pub catalog: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CatalogQuantityResponse {
    pub count: usize,
    pub query_time: String,
    pub catalog: Catalog,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PostRecordsResponse {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRecordResponse {
    pub id: String,
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteRecordResponse {
    pub id: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type Shared = Arc<HostDb>;
type Pairs = Query<Vec<(String, String)>>;

pub fn router(hostdb: Shared) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);
    Router::new()
        .route("/stats", get(stats))
        .route("/v0/config/", get(api_config))
        .route("/v0/detail/", get(query))
        .route("/v0/detail/:id", get(detail))
        .route("/v0/list/", get(list))
        .route("/v0/list/:id", get(list_one))
        .route("/v0/records/", get(list).post(post_bulk))
        .route("/v0/records/:id", get(detail).put(save_record).delete(delete_record))
        .route("/v0/catalog/:item", get(catalog))
        .layer(cors)
        .with_state(hostdb)
}

/// Runs synchronous storage work off the async executor.
async fn blocking<T, F>(hostdb: &Shared, work: F) -> Result<T, HostdbError>
where
    T: Send + 'static,
    F: FnOnce(&HostDb) -> crate::error::Result<T> + Send + 'static,
{
    let hostdb = Arc::clone(hostdb);
    tokio::task::spawn_blocking(move || work(&hostdb)).await.map_err(|e| {
        warn!(error = %e, "Join error");
        HostdbError::Storage(format!("worker task failed: {e}"))
    })?
}

/// Browsers get indented JSON; everything else gets it compact.
fn wants_pretty(headers: &HeaderMap) -> bool {
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    ["chrome", "edge", "gecko", "firefox", "mozilla"]
        .iter()
        .any(|client| agent.contains(client))
}

fn respond<T: Serialize>(headers: &HeaderMap, status: StatusCode, body: &T) -> Response {
    let rendered = if wants_pretty(headers) {
        serde_json::to_string_pretty(body)
    } else {
        serde_json::to_string(body)
    };
    match rendered {
        Ok(text) => (status, [(header::CONTENT_TYPE, "application/json; charset=utf-8")], text).into_response(),
        Err(e) => {
            warn!(error = %e, "could not serialize response");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

fn status_of(e: &HostdbError) -> StatusCode {
    StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn failure(headers: &HeaderMap, e: HostdbError) -> Response {
    let status = status_of(&e);
    let msg = e.to_string();
    warn!(%msg, code = %status.as_u16(), "request failed");
    respond(headers, status, &ErrorResponse { error: msg })
}

/// `"<remote addr>: <user agent>"`, the committer of writes that name none.
fn caller(addr: Option<ConnectInfo<SocketAddr>>, headers: &HeaderMap) -> String {
    let remote = addr.map(|ConnectInfo(a)| a.to_string()).unwrap_or_default();
    let agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    format!("{remote}: {agent}")
}

fn records_response(result: QueryResult, started: Instant) -> RecordsResponse {
    RecordsResponse {
        count: result.total,
        query_time: format!("{:?}", started.elapsed()),
        records: result.records.into_iter().map(|r| (r.id.clone(), r)).collect(),
    }
}

async fn api_config(State(hostdb): State<Shared>, headers: HeaderMap) -> Response {
    respond(&headers, StatusCode::OK, hostdb.api_config())
}

async fn stats(State(hostdb): State<Shared>, headers: HeaderMap) -> Response {
    match blocking(&hostdb, |db| db.stats()).await {
        Ok(stats) => respond(&headers, StatusCode::OK, &stats),
        Err(e) => failure(&headers, e),
    }
}

async fn query(State(hostdb): State<Shared>, headers: HeaderMap, Query(pairs): Pairs) -> Response {
    let started = Instant::now();
    let params = group_params(pairs);
    match blocking(&hostdb, move |db| db.query(&params)).await {
        Ok(result) => respond(&headers, StatusCode::OK, &records_response(result, started)),
        Err(e) => failure(&headers, e),
    }
}

async fn list(State(hostdb): State<Shared>, headers: HeaderMap, Query(pairs): Pairs) -> Response {
    let started = Instant::now();
    let params = group_params(pairs);
    match blocking(&hostdb, move |db| db.list(&params)).await {
        Ok(result) => respond(&headers, StatusCode::OK, &records_response(result, started)),
        Err(e) => failure(&headers, e),
    }
}

async fn detail(State(hostdb): State<Shared>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    let started = Instant::now();
    match blocking(&hostdb, move |db| db.detail(&id)).await {
        Ok(record) => {
            let result = QueryResult { records: vec![record], total: 1 };
            respond(&headers, StatusCode::OK, &records_response(result, started))
        }
        Err(e) => failure(&headers, e),
    }
}

async fn list_one(
    State(hostdb): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(pairs): Pairs,
) -> Response {
    let started = Instant::now();
    let params = group_params(pairs);
    let projected = blocking(&hostdb, move |db| {
        let record = db.detail(&id)?;
        Ok(record.project(&db.list_fields(&params)))
    })
    .await;
    match projected {
        Ok(record) => {
            let result = QueryResult { records: vec![record], total: 1 };
            respond(&headers, StatusCode::OK, &records_response(result, started))
        }
        Err(e) => failure(&headers, e),
    }
}

async fn catalog(
    State(hostdb): State<Shared>,
    headers: HeaderMap,
    Path(item): Path<String>,
    Query(pairs): Pairs,
) -> Response {
    let started = Instant::now();
    let params = group_params(pairs);
    let frequency = params
        .get("count")
        .and_then(|v| v.first())
        .is_some_and(|v| frequency_flag(v));
    let filter = params.get("filter").and_then(|v| v.first()).cloned();
    match blocking(&hostdb, move |db| db.catalog(&item, frequency, filter.as_deref())).await {
        Ok(catalog) if frequency => {
            let body = CatalogQuantityResponse {
                count: catalog.len(),
                query_time: format!("{:?}", started.elapsed()),
                catalog,
            };
            respond(&headers, StatusCode::OK, &body)
        }
        Ok(catalog) => {
            let body = CatalogResponse {
                count: catalog.len(),
                query_time: format!("{:?}", started.elapsed()),
                catalog: catalog.into_keys().collect(),
            };
            respond(&headers, StatusCode::OK, &body)
        }
        Err(e) => failure(&headers, e),
    }
}

async fn post_bulk(
    State(hostdb): State<Shared>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let committer = caller(addr, &headers);
    let outcome = match serde_json::from_slice::<RecordSet>(&body) {
        Ok(set) => blocking(&hostdb, move |db| db.reconcile(set, &committer)).await,
        Err(e) => Err(HostdbError::validation(format!("could not parse the record set: {e}"))),
    };
    match outcome {
        Ok(outcome) => {
            info!(processed = outcome.processed, "bulk request complete");
            let body = PostRecordsResponse {
                ok: true,
                error: format!("{} record(s) processed", outcome.processed),
            };
            respond(&headers, StatusCode::OK, &body)
        }
        Err(e) => {
            let status = status_of(&e);
            warn!(error = %e, code = %status.as_u16(), "bulk request failed");
            respond(&headers, status, &PostRecordsResponse { ok: false, error: e.to_string() })
        }
    }
}

async fn save_record(
    State(hostdb): State<Shared>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let committer = caller(addr, &headers);
    let saved = match serde_json::from_slice::<Record>(&body) {
        Ok(record) => blocking(&hostdb, move |db| db.save(&id, record, &committer)).await,
        Err(e) => Err(HostdbError::validation(format!("could not parse the record: {e}"))),
    };
    match saved {
        Ok(id) => respond(&headers, StatusCode::CREATED, &PutRecordResponse { id, ok: true }),
        Err(e) => failure(&headers, e),
    }
}

async fn delete_record(State(hostdb): State<Shared>, headers: HeaderMap, Path(id): Path<String>) -> Response {
    let target = id.clone();
    match blocking(&hostdb, move |db| db.delete(&target)).await {
        Ok(()) => respond(&headers, StatusCode::OK, &DeleteRecordResponse { id, deleted: true }),
        Err(e) => failure(&headers, e),
    }
}
