use super::ApiState;
use crate::config::KEYS_PAGE_SIZE;
use crate::core::store::Store;
use actix_web::{
    get,
    http::{header::ContentType, StatusCode},
    post,
    web::{Bytes, Data, Json, Path, Query},
    HttpResponse, Responder, ResponseError,
};
use futures::{stream, Stream};
use keymirror_common::{
    api::{
        ElBlockSnapshot, FindKeysRequest, KeyEntry, KeysResponse, ModuleStatus, OperatorEntry,
        OperatorsResponse, ResponseMeta, StatusResponse,
    },
    config::VERSION,
    crypto::{Address, PublicKey},
    registry::Meta,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // the mirror has not completed its first update cycle yet
    #[error("mirrored state is not available yet")]
    TooEarly,
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::TooEarly => StatusCode::from_u16(425).expect("425 is a valid status code"),
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) | ApiError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

// The snapshot attached to read responses: the earliest committed block
// across all tracked modules. Every module must have completed at least
// one update cycle, otherwise the response would mix chain states with
// gaps in them.
async fn snapshot(state: &ApiState) -> Result<ElBlockSnapshot, ApiError> {
    let mut earliest: Option<Meta> = None;
    for module in &state.modules {
        let meta = state.store.meta(module).await?.ok_or(ApiError::TooEarly)?;
        if earliest.map_or(true, |e| meta.block_number < e.block_number) {
            earliest = Some(meta);
        }
    }

    earliest
        .as_ref()
        .map(ElBlockSnapshot::from)
        .ok_or(ApiError::TooEarly)
}

#[get("/")]
pub async fn index() -> impl Responder {
    HttpResponse::Ok().json(json!({ "name": "keymirror", "version": VERSION }))
}

#[get("/metrics")]
pub async fn metrics(prometheus: Data<PrometheusHandle>) -> impl Responder {
    HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(prometheus.render())
}

#[get("/v1/status")]
pub async fn status(state: Data<ApiState>) -> Result<HttpResponse, ApiError> {
    let mut modules = Vec::with_capacity(state.modules.len());
    for module in &state.modules {
        let meta = state.store.meta(module).await?;
        modules.push(ModuleStatus {
            address: *module,
            el_block_snapshot: meta.as_ref().map(ElBlockSnapshot::from),
            keys_op_index: meta.map(|meta| meta.keys_op_index),
        });
    }

    Ok(HttpResponse::Ok().json(StatusResponse {
        version: VERSION.to_owned(),
        modules,
    }))
}

#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    // filter on the used flag when present
    pub used: Option<bool>,
}

#[get("/v1/keys")]
pub async fn list_keys(
    state: Data<ApiState>,
    query: Query<KeysQuery>,
) -> Result<HttpResponse, ApiError> {
    let snapshot = snapshot(&state).await?;

    // the key list is unbounded, stream it page by page instead of
    // materializing it in memory
    let tail = format!(
        "],\"meta\":{}}}",
        serde_json::to_string(&ResponseMeta {
            el_block_snapshot: snapshot
        })?
    );

    let body = keys_stream(KeysStreamState {
        store: state.store.clone(),
        modules: state.modules.clone(),
        used: query.used,
        tail,
        module_idx: 0,
        after: None,
        first: true,
        phase: StreamPhase::Head,
    });

    Ok(HttpResponse::Ok()
        .content_type(ContentType::json())
        .streaming(body))
}

#[get("/v1/keys/{pubkey}")]
pub async fn get_key(
    state: Data<ApiState>,
    path: Path<String>,
) -> Result<HttpResponse, ApiError> {
    let pubkey =
        PublicKey::from_str(path.as_str()).map_err(|e| ApiError::BadRequest(e.to_owned()))?;

    let snapshot = snapshot(&state).await?;
    let data = state.store.find_keys_by_pubkeys(&[pubkey]).await?;

    Ok(HttpResponse::Ok().json(KeysResponse {
        data,
        meta: ResponseMeta {
            el_block_snapshot: snapshot,
        },
    }))
}

#[post("/v1/keys/find")]
pub async fn find_keys(
    state: Data<ApiState>,
    request: Json<FindKeysRequest>,
) -> Result<HttpResponse, ApiError> {
    if request.pubkeys.is_empty() {
        return Err(ApiError::BadRequest("pubkeys must not be empty".to_owned()));
    }

    let snapshot = snapshot(&state).await?;
    let data = state.store.find_keys_by_pubkeys(&request.pubkeys).await?;

    Ok(HttpResponse::Ok().json(KeysResponse {
        data,
        meta: ResponseMeta {
            el_block_snapshot: snapshot,
        },
    }))
}

#[get("/v1/operators")]
pub async fn list_operators(state: Data<ApiState>) -> Result<HttpResponse, ApiError> {
    let snapshot = snapshot(&state).await?;

    let mut data = Vec::new();
    for module in &state.modules {
        let operators = state.store.operators(module).await?;
        data.extend(operators.into_iter().map(|operator| OperatorEntry {
            module_address: *module,
            operator,
        }));
    }

    Ok(HttpResponse::Ok().json(OperatorsResponse {
        data,
        meta: ResponseMeta {
            el_block_snapshot: snapshot,
        },
    }))
}

enum StreamPhase {
    Head,
    Rows,
    Tail,
    Done,
}

struct KeysStreamState {
    store: Store,
    modules: Vec<Address>,
    used: Option<bool>,
    tail: String,
    module_idx: usize,
    after: Option<(u64, u64)>,
    first: bool,
    phase: StreamPhase,
}

// Emit a JSON envelope {"data":[...],"meta":{...}} chunk by chunk.
// Pages are keyset-paginated per module, so the cursor survives
// concurrent update cycles without skipping or repeating rows.
fn keys_stream(state: KeysStreamState) -> impl Stream<Item = Result<Bytes, ApiError>> {
    stream::unfold(state, |mut state| async move {
        loop {
            match state.phase {
                StreamPhase::Head => {
                    state.phase = StreamPhase::Rows;
                    return Some((Ok(Bytes::from_static(b"{\"data\":[")), state));
                }
                StreamPhase::Rows => {
                    if state.module_idx >= state.modules.len() {
                        state.phase = StreamPhase::Tail;
                        continue;
                    }

                    let module = state.modules[state.module_idx];
                    let page = match state
                        .store
                        .keys_page(&module, state.after, KEYS_PAGE_SIZE, state.used)
                        .await
                    {
                        Ok(page) => page,
                        Err(e) => {
                            state.phase = StreamPhase::Done;
                            return Some((Err(e.into()), state));
                        }
                    };

                    if page.is_empty() {
                        state.module_idx += 1;
                        state.after = None;
                        continue;
                    }

                    let last = page[page.len() - 1];
                    state.after = Some((last.operator_index, last.index));

                    let mut buf = String::new();
                    for key in page {
                        let entry = KeyEntry::new(module, key);
                        let json = match serde_json::to_string(&entry) {
                            Ok(json) => json,
                            Err(e) => {
                                state.phase = StreamPhase::Done;
                                return Some((Err(e.into()), state));
                            }
                        };

                        if state.first {
                            state.first = false;
                        } else {
                            buf.push(',');
                        }
                        buf.push_str(&json);
                    }

                    return Some((Ok(Bytes::from(buf)), state));
                }
                StreamPhase::Tail => {
                    state.phase = StreamPhase::Done;
                    let tail = std::mem::take(&mut state.tail);
                    return Some((Ok(Bytes::from(tail)), state));
                }
                StreamPhase::Done => return None,
            }
        }
    })
}
