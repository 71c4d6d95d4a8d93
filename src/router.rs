use crate::{
    export::{Exporter, FlowReport},
    model::FlowKey,
    storage::BlobStore,
};

use alloc::sync::Arc;
use core::future::Future;
use futures_util::TryFutureExt;
use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::CONTENT_TYPE,
    http::{request::Parts, HeaderValue},
    Method, Request, Response, StatusCode,
};

/// Extracts the `src` and `dst` parameters of a query string.
fn extract_flow_key(query: &str) -> Option<FlowKey> {
    let mut source = None;
    let mut destination = None;
    for pair in query.split('&') {
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let value = urlencoding::decode(value).ok()?.into_owned();
        match name {
            "src" => source = Some(value),
            "dst" => destination = Some(value),
            _ => continue,
        }
    }

    let (source, destination) = (source?, destination?);
    if source.is_empty() || destination.is_empty() {
        return None;
    }
    Some(FlowKey::new(source, destination))
}

/// What a request asks for, once its method, path and query were checked.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Flow(FlowKey),
}

fn route(method: &Method, path: &str, query: Option<&str>) -> Result<Route, StatusCode> {
    if *method != Method::GET {
        log::warn!("unexpected {method} method received");
        return Err(StatusCode::METHOD_NOT_ALLOWED);
    }

    match path {
        "/health" => Ok(Route::Health),
        "/flow" => query.and_then(extract_flow_key).map(Route::Flow).ok_or(StatusCode::BAD_REQUEST),
        path => {
            log::warn!("unexpected request to GET {path}");
            Err(StatusCode::NOT_FOUND)
        }
    }
}

fn respond(key: &FlowKey, report: Option<FlowReport>) -> Result<Response<Full<Bytes>>, StatusCode> {
    let Some(report) = report else {
        log::info!("no aggregate for {key}");
        return Err(StatusCode::NOT_FOUND);
    };

    let mut res = Response::new(Full::new(Bytes::from(report.to_csv())));
    res.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/csv; charset=utf-8"));
    Ok(res)
}

async fn try_handle<S: BlobStore>(
    exporter: Arc<Exporter<S>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, StatusCode> {
    let (Parts { method, uri, .. }, _) = req.into_parts();
    let key = match route(&method, uri.path(), uri.query())? {
        Route::Health => return Ok(Response::default()),
        Route::Flow(key) => key,
    };

    let report = exporter.lookup(&key).await.map_err(|err| {
        log::error!("{err}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    respond(&key, report)
}

pub fn handle<S: BlobStore>(
    exporter: Arc<Exporter<S>>,
    req: Request<Incoming>,
) -> impl Future<Output = Response<Full<Bytes>>> {
    try_handle(exporter, req).unwrap_or_else(|code| {
        let mut res = Response::default();
        *res.status_mut() = code;
        res
    })
}
