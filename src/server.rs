//! Reference file server implementing the REST surface the client talks to.
//!
//! Files live flat in one directory. Names with path separators are refused.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::BufMut;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use tokio::task::JoinHandle;
use warp::hyper::Body;
use warp::multipart::FormData;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::error::Result;
use crate::file_info::FileRecord;

pub const MAX_UPLOAD_BYTES: u64 = 32 << 20;

#[derive(Debug)]
enum Failure {
    BadRequest(&'static str),
    NotFound,
    Internal(&'static str),
}

impl Failure {
    fn into_response(self) -> Response {
        let (status, text) = match self {
            Failure::BadRequest(text) => (StatusCode::BAD_REQUEST, text),
            Failure::NotFound => (StatusCode::NOT_FOUND, "File not found"),
            Failure::Internal(text) => (StatusCode::INTERNAL_SERVER_ERROR, text),
        };
        warp::reply::with_status(text.to_string(), status).into_response()
    }
}

#[derive(Serialize)]
struct StatusReport {
    status: &'static str,
    time: String,
}

fn get_or_head() -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::get().or(warp::head()).unify()
}

pub fn routes(root: PathBuf) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let root = Arc::new(root);
    let with_root = warp::any().map(move || root.clone());

    let upload = warp::path!("api" / "upload")
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
        .and(with_root.clone())
        .and_then(upload_file);
    let list = warp::path!("api" / "files")
        .and(get_or_head())
        .and(with_root.clone())
        .and_then(list_files);
    let download = warp::path!("api" / "files" / String)
        .and(get_or_head())
        .and(with_root.clone())
        .and_then(download_file);
    let delete = warp::path!("api" / "files" / String)
        .and(warp::delete())
        .and(with_root)
        .and_then(delete_file);
    let status = warp::path!("api" / "status").and(get_or_head()).map(|| {
        warp::reply::json(&StatusReport {
            status: "running",
            time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    });

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS", "HEAD"])
        .allow_headers(vec!["Content-Type", "Authorization"]);

    upload
        .or(list)
        .or(download)
        .or(delete)
        .or(status)
        .with(cors)
        .with(warp::trace::request())
}

/// Serve `root` on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, root: PathBuf) -> Result<()> {
    tokio::fs::create_dir_all(&root).await?;
    let (bound, server) = warp::serve(routes(root.clone())).try_bind_ephemeral(addr)?;
    tracing::info!("Serving {} on http://{}", root.display(), bound);
    server.await;
    Ok(())
}

/// Start a server in the background, returning the address it bound.
pub async fn spawn(addr: SocketAddr, root: PathBuf) -> Result<(SocketAddr, JoinHandle<()>)> {
    tokio::fs::create_dir_all(&root).await?;
    let (bound, server) = warp::serve(routes(root)).try_bind_ephemeral(addr)?;
    tracing::info!("Serving on http://{}", bound);
    Ok((bound, tokio::spawn(server)))
}

fn resolve(root: &Path, name: &str) -> std::result::Result<PathBuf, Failure> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(Failure::BadRequest("Invalid file name"));
    }
    Ok(root.join(name))
}

fn decode_segment(raw: &str) -> std::result::Result<String, Failure> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|name| name.into_owned())
        .map_err(|_| Failure::BadRequest("Invalid file name"))
}

fn not_found_or(err: std::io::Error, text: &'static str) -> Failure {
    if err.kind() == std::io::ErrorKind::NotFound {
        Failure::NotFound
    } else {
        Failure::Internal(text)
    }
}

async fn upload_file(form: FormData, root: Arc<PathBuf>) -> std::result::Result<Response, Infallible> {
    Ok(match store_upload(form, &root).await {
        Ok(name) => {
            tracing::info!("stored {}", name);
            format!("File uploaded successfully: {}", name).into_response()
        }
        Err(failure) => failure.into_response(),
    })
}

async fn store_upload(form: FormData, root: &Path) -> std::result::Result<String, Failure> {
    let mut form = Box::pin(form);
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|_| Failure::BadRequest("Failed to parse form"))?
    {
        if part.name() != "file" {
            continue;
        }
        let name = part
            .filename()
            .map(str::to_string)
            .ok_or(Failure::BadRequest("Error retrieving file"))?;
        let path = resolve(root, &name)?;
        let data = part
            .stream()
            .try_fold(Vec::new(), |mut data, chunk| async move {
                data.put(chunk);
                Ok(data)
            })
            .await
            .map_err(|_| Failure::BadRequest("Failed to parse form"))?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|_| Failure::Internal("Failed to save file"))?;
        return Ok(name);
    }
    Err(Failure::BadRequest("Error retrieving file"))
}

async fn list_files(root: Arc<PathBuf>) -> std::result::Result<Response, Infallible> {
    Ok(match read_listing(&root).await {
        Ok(files) => warp::reply::json(&files).into_response(),
        Err(failure) => failure.into_response(),
    })
}

async fn read_listing(root: &Path) -> std::result::Result<Vec<FileRecord>, Failure> {
    let failed = |_| Failure::Internal("Failed to read files directory");
    let mut entries = tokio::fs::read_dir(root).await.map_err(failed)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(failed)? {
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        let modified: DateTime<Utc> = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH).into();
        files.push(FileRecord {
            name,
            size: meta.len(),
            upload_date: modified.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

async fn download_file(raw: String, root: Arc<PathBuf>) -> std::result::Result<Response, Infallible> {
    Ok(match read_file(&root, &raw).await {
        Ok(data) => {
            let mut response = Response::new(Body::from(data));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            response
        }
        Err(failure) => failure.into_response(),
    })
}

async fn read_file(root: &Path, raw: &str) -> std::result::Result<Vec<u8>, Failure> {
    let path = resolve(root, &decode_segment(raw)?)?;
    tokio::fs::read(&path)
        .await
        .map_err(|e| not_found_or(e, "Failed to read file"))
}

async fn delete_file(raw: String, root: Arc<PathBuf>) -> std::result::Result<Response, Infallible> {
    Ok(match remove_file(&root, &raw).await {
        Ok(name) => {
            tracing::info!("deleted {}", name);
            format!("File deleted successfully: {}", name).into_response()
        }
        Err(failure) => failure.into_response(),
    })
}

async fn remove_file(root: &Path, raw: &str) -> std::result::Result<String, Failure> {
    let name = decode_segment(raw)?;
    let path = resolve(root, &name)?;
    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| not_found_or(e, "Failed to delete file"))?;
    Ok(name)
}
