//! Google Drive 客户端
//!
//! ## 职责
//! - 分页列出文件夹中的文档
//! - 下载文档内容（Google 原生文档导出为 PDF）
//! - 把 HTTP 状态映射为暂时性 / 永久性错误
//!
//! 不做重试，重试由调用方的 `RetryExecutor` 负责。

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::DocumentStore;
use crate::config::Config;
use crate::error::{PermanentError, TaskError};
use crate::models::DocumentRef;

const SERVICE: &str = "drive";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const PAGE_SIZE: &str = "1000";

/// `files.list` 的一页结果
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListPage {
    #[serde(default)]
    files: Vec<DocumentRef>,
    next_page_token: Option<String>,
}

/// Google Drive v3 REST 客户端
pub struct DriveClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    request_timeout: Duration,
}

impl DriveClient {
    pub fn new(config: &Config) -> Result<Self, TaskError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TaskError::invalid_input(format!("无法创建 HTTP 客户端: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.drive_api_base_url.trim_end_matches('/').to_string(),
            access_token: config.drive_access_token.clone(),
            request_timeout: config.request_timeout(),
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, TaskError> {
        let response = request
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.request_timeout))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, retry_after, &body))
    }

    async fn list_page(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileListPage, TaskError> {
        let query = format!("'{}' in parents and trashed=false", folder_id);
        let mut params = vec![
            ("q", query.as_str()),
            ("pageSize", PAGE_SIZE),
            ("fields", "nextPageToken, files(id, name, mimeType, size)"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let url = format!("{}/files", self.base_url);
        let response = self.send(self.http.get(&url).query(&params)).await?;
        response
            .json::<FileListPage>()
            .await
            .map_err(|e| TaskError::network(SERVICE, format!("文件列表解析失败: {}", e)))
    }
}

#[async_trait]
impl DocumentStore for DriveClient {
    async fn list_files(&self, folder_id: &str) -> Result<Vec<DocumentRef>, TaskError> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = self.list_page(folder_id, page_token.as_deref()).await?;
            pages += 1;
            documents.extend(page.files.into_iter().filter(|f| f.mime_type != FOLDER_MIME));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("列出文件夹 {}: {} 页, {} 个文档", folder_id, pages, documents.len());
        Ok(documents)
    }

    async fn fetch_content(&self, doc: &DocumentRef) -> Result<Vec<u8>, TaskError> {
        let request = if doc.is_workspace_native() {
            let url = format!("{}/files/{}/export", self.base_url, doc.id);
            self.http.get(url).query(&[("mimeType", "application/pdf")])
        } else {
            let url = format!("{}/files/{}", self.base_url, doc.id);
            self.http.get(url).query(&[("alt", "media")])
        };

        let response = match self.send(request).await {
            Err(TaskError::Permanent(PermanentError::NotFound { .. })) => {
                return Err(TaskError::not_found(&doc.id));
            }
            other => other?,
        };

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(&e, self.request_timeout))?;
        debug!("[doc {}] 下载完成: {} 字节", doc.name, bytes.len());
        Ok(bytes.to_vec())
    }
}

/// HTTP 状态码 → 任务错误
fn map_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> TaskError {
    let message = crate::utils::logging::truncate_text(body.trim(), 200);
    match status {
        StatusCode::TOO_MANY_REQUESTS => TaskError::rate_limited(SERVICE, retry_after),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            // Drive 用 403 + rateLimitExceeded 表示用户级限流
            if status == StatusCode::FORBIDDEN && body.contains("rateLimitExceeded") {
                TaskError::rate_limited(SERVICE, retry_after)
            } else {
                TaskError::unauthorized(SERVICE, message)
            }
        }
        StatusCode::NOT_FOUND => TaskError::not_found(message),
        StatusCode::REQUEST_TIMEOUT => TaskError::network(SERVICE, message),
        s if s.is_server_error() => TaskError::server(SERVICE, s.as_u16(), message),
        s => TaskError::invalid_input(format!("{} 返回 {}: {}", SERVICE, s.as_u16(), message)),
    }
}

fn map_transport_error(err: &reqwest::Error, timeout: Duration) -> TaskError {
    if err.is_timeout() {
        TaskError::timeout(SERVICE, timeout)
    } else {
        TaskError::network(SERVICE, err.to_string())
    }
}

/// 只支持秒数形式的 `Retry-After`
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
