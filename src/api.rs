//! Typed access to the remote post-listing endpoint.

use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::AppConfig;
use crate::post::Post;
use crate::session::{Session, SessionError};

/// Errors from remote API operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Non-success status from the service.
    #[error("API returned HTTP {status} for {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Status code.
        status: u16,
    },

    /// The response body was not the expected JSON array.
    #[error("malformed API response from {url}: {reason}")]
    Malformed {
        /// Requested URL.
        url: String,
        /// Short cause.
        reason: String,
    },

    /// No post with the requested id exists.
    #[error("post {post_id} not found")]
    PostNotFound {
        /// Requested post id.
        post_id: String,
    },
}

/// Fetches a page of posts.
///
/// `limit` is capped to 1-1000 and `page` floored to 1 regardless of what
/// the config carries. `tags` are joined with spaces by the caller.
///
/// # Errors
///
/// Returns [`ApiError`] on transport failure, non-2xx status, or a body
/// that is not a JSON array of post descriptors.
#[instrument(skip(session, config), fields(tags = tags.unwrap_or("")))]
pub async fn fetch_posts(
    session: &Session,
    config: &AppConfig,
    page: u32,
    tags: Option<&str>,
) -> Result<Vec<Post>, ApiError> {
    let limit = config.limit.clamp(1, 1000);
    let page = page.max(1);

    let mut params = vec![
        ("limit", limit.to_string()),
        ("page", page.to_string()),
    ];
    if let Some(tags) = tags.filter(|t| !t.trim().is_empty()) {
        params.push(("tags", tags.trim().to_string()));
    }

    let response = session.get(&config.api_url, &params).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::HttpStatus {
            url: config.api_url.clone(),
            status: status.as_u16(),
        });
    }

    let posts: Vec<Post> = response.json().await.map_err(|e| ApiError::Malformed {
        url: config.api_url.clone(),
        reason: e.to_string(),
    })?;

    debug!(count = posts.len(), page, "fetched post page");
    Ok(posts)
}

/// Fetches a single post descriptor by id, used when resuming orphaned
/// downloads whose stored record lacks a `file_url`.
///
/// # Errors
///
/// Returns [`ApiError::PostNotFound`] when the service has no such post,
/// and the usual transport/status errors otherwise.
#[instrument(skip(session, config))]
pub async fn fetch_post_by_id(
    session: &Session,
    config: &AppConfig,
    post_id: &str,
) -> Result<Post, ApiError> {
    let params = vec![
        ("limit", "1".to_string()),
        ("page", "1".to_string()),
        ("tags", format!("id:{post_id}")),
    ];

    let response = session.get(&config.api_url, &params).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::HttpStatus {
            url: config.api_url.clone(),
            status: status.as_u16(),
        });
    }

    let mut posts: Vec<Post> = response.json().await.map_err(|e| ApiError::Malformed {
        url: config.api_url.clone(),
        reason: e.to_string(),
    })?;

    if posts.is_empty() {
        return Err(ApiError::PostNotFound {
            post_id: post_id.to_string(),
        });
    }
    Ok(posts.remove(0))
}
