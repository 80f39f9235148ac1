use crate::errors::{AppError, AppResult};
use reqwest::multipart::{Form, Part};

/// Parameters for one delegated resize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeRequest {
    pub size: u32,
    pub quality: u8,
    pub heic: bool,
}

impl ResizeRequest {
    pub fn url(&self, service: &str) -> String {
        let mut url = format!(
            "{}/?size={}&quality={}",
            service.trim_end_matches('/'),
            self.size,
            self.quality
        );
        if self.heic {
            url.push_str("&format=heic");
        }
        url
    }
}

/// Uploads the source as multipart field `file` and returns the resized bytes.
pub async fn resize(
    client: &reqwest::Client,
    service: &str,
    request: &ResizeRequest,
    file_name: String,
    bytes: Vec<u8>,
) -> AppResult<Vec<u8>> {
    let form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));
    let response = client
        .post(request.url(service))
        .multipart(form)
        .send()
        .await
        .map_err(|e| AppError::Generation(format!("resize service request failed: {}", e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Generation(format!(
            "resize service returned {}: {}",
            status,
            body.trim()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| AppError::Generation(format!("resize service body: {}", e)))?;
    if bytes.is_empty() {
        return Err(AppError::Generation("resize service returned no data".to_string()));
    }
    Ok(bytes.to_vec())
}
