//! Blob storage holding cross-region staged copies

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use super::{header_str, AzureApi, TokenScope};
use crate::agents::asset_scan::errors::ProviderError;
use crate::agents::asset_scan::transfer::{AccessUrl, CopyProgress, CopyStatus, StagedCopyStore};

const STORAGE_API_VERSION: &str = "2021-08-06";

#[derive(Debug, Deserialize)]
#[serde(rename = "Error")]
struct StorageErrorBody {
    #[serde(rename = "Code")]
    code: String,
    #[serde(rename = "Message", default)]
    message: String,
}

/// Map a failed Storage response. The service reports its error code both
/// in `x-ms-error-code` and in an XML body; HEAD responses only carry the
/// header.
pub(crate) fn parse_storage_error(
    operation: &str,
    status: u16,
    header_code: Option<&str>,
    body: &str,
) -> ProviderError {
    match quick_xml::de::from_str::<StorageErrorBody>(body) {
        Ok(err) => ProviderError::api(operation, status, Some(&err.code), err.message.trim()),
        Err(_) => {
            let message = if body.trim().is_empty() {
                format!("status {}", status)
            } else {
                body.to_string()
            };
            ProviderError::api(operation, status, header_code, message)
        }
    }
}

/// Container in the destination-region storage account
pub struct AzureBlobStore {
    api: AzureApi,
}

impl AzureBlobStore {
    pub fn new(api: AzureApi) -> Self {
        Self { api }
    }

    fn request(&self, method: reqwest::Method, name: &str) -> reqwest::RequestBuilder {
        self.api
            .http()
            .request(method, self.object_url(name))
            .header("x-ms-version", STORAGE_API_VERSION)
    }
}

#[async_trait]
impl StagedCopyStore for AzureBlobStore {
    async fn copy_status(&self, name: &str) -> Result<CopyProgress, ProviderError> {
        let operation = "getting staged copy";
        let response = self
            .api
            .send(operation, TokenScope::Storage, self.request(reqwest::Method::HEAD, name))
            .await?;

        let headers = response.headers();
        let raw = header_str(headers, "x-ms-copy-status")
            .ok_or_else(|| ProviderError::malformed(operation, "blob has no copy status"))?;
        let status = CopyStatus::parse(&raw).ok_or_else(|| {
            ProviderError::malformed(operation, format!("unknown copy status {:?}", raw))
        })?;

        let progress = header_str(headers, "x-ms-copy-progress");
        debug!(name = %name, status = %raw, progress = ?progress, "Observed staged copy");

        Ok(CopyProgress::with_progress(status, progress.as_deref()))
    }

    async fn start_copy(&self, name: &str, source: AccessUrl) -> Result<(), ProviderError> {
        let request = self
            .request(reqwest::Method::PUT, name)
            .header("x-ms-copy-source", source.expose())
            .header(reqwest::header::CONTENT_LENGTH, 0);

        self.api
            .send("starting staged copy", TokenScope::Storage, request)
            .await?;

        info!(name = %name, "Started staged copy");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ProviderError> {
        let request = self
            .request(reqwest::Method::DELETE, name)
            .header("x-ms-delete-snapshots", "include");

        self.api
            .send("deleting staged copy", TokenScope::Storage, request)
            .await?;
        Ok(())
    }

    fn object_url(&self, name: &str) -> String {
        let config = self.api.config();
        format!(
            "https://{}.blob.core.windows.net/{}/{}",
            config.storage_account,
            config.storage_container,
            urlencoding::encode(name)
        )
    }

    fn storage_account_id(&self) -> String {
        self.api.config().storage_account_id()
    }
}
