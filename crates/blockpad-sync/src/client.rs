//! Block persistence over the JSON block API.
//!
//! Three calls, one round trip each, no internal retry:
//! - `POST /blocks` creates a block in a meeting
//! - `GET /blocks/{id}` reads the authoritative version and text
//! - `PATCH /blocks/{id}` writes text guarded by the expected version

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::{BlockError, Operation};
use crate::types::{BlockId, MeetingId, Version};

/// Block type every autosaved document is created with.
pub const PARAGRAPH: &str = "paragraph";

/// Body of a create request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NewBlock {
    pub meeting: MeetingId,
    pub parent_block: Option<u64>,
    pub order_no: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub level: u32,
    pub text: String,
}

impl NewBlock {
    /// A top-level paragraph in first position. Only the text varies between
    /// documents.
    pub fn paragraph(meeting: MeetingId, text: impl Into<String>) -> Self {
        Self {
            meeting,
            parent_block: None,
            order_no: 0,
            kind: PARAGRAPH.to_owned(),
            level: 0,
            text: text.into(),
        }
    }
}

/// Identity of a block that was just created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedBlock {
    pub id: BlockId,
    pub version: Version,
    /// True when the server omitted the version and it was assumed.
    pub estimated: bool,
}

/// Authoritative state of a stored block.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct StoredBlock {
    pub version: Version,
    #[serde(default)]
    pub text: String,
}

/// Result of a successful patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchedBlock {
    pub version: Version,
    /// True when the server omitted the version and `expected + 1` was assumed.
    pub estimated: bool,
}

/// The persistence service the autosave pipeline writes through.
///
/// Dropping a returned future cancels the request.
#[trait_variant::make(Send)]
pub trait BlockService: Sync {
    /// Create a block, returning its id and initial version.
    async fn create(&self, block: &NewBlock) -> Result<CreatedBlock, BlockError>;

    /// Fetch the current version and text.
    async fn get(&self, id: &BlockId) -> Result<StoredBlock, BlockError>;

    /// Replace the block text if the server still holds `expected`.
    async fn patch(
        &self,
        id: &BlockId,
        text: &str,
        expected: Version,
    ) -> Result<PatchedBlock, BlockError>;
}

/// Version the server reports in a conflict body.
///
/// The API is inconsistent about where it puts it, so three locations are
/// tried in order:
/// 1. `detail.current.version`
/// 2. `current.version`
/// 3. `version`
pub fn conflict_version(body: &Value) -> Option<Version> {
    body.pointer("/detail/current/version")
        .and_then(version_value)
        .or_else(|| body.pointer("/current/version").and_then(version_value))
        .or_else(|| body.get("version").and_then(version_value))
}

fn version_value(value: &Value) -> Option<Version> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(alias = "pk", alias = "block_id")]
    id: BlockId,
    version: Option<Version>,
}

#[derive(Deserialize)]
struct PatchResponse {
    version: Option<Version>,
}

#[derive(Serialize)]
struct PatchRequest<'a> {
    text: &'a str,
    version: Version,
}

/// [`BlockService`] over HTTP.
#[derive(Clone, Debug)]
pub struct HttpBlockClient {
    client: Client,
    base: Url,
}

impl HttpBlockClient {
    /// Client rooted at `base`; `blocks` is resolved under it.
    pub fn new(base: Url) -> Result<Self, BlockError> {
        Self::with_client(Client::new(), base)
    }

    /// Client with a per-request transport timeout.
    pub fn with_timeout(base: Url, timeout: Option<Duration>) -> Result<Self, BlockError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| BlockError::InvalidEndpoint(e.to_string()))?;
        Self::with_client(client, base)
    }

    /// Build from shared configuration.
    pub fn from_config(config: &blockpad_common::Config) -> Result<Self, BlockError> {
        let base = config
            .endpoint_url()
            .map_err(|e| BlockError::InvalidEndpoint(e.to_string()))?;
        Self::with_timeout(base, config.request_timeout())
    }

    pub fn with_client(client: Client, mut base: Url) -> Result<Self, BlockError> {
        if base.cannot_be_a_base() {
            return Err(BlockError::InvalidEndpoint(base.to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn blocks_url(&self, id: Option<&BlockId>) -> Result<Url, BlockError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BlockError::InvalidEndpoint(self.base.to_string()))?;
            segments.pop_if_empty().push("blocks");
            if let Some(id) = id {
                segments.push(id.as_str());
            }
        }
        Ok(url)
    }
}

fn transport(op: Operation, err: reqwest::Error) -> BlockError {
    BlockError::Transport {
        op,
        message: err.to_string(),
    }
}

async fn read_body(op: Operation, response: Response) -> Result<String, BlockError> {
    response.text().await.map_err(|e| transport(op, e))
}

async fn decode<T: serde::de::DeserializeOwned>(
    op: Operation,
    response: Response,
) -> Result<T, BlockError> {
    let body = read_body(op, response).await?;
    serde_json::from_str(&body).map_err(|e| BlockError::Decode {
        op,
        message: e.to_string(),
    })
}

impl BlockService for HttpBlockClient {
    async fn create(&self, block: &NewBlock) -> Result<CreatedBlock, BlockError> {
        let op = Operation::Create;
        let response = self
            .client
            .post(self.blocks_url(None)?)
            .json(block)
            .send()
            .await
            .map_err(|e| transport(op, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body(op, response).await.unwrap_or_default();
            return Err(BlockError::Create {
                status: status.as_u16(),
                body,
            });
        }

        let created: CreateResponse = decode(op, response).await?;
        Ok(CreatedBlock {
            id: created.id,
            version: created.version.unwrap_or(1),
            estimated: created.version.is_none(),
        })
    }

    async fn get(&self, id: &BlockId) -> Result<StoredBlock, BlockError> {
        let op = Operation::Fetch;
        let response = self
            .client
            .get(self.blocks_url(Some(id))?)
            .send()
            .await
            .map_err(|e| transport(op, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body(op, response).await.unwrap_or_default();
            return Err(BlockError::Fetch {
                id: id.clone(),
                status: status.as_u16(),
                body,
            });
        }

        decode(op, response).await
    }

    async fn patch(
        &self,
        id: &BlockId,
        text: &str,
        expected: Version,
    ) -> Result<PatchedBlock, BlockError> {
        let op = Operation::Patch;
        let response = self
            .client
            .patch(self.blocks_url(Some(id))?)
            .json(&PatchRequest {
                text,
                version: expected,
            })
            .send()
            .await
            .map_err(|e| transport(op, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_body(op, response).await.unwrap_or_default();
            let current_version = serde_json::from_str::<Value>(&body)
                .ok()
                .as_ref()
                .and_then(conflict_version);
            return Err(BlockError::Patch {
                id: id.clone(),
                status: status.as_u16(),
                current_version,
                body,
            });
        }

        // 204 and empty bodies carry no version
        let version = if status == StatusCode::NO_CONTENT {
            None
        } else {
            let body = read_body(op, response).await?;
            if body.trim().is_empty() {
                None
            } else {
                serde_json::from_str::<PatchResponse>(&body)
                    .map_err(|e| BlockError::Decode {
                        op,
                        message: e.to_string(),
                    })?
                    .version
            }
        };
        Ok(PatchedBlock {
            version: version.unwrap_or(expected + 1),
            estimated: version.is_none(),
        })
    }
}
