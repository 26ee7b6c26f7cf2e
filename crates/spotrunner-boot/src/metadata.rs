use reqwest::StatusCode;

const TOKEN_PATH: &str = "/latest/api/token";
const INSTANCE_ACTION_PATH: &str = "/latest/meta-data/spot/instance-action";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECS: u32 = 21600;

/// Minimal client of the instance metadata service (session oriented, IMDSv2).
pub struct MetadataClient {
    client: reqwest::Client,
    base_url: String,
}

impl MetadataClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn session_token(&self) -> crate::Result<String> {
        let token = self
            .client
            .put(format!("{}{TOKEN_PATH}", self.base_url))
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS.to_string())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(token)
    }

    /// Returns the pending spot interruption notice, if there is one.
    ///
    /// The metadata service answers 404 until the instance is scheduled for reclamation.
    pub async fn interruption_notice(&self) -> crate::Result<Option<String>> {
        let token = self.session_token().await?;
        let response = self
            .client
            .get(format!("{}{INSTANCE_ACTION_PATH}", self.base_url))
            .header(TOKEN_HEADER, token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.error_for_status()?.text().await?;
        Ok(Some(body))
    }
}
