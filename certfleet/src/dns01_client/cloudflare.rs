use std::fmt;

use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::dns01_client::Record;

use super::Dns01Api;

const CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";
const CHALLENGE_TTL: u32 = 120;

#[derive(Clone, Serialize, Deserialize)]
pub struct CloudflareClient {
    zone_id: String,
    api_token: String,
    #[serde(skip)]
    http: Client,
}

impl fmt::Debug for CloudflareClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudflareClient")
            .field("zone_id", &self.zone_id)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

impl CloudflareClient {
    pub fn new(zone_id: String, api_token: String) -> Self {
        Self {
            zone_id,
            api_token,
            http: Client::new(),
        }
    }

    fn records_url(&self) -> String {
        format!("{CLOUDFLARE_API_URL}/zones/{}/dns_records", self.zone_id)
    }
}

impl Dns01Api for CloudflareClient {
    async fn add_txt_record(&self, domain: &str, content: &str) -> Result<String> {
        let response = self
            .http
            .post(self.records_url())
            .bearer_auth(&self.api_token)
            .json(&json!({
                "type": "TXT",
                "name": domain,
                "content": content,
                "ttl": CHALLENGE_TTL,
            }))
            .send()
            .await
            .context("failed to send create record request")?;

        if !response.status().is_success() {
            bail!(
                "failed to create acme challenge: {}",
                response.text().await?
            );
        }

        #[derive(Deserialize)]
        struct Response {
            result: ApiResult,
        }

        #[derive(Deserialize)]
        struct ApiResult {
            id: String,
        }

        let response: Response = response.json().await.context("failed to parse response")?;

        Ok(response.result.id)
    }

    async fn remove_record(&self, record_id: &str) -> Result<()> {
        let url = format!("{}/{record_id}", self.records_url());

        let response = self
            .http
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("failed to send delete record request")?;

        if !response.status().is_success() {
            bail!(
                "failed to remove acme challenge: {}",
                response.text().await?
            );
        }

        Ok(())
    }

    async fn get_records(&self, domain: &str) -> Result<Vec<Record>> {
        let response = self
            .http
            .get(self.records_url())
            .query(&[("name", domain)])
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("failed to send list records request")?;

        if !response.status().is_success() {
            bail!("failed to get dns records: {}", response.text().await?);
        }

        #[derive(Deserialize, Debug)]
        struct CloudflareResponse {
            result: Vec<Record>,
        }

        let response: CloudflareResponse =
            response.json().await.context("failed to parse response")?;

        // The name filter is exact on the API side, but be strict anyway.
        Ok(response
            .result
            .into_iter()
            .filter(|record| record.name.eq_ignore_ascii_case(domain))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_client() -> CloudflareClient {
        CloudflareClient::new(
            std::env::var("CLOUDFLARE_ZONE_ID").expect("CLOUDFLARE_ZONE_ID not set"),
            std::env::var("CLOUDFLARE_API_TOKEN").expect("CLOUDFLARE_API_TOKEN not set"),
        )
    }

    fn random_subdomain() -> String {
        format!(
            "_acme-challenge.{}.{}",
            rand::random::<u64>(),
            std::env::var("TEST_DOMAIN").expect("TEST_DOMAIN not set"),
        )
    }

    async fn txt_records(client: &CloudflareClient, domain: &str) -> Vec<Record> {
        client
            .get_records(domain)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.r#type == "TXT")
            .collect()
    }

    #[test]
    fn debug_output_hides_token() {
        let client = CloudflareClient::new("zone".into(), "secret-token".into());
        let printed = format!("{client:?}");
        assert!(printed.contains("zone"));
        assert!(!printed.contains("secret-token"));
    }

    #[test]
    fn deserializes_from_zone_config() {
        let client: super::super::Dns01Client = serde_json::from_str(
            r#"{"cloudflare": {"zone_id": "abc", "api_token": "def"}}"#,
        )
        .unwrap();
        let super::super::Dns01Client::Cloudflare(client) = client;
        assert_eq!(client.zone_id, "abc");
        assert_eq!(client.api_token, "def");
    }

    #[tokio::test]
    #[ignore = "needs CLOUDFLARE_ZONE_ID, CLOUDFLARE_API_TOKEN and TEST_DOMAIN"]
    async fn can_add_txt_record() {
        let client = create_client();
        let subdomain = random_subdomain();
        let record_id = client
            .add_txt_record(&subdomain, "1234567890")
            .await
            .unwrap();
        let record = txt_records(&client, &subdomain).await;
        assert_eq!(record[0].id, record_id);
        assert_eq!(record[0].content, "1234567890");
        client.remove_record(&record_id).await.unwrap();
        assert!(txt_records(&client, &subdomain).await.is_empty());
    }

    #[tokio::test]
    #[ignore = "needs CLOUDFLARE_ZONE_ID, CLOUDFLARE_API_TOKEN and TEST_DOMAIN"]
    async fn can_remove_txt_records() {
        let client = create_client();
        let subdomain = random_subdomain();
        client
            .add_txt_record(&subdomain, "1234567890")
            .await
            .unwrap();
        client.remove_txt_records(&subdomain).await.unwrap();
        assert!(txt_records(&client, &subdomain).await.is_empty());
    }
}
