//! PostgREST Remote Store
//!
//! Talks to a Supabase-style `/rest/v1` endpoint. Transport failures are
//! reported as `Unavailable` so writes pause instead of failing.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::traits::{RemoteCollection, RemoteStore};
use super::{RemoteError, RemoteResult};
use crate::config::RemoteConfig;
use crate::domain::{Bucket, Entity, EntityId, Subscription, Transaction, TransferRequest};
use crate::error::{CacheError, CacheResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

struct Endpoint {
    client: reqwest::Client,
    base: String,
    api_key: String,
    access_token: Option<String>,
}

impl Endpoint {
    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        self.client
            .request(method, format!("{}/{}", self.base, table))
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn rows<T: DeserializeOwned>(&self, builder: RequestBuilder) -> RemoteResult<Vec<T>> {
        let response = builder.send().await.map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| RemoteError::rejected(format!("unexpected response body: {}", e)))
    }

    async fn insert_rows<T: DeserializeOwned, P: Serialize + ?Sized>(&self, table: &str, rows: &P) -> RemoteResult<Vec<T>> {
        let builder = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(rows);
        self.rows(builder).await
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        RemoteError::unavailable(e.to_string())
    } else {
        RemoteError::rejected(e.to_string())
    }
}

async fn check_status(response: Response) -> RemoteResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_status(status, &body))
}

/// Map a non-success response to the boundary error
fn error_from_status(status: StatusCode, body: &str) -> RemoteError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| if body.is_empty() { status.to_string() } else { body.to_string() });

    match status {
        StatusCode::NOT_FOUND => RemoteError::not_found(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            RemoteError::unavailable(message)
        }
        _ => RemoteError::rejected(message),
    }
}

fn id_filter(id: &EntityId) -> [(&'static str, String); 1] {
    [("id", format!("eq.{}", id))]
}

/// One table behind the endpoint
pub struct RestTable<T> {
    table: &'static str,
    order: Option<&'static str>,
    endpoint: Arc<Endpoint>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> RestTable<T> {
    fn new(table: &'static str, order: Option<&'static str>, endpoint: Arc<Endpoint>) -> Self {
        Self {
            table,
            order,
            endpoint,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Entity> RemoteCollection<T> for RestTable<T> {
    async fn list(&self) -> RemoteResult<Vec<T>> {
        let mut builder = self.endpoint.request(Method::GET, self.table).query(&[("select", "*")]);
        if let Some(order) = self.order {
            builder = builder.query(&[("order", order)]);
        }
        self.endpoint.rows(builder).await
    }

    async fn insert(&self, draft: &T::Draft) -> RemoteResult<T> {
        let mut rows: Vec<T> = self.endpoint.insert_rows(self.table, std::slice::from_ref(draft)).await?;
        rows.pop()
            .ok_or_else(|| RemoteError::rejected(format!("insert into {} returned no row", self.table)))
    }

    async fn update(&self, id: &EntityId, patch: &T::Patch) -> RemoteResult<T> {
        let builder = self
            .endpoint
            .request(Method::PATCH, self.table)
            .query(&id_filter(id))
            .header("Prefer", "return=representation")
            .json(patch);
        let mut rows: Vec<T> = self.endpoint.rows(builder).await?;
        rows.pop()
            .ok_or_else(|| RemoteError::not_found(format!("{} {}", self.table, id)))
    }

    async fn delete(&self, id: &EntityId) -> RemoteResult<()> {
        let builder = self.endpoint.request(Method::DELETE, self.table).query(&id_filter(id));
        let response = builder.send().await.map_err(transport_error)?;
        check_status(response).await?;
        Ok(())
    }
}

/// Remote store backed by a PostgREST endpoint
pub struct RestRemote {
    endpoint: Arc<Endpoint>,
    buckets: RestTable<Bucket>,
    transactions: RestTable<Transaction>,
    subscriptions: RestTable<Subscription>,
}

impl RestRemote {
    pub fn new(config: &RemoteConfig) -> CacheResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CacheError::Config(format!("http client: {}", e)))?;
        let endpoint = Arc::new(Endpoint {
            client,
            base: format!("{}/rest/v1", config.url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
        });
        Ok(Self {
            buckets: RestTable::new("buckets", Some("created_at.asc"), endpoint.clone()),
            transactions: RestTable::new("transactions", Some("date.desc"), endpoint.clone()),
            subscriptions: RestTable::new("subscriptions", None, endpoint.clone()),
            endpoint,
        })
    }
}

#[async_trait]
impl RemoteStore for RestRemote {
    fn buckets(&self) -> &dyn RemoteCollection<Bucket> {
        &self.buckets
    }

    fn transactions(&self) -> &dyn RemoteCollection<Transaction> {
        &self.transactions
    }

    fn subscriptions(&self) -> &dyn RemoteCollection<Subscription> {
        &self.subscriptions
    }

    async fn transfer(&self, request: &TransferRequest) -> RemoteResult<Vec<Transaction>> {
        self.endpoint.insert_rows("transactions", &request.legs()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(error_from_status(StatusCode::NOT_FOUND, "").is_not_found());
        assert!(error_from_status(StatusCode::SERVICE_UNAVAILABLE, "").is_unavailable());
        assert_eq!(
            error_from_status(StatusCode::BAD_REQUEST, r#"{"code":"23502","message":"null value in column \"name\""}"#),
            RemoteError::rejected("null value in column \"name\"")
        );
    }

    #[test]
    fn test_plain_body_kept_as_message() {
        let err = error_from_status(StatusCode::FORBIDDEN, "permission denied");
        assert_eq!(err, RemoteError::rejected("permission denied"));
    }

    #[test]
    fn test_base_url_normalized() {
        let remote = RestRemote::new(&RemoteConfig {
            url: "https://example.supabase.co/".to_string(),
            api_key: "anon".to_string(),
            access_token: None,
        })
        .unwrap();
        assert_eq!(remote.endpoint.base, "https://example.supabase.co/rest/v1");
    }

    #[test]
    fn test_id_filter_uses_eq_operator() {
        assert_eq!(id_filter(&EntityId::from("abc"))[0].1, "eq.abc");
    }
}
