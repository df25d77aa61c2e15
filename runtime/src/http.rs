//! Default network transport built on `reqwest`.

use fetch_cache_core::request::{Method, RequestBody, RequestDescriptor};
use fetch_cache_core::result::FetchError;
use fetch_cache_core::transport::{HttpDispatcher, HttpFetch, RawResponse};
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Client;
use url::Url;

/// [`HttpFetch`] over a shared `reqwest` client.
///
/// Relative descriptor URLs are joined onto the base URL when one is set.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFetch {
    client: Client,
    base_url: Option<Url>,
}

impl ReqwestFetch {
    /// Transport with a default `reqwest` client and no base URL.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport reusing an existing `reqwest` client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Resolve relative URLs against `base_url`.
    #[must_use]
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    fn resolve(&self, raw: &str) -> Result<Url, FetchError> {
        let resolved = match &self.base_url {
            Some(base) => base.join(raw),
            None => Url::parse(raw),
        };
        resolved.map_err(|e| FetchError::transport(format!("Invalid url {raw}: {e}")))
    }

    fn build(&self, request: &RequestDescriptor) -> Result<reqwest::RequestBuilder, FetchError> {
        let url = self.resolve(request.url())?;
        let mut builder = self.client.request(to_reqwest(request.method()), url);

        for (name, value) in request.headers() {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body() {
            None => builder,
            Some(RequestBody::Text(text)) => builder.body(text.clone()),
            Some(RequestBody::Form(fields)) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(fields)
                    .finish();
                builder
                    .header("content-type", "application/x-www-form-urlencoded")
                    .body(encoded)
            },
            Some(RequestBody::Json(value)) => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| FetchError::transport(format!("Unserializable body: {e}")))?;
                builder.header("content-type", "application/json").body(bytes)
            },
        };

        Ok(builder)
    }
}

const fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Head => reqwest::Method::HEAD,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Options => reqwest::Method::OPTIONS,
    }
}

impl HttpFetch for ReqwestFetch {
    fn fetch(
        &self,
        request: &RequestDescriptor,
    ) -> BoxFuture<'static, Result<RawResponse, FetchError>> {
        let built = self.build(request);
        let url = request.url().to_string();

        async move {
            let response = built?
                .send()
                .await
                .map_err(|e| FetchError::transport(format!("Failed to fetch {url}: {e}")))?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect();
            let body = response
                .bytes()
                .await
                .map_err(|e| FetchError::transport(format!("Failed to read {url}: {e}")))?;

            tracing::trace!(url = %url, status, "Response received");
            Ok(RawResponse {
                status,
                headers,
                body: body.to_vec(),
            })
        }
        .boxed()
    }
}

/// Dispatcher decoding JSON responses from a default [`ReqwestFetch`].
#[must_use]
pub fn default_dispatcher() -> HttpDispatcher<ReqwestFetch> {
    HttpDispatcher::new(ReqwestFetch::new())
}
