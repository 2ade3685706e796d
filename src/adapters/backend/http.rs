use crate::adapters::backend::{BackendResponse, ConnectOptions, OutboundRequest, Transport};
use crate::domain::app::{App, CredentialMaterial};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// HTTP(S) transport shared by every backend. One `reqwest::Client` keeps its
/// connections alive and multiplexes over HTTP/2 where the server offers it.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    default_headers: Vec<(String, String)>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Builds a client for `app`, presenting its certificate as client identity when it has one.
    ///
    /// # Errors
    /// Returns `Error::CredentialRevoked` for an unusable certificate, `Error::Connection` otherwise.
    pub fn connect(
        app: &App,
        base_url: impl Into<String>,
        default_headers: Vec<(String, String)>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().connect_timeout(options.connect_timeout).pool_max_idle_per_host(4);

        if let CredentialMaterial::Certificate { pem } = &app.credential.material {
            let identity = reqwest::Identity::from_pem(pem.as_bytes())
                .map_err(|e| Error::CredentialRevoked(format!("unusable certificate for app {}: {e}", app.id)))?;
            builder = builder.identity(identity);
        }

        let client = builder.build().map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into(), default_headers, closed: AtomicBool::new(false) })
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{path}", self.base_url.trim_end_matches('/'))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[tracing::instrument(level = "debug", skip_all, fields(path = %request.path))]
    async fn write(&self, request: OutboundRequest) -> Result<BackendResponse> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("transport closed".into()));
        }

        let mut builder = self.client.post(self.url_for(&request.path));
        for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().await.map_err(|e| {
            if e.is_timeout() { Error::Timeout } else { Error::Connection(e.to_string()) }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_ascii_lowercase(), v.to_string())))
            .collect();
        let body = response.bytes().await.map_err(|e| Error::Connection(e.to_string()))?.to_vec();

        Ok(BackendResponse { status, headers, body })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

pub(crate) fn bearer(app: &App) -> Result<(String, String)> {
    match &app.credential.material {
        CredentialMaterial::ApiKey { secret } => Ok(("authorization".to_string(), format!("Bearer {secret}"))),
        _ => Err(Error::Configuration(format!("app {} needs an api_key credential", app.id))),
    }
}
