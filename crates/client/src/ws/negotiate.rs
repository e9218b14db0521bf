//! `POST {hub}/negotiate` before the WebSocket upgrade.

use courselink_shared::NegotiateResponse;
use url::Url;

use crate::error::ConnectionError;

/// Redirects followed before giving up.
pub const MAX_REDIRECTS: usize = 5;

/// Where to open the socket after negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Hub URL, carrying the `id` query parameter when the server issued one.
    pub url: Url,
    /// Token to use for the upgrade. A redirect may replace the caller's.
    pub access_token: Option<String>,
}

/// Negotiate a WebSocket connection with the hub at `hub_url`.
pub async fn negotiate(
    http: &reqwest::Client,
    hub_url: &Url,
    access_token: Option<&str>,
) -> Result<Negotiated, ConnectionError> {
    let mut url = hub_url.clone();
    let mut token = access_token.map(str::to_string);

    for _ in 0..=MAX_REDIRECTS {
        let endpoint = negotiate_endpoint(&url)?;
        crate::log_debug!("Negotiating with {}", url);

        let mut request = http.post(endpoint);
        if let Some(token) = token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| ConnectionError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ConnectionError::Unauthorized(format!(
                "negotiate rejected with HTTP {}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            return Err(ConnectionError::Negotiate(format!(
                "unexpected HTTP {}",
                status.as_u16()
            )));
        }

        let body: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| ConnectionError::Negotiate(format!("malformed response: {e}")))?;

        if let Some(error) = body.error {
            return Err(ConnectionError::Negotiate(error));
        }

        if let Some(redirect) = body.url {
            url = Url::parse(&redirect)
                .map_err(|e| ConnectionError::Negotiate(format!("bad redirect url '{redirect}': {e}")))?;
            if body.access_token.is_some() {
                token = body.access_token;
            }
            crate::log_info!("Negotiate redirected to {}", url);
            continue;
        }

        if !body.supports_websockets() {
            return Err(ConnectionError::Negotiate(
                "server does not offer WebSockets with text frames".to_string(),
            ));
        }

        // Version 1 servers hand out a separate token; older ones reuse the id.
        if let Some(id) = body.connection_token.or(body.connection_id) {
            url.query_pairs_mut().append_pair("id", &id);
        }
        return Ok(Negotiated {
            url,
            access_token: token,
        });
    }

    Err(ConnectionError::Negotiate(format!(
        "more than {MAX_REDIRECTS} redirects"
    )))
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping any existing query.
pub(crate) fn negotiate_endpoint(hub_url: &Url) -> Result<Url, ConnectionError> {
    let mut endpoint = hub_url.clone();
    let scheme = match hub_url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(ConnectionError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|()| ConnectionError::InvalidUrl(format!("cannot use scheme '{scheme}'")))?;
    let path = format!("{}/negotiate", hub_url.path().trim_end_matches('/'));
    endpoint.set_path(&path);
    endpoint
        .query_pairs_mut()
        .append_pair("negotiateVersion", "1");
    Ok(endpoint)
}
