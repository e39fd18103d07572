use crate::client::config::Config;
use crate::client::consts::AUTHORIZATION_HEADER;
use secrecy::ExposeSecret;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;

pub fn build_request(config: &Config) -> anyhow::Result<Request> {
    let mut request = config.url().into_client_request()?;
    if let Some(token) = config.token() {
        request.headers_mut().insert(
            AUTHORIZATION_HEADER,
            format!("Bearer {}", token.expose_secret()).as_str().parse()?,
        );
    }
    Ok(request)
}
