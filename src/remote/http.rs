//! HTTP client stack for the CardDAV directory: TLS policy and auth scheme.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use digest_auth::{AuthContext, HttpMethod};
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::{Client, Error as ClientError};
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tower_http::auth::AddAuthorization;
use tower_service::Service;

use crate::config::AuthMode;
use crate::remote::DirectoryError;

/// Plain HTTPS client, before authentication is layered on.
pub type HttpsClient = Client<HttpsConnector<HttpConnector>, String>;

/// HTTP client carrying the configured credentials.
#[derive(Clone, Debug)]
pub enum AuthClient {
    Basic(AddAuthorization<HttpsClient>),
    Digest(DigestClient),
}

impl AuthClient {
    pub fn new(
        mode: AuthMode,
        username: &str,
        password: &str,
        verify_tls: bool,
    ) -> Result<Self, DirectoryError> {
        let http_client = https_client(verify_tls)?;
        Ok(match mode {
            AuthMode::Basic => {
                AuthClient::Basic(AddAuthorization::basic(http_client, username, password))
            }
            AuthMode::Digest => AuthClient::Digest(DigestClient {
                inner: http_client,
                credentials: Arc::new(Credentials {
                    username: username.to_string(),
                    password: password.to_string(),
                }),
            }),
        })
    }
}

impl Service<Request<String>> for AuthClient {
    type Response = Response<Incoming>;
    type Error = ClientError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self {
            AuthClient::Basic(client) => Service::<Request<String>>::poll_ready(client, cx),
            AuthClient::Digest(client) => {
                Service::<Request<String>>::poll_ready(&mut client.inner, cx)
            }
        }
    }

    fn call(&mut self, request: Request<String>) -> Self::Future {
        match self {
            AuthClient::Basic(client) => Box::pin(client.call(request)),
            AuthClient::Digest(client) => Box::pin(client.clone().send(request)),
        }
    }
}

struct Credentials {
    username: String,
    password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Digest authentication: the request goes out bare, and a `401` carrying a
/// `Digest` challenge is answered by replaying it once with credentials.
#[derive(Clone, Debug)]
pub struct DigestClient {
    inner: HttpsClient,
    credentials: Arc<Credentials>,
}

impl DigestClient {
    async fn send(self, request: Request<String>) -> Result<Response<Incoming>, ClientError> {
        let (parts, body) = request.into_parts();
        let response = self.inner.request(rebuild(&parts, &body, None)).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        // Without a usable challenge the 401 is passed through unchanged.
        let Some(authorization) = self.answer_challenge(&parts, &body, &response) else {
            return Ok(response);
        };
        drop(response);
        self.inner
            .request(rebuild(&parts, &body, Some(authorization)))
            .await
    }

    fn answer_challenge<B>(
        &self,
        parts: &Parts,
        body: &str,
        response: &Response<B>,
    ) -> Option<HeaderValue> {
        let challenge = response
            .headers()
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find(|value| is_digest_challenge(value))?;

        let mut prompt = digest_auth::parse(challenge).ok()?;
        let uri = parts
            .uri
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        let context = AuthContext::new_with_method(
            self.credentials.username.as_str(),
            self.credentials.password.as_str(),
            uri,
            Some(body.as_bytes()),
            HttpMethod::from(parts.method.as_str()),
        );
        let answer = prompt.respond(&context).ok()?;
        HeaderValue::from_str(&answer.to_header_string()).ok()
    }
}

fn is_digest_challenge(value: &str) -> bool {
    value
        .trim_start()
        .get(..6)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("digest"))
}

fn rebuild(parts: &Parts, body: &str, authorization: Option<HeaderValue>) -> Request<String> {
    let mut request = Request::new(body.to_string());
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    if let Some(value) = authorization {
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    request
}

/// Build the HTTPS client. With `verify_tls` off, any server certificate is
/// accepted; handshake signatures are still checked.
pub fn https_client(verify_tls: bool) -> Result<HttpsClient, DirectoryError> {
    let builder = HttpsConnectorBuilder::new();
    let https_connector = if verify_tls {
        builder
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build()
    } else {
        builder
            .with_tls_config(insecure_tls_config()?)
            .https_or_http()
            .enable_http1()
            .build()
    };

    Ok(Client::builder(TokioExecutor::new()).build(https_connector))
}

fn insecure_tls_config() -> Result<rustls::ClientConfig, DirectoryError> {
    let provider = Arc::new(ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|err| DirectoryError::Tls(err.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();
    Ok(config)
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_client() -> DigestClient {
        DigestClient {
            inner: https_client(true).unwrap(),
            credentials: Arc::new(Credentials {
                username: "alice".to_string(),
                password: "secret".to_string(),
            }),
        }
    }

    #[test]
    fn test_is_digest_challenge() {
        assert!(is_digest_challenge(r#"Digest realm="abook", nonce="abc""#));
        assert!(is_digest_challenge(r#"  digest realm="abook""#));
        assert!(!is_digest_challenge(r#"Basic realm="abook""#));
        assert!(!is_digest_challenge("Dig"));
    }

    #[test]
    fn test_rebuild_keeps_request_and_adds_authorization() {
        let original = Request::builder()
            .method("REPORT")
            .uri("https://dav.example.com/abook/")
            .header("Depth", "1")
            .body("<xml/>".to_string())
            .unwrap();
        let (parts, body) = original.into_parts();

        let rebuilt = rebuild(&parts, &body, Some(HeaderValue::from_static("Digest x")));
        assert_eq!(rebuilt.method().as_str(), "REPORT");
        assert_eq!(rebuilt.uri(), "https://dav.example.com/abook/");
        assert_eq!(rebuilt.headers()["Depth"], "1");
        assert_eq!(rebuilt.headers()[AUTHORIZATION], "Digest x");
        assert_eq!(rebuilt.body(), "<xml/>");
    }

    #[test]
    fn test_digest_answer_from_challenge() {
        let client = digest_client();
        let request = Request::builder()
            .method("PROPFIND")
            .uri("https://dav.example.com/abook/")
            .body(String::new())
            .unwrap();
        let (parts, body) = request.into_parts();
        let challenge = Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(
                WWW_AUTHENTICATE,
                r#"Digest realm="abook", qop="auth", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093""#,
            )
            .body(())
            .unwrap();

        let header = client
            .answer_challenge(&parts, &body, &challenge)
            .expect("challenge should be answered");
        let header = header.to_str().unwrap();
        assert!(header.starts_with("Digest "));
        assert!(header.contains("alice"));
        assert!(header.contains("/abook/"));
    }

    #[test]
    fn test_basic_challenge_is_not_answered() {
        let client = digest_client();
        let (parts, body) = Request::new(String::new()).into_parts();
        let challenge = Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(WWW_AUTHENTICATE, r#"Basic realm="abook""#)
            .body(())
            .unwrap();

        assert!(client.answer_challenge(&parts, &body, &challenge).is_none());
    }

    #[test]
    fn test_insecure_tls_config_builds() {
        assert!(insecure_tls_config().is_ok());
    }
}
