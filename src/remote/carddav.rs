//! CardDAV directory implementation using libdav.

use std::future::Future;
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::{Method, Request, StatusCode, Uri};
use libdav::carddav::{
    CardDavClient, FindAddressBookHomeSet, FindAddressBooks, GetAddressBookResources,
};
use libdav::dav::WebDavClient;
use percent_encoding::percent_decode_str;
use tower_service::Service;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::remote::http::AuthClient;
use crate::remote::{Directory, DirectoryError, FetchedCard, RecordError, RecordHandle};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/></d:prop></d:propfind>"#;

/// CardDAV address book reached over libdav
pub struct CardDavDirectory {
    client: CardDavClient<AuthClient>,
    address_book_href: String,
    timeout: Duration,
}

impl CardDavDirectory {
    /// Connect to the address book described by `config`.
    ///
    /// The URL names the address book collection itself, unless
    /// `config.address_book` is set, in which case it is a server root and
    /// the book is located by service discovery.
    pub async fn connect(config: &SyncConfig) -> Result<Self, DirectoryError> {
        let uri: Uri = config
            .url
            .parse()
            .map_err(|err: http::uri::InvalidUri| DirectoryError::InvalidUrl {
                url: config.url.clone(),
                reason: err.to_string(),
            })?;
        if uri.host().is_none() {
            return Err(DirectoryError::InvalidUrl {
                url: config.url.clone(),
                reason: "URL has no host".to_string(),
            });
        }

        let http_client = AuthClient::new(
            config.auth_mode,
            &config.user,
            &config.password,
            config.verify_tls,
        )?;
        preflight(&http_client, &uri, config.timeout).await?;

        let webdav = WebDavClient::new(uri.clone(), http_client);
        let (client, address_book_href) = match &config.address_book {
            Some(name) => {
                let client = timed(
                    "service discovery",
                    config.timeout,
                    CardDavClient::bootstrap_via_service_discovery(webdav),
                )
                .await?;
                let href = resolve_address_book(&client, name, config.timeout).await?;
                (client, href)
            }
            None => (CardDavClient::new(webdav), uri.path().to_string()),
        };
        debug!(address_book = %address_book_href, "connected to CardDAV server");

        Ok(Self {
            client,
            address_book_href,
            timeout: config.timeout,
        })
    }
}

impl Directory for CardDavDirectory {
    async fn list_handles(&self) -> Result<Vec<RecordHandle>, DirectoryError> {
        let response = timed(
            "listing the address book",
            self.timeout,
            self.client
                .request(GetAddressBookResources::new(&self.address_book_href)),
        )
        .await?;

        Ok(response
            .resources
            .into_iter()
            .map(|resource| RecordHandle {
                etag: resource.content.ok().map(|content| content.etag),
                href: resource.href,
            })
            .collect())
    }

    async fn fetch_cards(&self, hrefs: &[&str]) -> Result<Vec<FetchedCard>, DirectoryError> {
        if hrefs.is_empty() {
            return Ok(vec![]);
        }

        // addressbook-multiget REPORT for the whole batch
        let stage = format!("fetching {} card(s) starting at {}", hrefs.len(), hrefs[0]);
        let response = timed(
            stage,
            self.timeout,
            self.client.request(
                GetAddressBookResources::new(&self.address_book_href)
                    .with_hrefs(hrefs.iter().copied()),
            ),
        )
        .await?;

        let returned: Vec<(String, Result<String, RecordError>)> = response
            .resources
            .into_iter()
            .map(|resource| {
                let body = resource
                    .content
                    .map(|content| content.data)
                    .map_err(|status| RecordError::from_status(status.as_u16()));
                (normalize_href(&resource.href), body)
            })
            .collect();

        Ok(hrefs
            .iter()
            .map(|href| {
                let wanted = normalize_href(href);
                let body = returned
                    .iter()
                    .find(|(returned_href, _)| *returned_href == wanted)
                    .map(|(_, body)| body.clone())
                    .unwrap_or(Err(RecordError::NotFound));
                FetchedCard {
                    href: href.to_string(),
                    body,
                }
            })
            .collect())
    }
}

/// Run a libdav request under the configured timeout.
async fn timed<T, E, F>(
    stage: impl Into<String>,
    after: Duration,
    request: F,
) -> Result<T, DirectoryError>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let stage = stage.into();
    match tokio::time::timeout(after, request).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(DirectoryError::transport(stage, err)),
        Err(_) => Err(DirectoryError::Timeout { stage, after }),
    }
}

/// `PROPFIND Depth: 0` on the configured URL, to tell bad credentials and a
/// wrong URL apart from transport trouble before any real work starts.
async fn preflight(
    http_client: &AuthClient,
    uri: &Uri,
    after: Duration,
) -> Result<(), DirectoryError> {
    let method = Method::from_bytes(b"PROPFIND")
        .map_err(|err| DirectoryError::transport("building PROPFIND", err))?;
    let request = Request::builder()
        .method(method)
        .uri(uri.clone())
        .header("Depth", "0")
        .header(CONTENT_TYPE, "application/xml; charset=utf-8")
        .body(PROPFIND_BODY.to_string())
        .map_err(|err| DirectoryError::transport("building PROPFIND", err))?;

    let mut service = http_client.clone();
    let response = timed("connecting to the server", after, async move {
        std::future::poll_fn(|cx| service.poll_ready(cx)).await?;
        service.call(request).await
    })
    .await?;

    match response.status() {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DirectoryError::Auth {
            url: uri.to_string(),
            status: response.status().as_u16(),
        }),
        StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(uri.to_string())),
        status => {
            debug!(%status, "preflight answered");
            Ok(())
        }
    }
}

/// Resolve the address book href from the configured name
async fn resolve_address_book(
    client: &CardDavClient<AuthClient>,
    address_book_name: &str,
    after: Duration,
) -> Result<String, DirectoryError> {
    let principal = timed(
        "finding the current user principal",
        after,
        client.find_current_user_principal(),
    )
    .await?
    .ok_or_else(|| DirectoryError::NotFound("current user principal".to_string()))?;

    let home_set_response = timed(
        "finding the address book home set",
        after,
        client.request(FindAddressBookHomeSet::new(&principal)),
    )
    .await?;
    let home_uri = home_set_response
        .home_sets
        .into_iter()
        .next()
        .ok_or_else(|| DirectoryError::NotFound("address book home set".to_string()))?;

    let addressbooks_response = timed(
        "listing address books",
        after,
        client.request(FindAddressBooks::new(&home_uri)),
    )
    .await?;
    let hrefs: Vec<String> = addressbooks_response
        .addressbooks
        .into_iter()
        .map(|ab| ab.href)
        .collect();

    pick_address_book(&hrefs, address_book_name)
        .ok_or_else(|| DirectoryError::NotFound(format!("no address books under {home_uri}")))
}

/// Match by last path segment, then by substring, then fall back to the
/// first book.
fn pick_address_book(hrefs: &[String], name: &str) -> Option<String> {
    let exact = hrefs.iter().find(|href| {
        let segment = href.trim_end_matches('/').rsplit('/').next().unwrap_or("");
        segment.eq_ignore_ascii_case(name)
    });
    if let Some(href) = exact {
        return Some(href.clone());
    }

    let needle = name.to_lowercase();
    if let Some(href) = hrefs.iter().find(|href| href.to_lowercase().contains(&needle)) {
        return Some(href.clone());
    }

    let first = hrefs.first()?;
    warn!("address book '{name}' not found, using '{first}'");
    Some(first.clone())
}

/// Reduce an href to a comparable path: strip scheme and authority, decode
/// percent escapes.
fn normalize_href(href: &str) -> String {
    let path = match href.parse::<Uri>() {
        Ok(uri) if uri.scheme().is_some() => uri.path().to_string(),
        _ => href.to_string(),
    };
    percent_decode_str(&path).decode_utf8_lossy().into_owned()
}
