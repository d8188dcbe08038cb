//! OAuth 1.0 (HMAC-SHA1) against the GG API.
//!
//! The GG number is the consumer key and the account password the consumer
//! secret. Obtaining an access token is three requests: a signed
//! `request_token`, an `authorize` form post carrying the credentials, and a
//! signed `access_token` exchange using the authorized request token.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use rand::Rng;
use rand::distr::Alphanumeric;
use reqwest::{Client, Method, Response};
use serde::Deserialize;
use sha1::Sha1;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{GgError, Result};

type HmacSha1 = Hmac<Sha1>;

/// RFC 3986 unreserved characters stay literal, everything else is escaped.
const OAUTH_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

const DEFAULT_CALLBACK: &str = "http://www.mojageneracja.pl";

pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE).to_string()
}

#[derive(Debug, Clone)]
pub struct Consumer {
    pub key: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Token {
    #[serde(rename = "oauth_token")]
    pub token: String,
    #[serde(rename = "oauth_token_secret")]
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub request_token: Url,
    pub authorize: Url,
    pub access_token: Url,
    pub callback: String,
}

impl OAuthEndpoints {
    pub fn from_api_base(api_base: &str) -> Result<Self> {
        let base = Url::parse(&format!("{}/", api_base.trim_end_matches('/')))?;
        Ok(Self {
            request_token: base.join("request_token")?,
            authorize: base.join("authorize")?,
            access_token: base.join("access_token")?,
            callback: DEFAULT_CALLBACK.to_string(),
        })
    }
}

/// Per-request values that must be unique; tests pin them.
#[derive(Debug, Clone)]
pub struct Nonce {
    pub nonce: String,
    pub timestamp: i64,
}

impl Nonce {
    pub fn fresh() -> Self {
        let nonce = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self {
            nonce,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// The URL without query or fragment, as it enters the signature base string.
fn base_url(url: &Url) -> String {
    let mut base = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        base.push_str(&format!(":{port}"));
    }
    base.push_str(url.path());
    base
}

pub fn signature_base(method: &Method, url: &Url, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (encode(&k), encode(&v)))
        .chain(params.iter().map(|(k, v)| (encode(k), encode(v))))
        .collect();
    encoded.sort();
    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.as_str(),
        encode(&base_url(url)),
        encode(&normalized)
    )
}

pub fn sign(base: &str, consumer_secret: &str, token_secret: Option<&str>) -> String {
    let key = format!(
        "{}&{}",
        encode(consumer_secret),
        encode(token_secret.unwrap_or_default())
    );
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(base.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Build the `Authorization: OAuth ...` header for a request. `form` holds
/// url-encoded body parameters, which take part in the signature.
pub fn authorization_header(
    method: &Method,
    url: &Url,
    form: &[(&str, &str)],
    consumer: &Consumer,
    token: Option<&Token>,
    nonce: &Nonce,
) -> String {
    let timestamp = nonce.timestamp.to_string();
    let mut oauth = vec![
        ("oauth_nonce", nonce.nonce.as_str()),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_consumer_key", consumer.key.as_str()),
        ("oauth_signature_method", "HMAC-SHA1"),
        ("oauth_version", "1.0"),
    ];
    if let Some(token) = token {
        oauth.push(("oauth_token", token.token.as_str()));
    }

    let params: Vec<(String, String)> = oauth
        .iter()
        .chain(form.iter())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let signature = sign(
        &signature_base(method, url, &params),
        &consumer.secret,
        token.map(|t| t.secret.as_str()),
    );

    let mut header = String::from("OAuth realm=\"\"");
    for (key, value) in oauth.iter().chain([("oauth_signature", signature.as_str())].iter()) {
        header.push_str(&format!(", {key}=\"{}\"", encode(value)));
    }
    header
}

fn check(response: Response, endpoint: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status.is_redirection() {
        Ok(response)
    } else {
        Err(GgError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        })
    }
}

async fn signed_token_request(
    client: &Client,
    url: &Url,
    consumer: &Consumer,
    token: Option<&Token>,
    endpoint: &str,
) -> Result<Token> {
    let header = authorization_header(&Method::POST, url, &[], consumer, token, &Nonce::fresh());
    let response = client
        .post(url.clone())
        .header(reqwest::header::AUTHORIZATION, header)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;
    check(response, endpoint)?
        .json::<Token>()
        .await
        .map_err(|e| GgError::Malformed {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
}

/// Run the whole token dance and return the access token.
#[instrument(skip(client, endpoints, password))]
pub async fn request_access_token(
    client: &Client,
    endpoints: &OAuthEndpoints,
    uin: u32,
    password: &str,
) -> Result<Token> {
    let consumer = Consumer {
        key: uin.to_string(),
        secret: password.to_string(),
    };

    let request = signed_token_request(
        client,
        &endpoints.request_token,
        &consumer,
        None,
        "request_token",
    )
    .await?;
    debug!("got request token");

    let uin = uin.to_string();
    let form = [
        ("callback_url", endpoints.callback.as_str()),
        ("request_token", request.token.as_str()),
        ("uin", uin.as_str()),
        ("password", password),
    ];
    let response = client
        .post(endpoints.authorize.clone())
        .form(&form)
        .send()
        .await?;
    check(response, "authorize")?;
    debug!("request token authorized");

    let access = signed_token_request(
        client,
        &endpoints.access_token,
        &consumer,
        Some(&request),
        "access_token",
    )
    .await?;
    debug!("got access token");
    Ok(access)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn photos_url() -> Url {
        Url::parse("http://photos.example.net/photos?file=vacation.jpg&size=original").unwrap()
    }

    fn photos_params() -> Vec<(String, String)> {
        [
            ("oauth_consumer_key", "dpf43f3p2l4k3l03"),
            ("oauth_token", "nnch734d00sl2jdk"),
            ("oauth_signature_method", "HMAC-SHA1"),
            ("oauth_timestamp", "1191242096"),
            ("oauth_nonce", "kllo9940pd9333jh"),
            ("oauth_version", "1.0"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn encodes_only_reserved_characters() {
        assert_eq!(encode("abc-._~XYZ09"), "abc-._~XYZ09");
        assert_eq!(encode("a b&c=d/é"), "a%20b%26c%3Dd%2F%C3%A9");
    }

    #[test]
    fn base_string_sorts_parameters_and_strips_the_query() {
        let base = signature_base(&Method::GET, &photos_url(), &photos_params());
        assert_eq!(
            base,
            "GET&http%3A%2F%2Fphotos.example.net%2Fphotos&file%3Dvacation.jpg\
             %26oauth_consumer_key%3Ddpf43f3p2l4k3l03%26oauth_nonce%3Dkllo9940pd9333jh\
             %26oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D1191242096\
             %26oauth_token%3Dnnch734d00sl2jdk%26oauth_version%3D1.0%26size%3Doriginal"
        );
    }

    #[test]
    fn signs_the_reference_request() {
        let base = signature_base(&Method::GET, &photos_url(), &photos_params());
        let signature = sign(&base, "kd94hf93k423kf44", Some("pfkkdhi9sl3r4s00"));
        assert_eq!(signature, "tR3+Ty81lMeYAr/Fid0kMTYa/WM=");
    }

    #[test]
    fn header_carries_the_token_only_when_present() {
        let url = Url::parse("https://api.example.test/request_token").unwrap();
        let consumer = Consumer {
            key: "123456".into(),
            secret: "secret".into(),
        };
        let nonce = Nonce {
            nonce: "abc".into(),
            timestamp: 1,
        };
        let header = authorization_header(&Method::POST, &url, &[], &consumer, None, &nonce);
        assert!(header.starts_with("OAuth realm=\"\", oauth_nonce=\"abc\""));
        assert!(header.contains("oauth_consumer_key=\"123456\""));
        assert!(!header.contains("oauth_token="));
        assert!(header.contains("oauth_signature=\""));

        let token = Token {
            token: "tok".into(),
            secret: "sec".into(),
        };
        let header = authorization_header(&Method::POST, &url, &[], &consumer, Some(&token), &nonce);
        assert!(header.contains("oauth_token=\"tok\""));
    }

    #[test]
    fn endpoints_hang_off_the_api_base() {
        let endpoints = OAuthEndpoints::from_api_base("https://api.example.test/").unwrap();
        assert_eq!(endpoints.request_token.as_str(), "https://api.example.test/request_token");
        assert_eq!(endpoints.access_token.path(), "/access_token");
    }

    #[test]
    fn fresh_nonces_differ() {
        assert_ne!(Nonce::fresh().nonce, Nonce::fresh().nonce);
    }
}
