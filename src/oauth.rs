use anyhow::{anyhow, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::RngCore;
use sha1::Sha1;
use url::Url;

const OAUTH_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

type HmacSha1 = Hmac<Sha1>;

#[derive(Clone)]
pub struct Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub token: String,
    pub token_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("consumer_key", &self.consumer_key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Signer {
    credentials: Credentials,
}

impl Signer {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    // `Authorization` header value for a request. `form` holds any
    // url-encoded body parameters, which take part in the signature.
    pub fn authorization(
        &self,
        method: &str,
        url: &Url,
        form: &[(String, String)],
    ) -> Result<String> {
        let nonce = nonce();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.authorization_with(method, url, form, &nonce, &timestamp)
    }

    fn authorization_with(
        &self,
        method: &str,
        url: &Url,
        form: &[(String, String)],
        nonce: &str,
        timestamp: &str,
    ) -> Result<String> {
        let mut oauth = self.oauth_params(nonce, timestamp);
        let signature = self.signature(method, url, form, &oauth)?;
        oauth.push(("oauth_signature".into(), signature));
        oauth.sort();
        let fields: Vec<String> = oauth
            .iter()
            .map(|(key, value)| format!("{}=\"{}\"", encode(key), encode(value)))
            .collect();
        Ok(format!("OAuth {}", fields.join(", ")))
    }

    fn oauth_params(&self, nonce: &str, timestamp: &str) -> Vec<(String, String)> {
        vec![
            ("oauth_consumer_key".into(), self.credentials.consumer_key.clone()),
            ("oauth_nonce".into(), nonce.to_string()),
            ("oauth_signature_method".into(), "HMAC-SHA1".into()),
            ("oauth_timestamp".into(), timestamp.to_string()),
            ("oauth_token".into(), self.credentials.token.clone()),
            ("oauth_version".into(), "1.0".into()),
        ]
    }

    fn signature(
        &self,
        method: &str,
        url: &Url,
        form: &[(String, String)],
        oauth: &[(String, String)],
    ) -> Result<String> {
        let base = base_string(method, url, form, oauth);
        let key = format!(
            "{}&{}",
            encode(&self.credentials.consumer_secret),
            encode(&self.credentials.token_secret)
        );
        Ok(STANDARD.encode(hmac_sha1(key.as_bytes(), base.as_bytes())?))
    }
}

fn base_string(
    method: &str,
    url: &Url,
    form: &[(String, String)],
    oauth: &[(String, String)],
) -> String {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (encode(&key), encode(&value)))
        .chain(form.iter().chain(oauth).map(|(key, value)| (encode(key), encode(value))))
        .collect();
    params.sort();
    let joined: Vec<String> = params
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let mut endpoint = url.clone();
    endpoint.set_query(None);
    endpoint.set_fragment(None);

    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        encode(endpoint.as_str()),
        encode(&joined.join("&"))
    )
}

pub fn encode(value: &str) -> String {
    utf8_percent_encode(value, OAUTH_ENCODE_SET).to_string()
}

pub fn hmac_sha1(key: &[u8], message: &[u8]) -> Result<[u8; 20]> {
    let mut mac =
        HmacSha1::new_from_slice(key).map_err(|err| anyhow!("oauth: hmac key: {err}"))?;
    mac.update(message);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

fn nonce() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_rfc2202() {
        assert_eq!(
            hex::encode(hmac_sha1(&[0x0b; 20], b"Hi There").unwrap()),
            "b617318655057264e28bc0b6fb378c8ef146be00"
        );
        assert_eq!(
            hex::encode(hmac_sha1(b"Jefe", b"what do ya want for nothing?").unwrap()),
            "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79"
        );
    }

    #[test]
    fn hmac_hashes_long_keys() {
        assert_eq!(
            hex::encode(
                hmac_sha1(&[0xaa; 80], b"Test Using Larger Than Block-Size Key - Hash Key First")
                    .unwrap()
            ),
            "aa4ae5e15272d00e95705637ce8a3b55ed402112"
        );
    }

    #[test]
    fn encode_keeps_unreserved() {
        assert_eq!(encode("a-b.c_d~e"), "a-b.c_d~e");
        assert_eq!(encode("Ladies + Gentlemen"), "Ladies%20%2B%20Gentlemen");
        assert_eq!(encode("!"), "%21");
    }

    #[test]
    fn signs_reference_request() {
        let signer = Signer::new(Credentials {
            consumer_key: "xvz1evFS4wEEPTGEFPHBog".into(),
            consumer_secret: "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw".into(),
            token: "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb".into(),
            token_secret: "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE".into(),
        });
        let url =
            Url::parse("https://api.twitter.com/1.1/statuses/update.json?include_entities=true")
                .unwrap();
        let form = vec![(
            "status".to_string(),
            "Hello Ladies + Gentlemen, a signed OAuth request!".to_string(),
        )];
        let header = signer
            .authorization_with(
                "post",
                &url,
                &form,
                "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg",
                "1318622958",
            )
            .unwrap();
        assert!(header.starts_with("OAuth oauth_consumer_key=\"xvz1evFS4wEEPTGEFPHBog\""));
        assert!(header.contains("oauth_signature=\"hCtSmYh%2BiHYCEqBWrE7C7hYmtUk%3D\""));
    }

    #[test]
    fn nonces_differ() {
        assert_ne!(nonce(), nonce());
    }
}
