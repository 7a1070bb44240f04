//! Thin `reqwest` wrapper that applies compression and optional RSA
//! encryption to the outgoing body, then HMAC-signs whatever bytes actually
//! go on the wire — the server verifies the signature before decrypting, so
//! signing must happen last, over the same bytes the server receives.

use std::io::Write;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use rsa::RsaPublicKey;
use serde::Serialize;
use sha2::Sha256;

pub(crate) struct ReportClient {
    http: reqwest::Client,
    base_url: String,
    hmac_key: Option<Vec<u8>>,
    public_key: Option<RsaPublicKey>,
    real_ip: Option<String>,
}

impl ReportClient {
    pub(crate) fn new(
        base_url: String,
        hmac_key: Option<Vec<u8>>,
        public_key: Option<RsaPublicKey>,
        real_ip: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            hmac_key,
            public_key,
            real_ip,
        }
    }

    pub(crate) async fn send_bulk<T: Serialize>(&self, payload: &T) -> Result<()> {
        let json = serde_json::to_vec(payload).context("failed to encode payload as json")?;
        let compressed = gzip(&json)?;

        let body = match &self.public_key {
            Some(public_key) => encrypt(public_key, &compressed)?,
            None => compressed,
        };

        let signature = self.hmac_key.as_ref().map(|key| sign(key, &body));

        let url = format!("{}/updates/", self.base_url);
        let mut request = self
            .http
            .post(url)
            .header("Content-Encoding", "gzip")
            .header("Content-Type", "application/json")
            .body(body);

        if let Some(signature) = signature {
            request = request.header("HashSHA256", signature);
        }
        if let Some(real_ip) = &self.real_ip {
            request = request.header("X-Real-IP", real_ip);
        }

        let response = request.send().await.context("failed to send metrics batch")?;
        if !response.status().is_success() {
            anyhow::bail!("server rejected metrics batch with status {}", response.status());
        }
        Ok(())
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write failed")?;
    encoder.finish().context("gzip finish failed")
}

fn sign(key: &[u8], data: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts keys of any length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

#[derive(Serialize)]
struct EncryptedEnvelope {
    data: String,
}

fn encrypt(public_key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    let padding = rsa::Oaep::new::<Sha256>();
    let mut rng = rand::thread_rng();
    let ciphertext = public_key
        .encrypt(&mut rng, padding, data)
        .context("rsa encryption failed")?;
    let envelope = EncryptedEnvelope {
        data: BASE64.encode(ciphertext),
    };
    serde_json::to_vec(&envelope).context("failed to encode encrypted envelope")
}
