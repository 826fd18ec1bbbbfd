//! Optional at-rest encryption of uploaded blobs.
//!
//! Blobs are encrypted as age streams for an X25519 recipient. A site has
//! one active key id used for new backups; the key ring may also hold
//! retired keys so older backups stay restorable. Which key sealed a blob
//! travels in the blob's `encryption-key-id` metadata.

use age::secrecy::ExposeSecret;
use age::x25519;
use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::compat::{FuturesAsyncReadCompatExt, FuturesAsyncWriteCompatExt,
    TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

use crate::config::SiteConfig;

pub const ENCRYPTION_KEY_ID_META: &str = "encryption-key-id";

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// The write half of the site's active key.
#[derive(Clone)]
pub struct ActiveEncryption {
    pub key_id: String,
    recipient: x25519::Recipient,
}

impl ActiveEncryption {
    /// Resolves the site's active encryption key, if any. The public half
    /// is used directly; with only the secret half configured the
    /// recipient is derived from it.
    pub fn from_site(site: &SiteConfig) -> anyhow::Result<Option<Self>> {
        let Some(key_id) = &site.encryption_key_id else {
            return Ok(None);
        };
        let key = site
            .encryption_keys
            .get(key_id)
            .with_context(|| format!("encryption key {key_id:?} is not in the key ring"))?;
        let recipient = match (&key.public, &key.private) {
            (Some(public), _) => public
                .parse::<x25519::Recipient>()
                .map_err(|e| anyhow::anyhow!("invalid public key for {key_id:?}: {e}"))?,
            (None, Some(private)) => private
                .parse::<x25519::Identity>()
                .map_err(|e| anyhow::anyhow!("invalid secret key for {key_id:?}: {e}"))?
                .to_public(),
            (None, None) => anyhow::bail!("encryption key {key_id:?} has neither half configured"),
        };
        Ok(Some(ActiveEncryption {
            key_id: key_id.clone(),
            recipient,
        }))
    }

    /// Wraps `writer` so that everything written comes out age-encrypted.
    /// The caller must `shutdown()` the result to finalize the stream.
    pub async fn wrap_writer<W>(&self, writer: W) -> anyhow::Result<BoxedWriter>
    where
        W: AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let stream_writer = age::Encryptor::with_recipients(std::iter::once(
            &self.recipient as &dyn age::Recipient,
        ))
        .context("build encryptor")?
        .wrap_async_output(writer.compat_write())
        .await
        .context("write age header")?;
        Ok(Box::new(stream_writer.compat_write()))
    }
}

/// The read half: the identity that unlocks blobs sealed with `key_id`.
pub fn identity_for(site: &SiteConfig, key_id: &str) -> anyhow::Result<x25519::Identity> {
    let key = site
        .encryption_keys
        .get(key_id)
        .with_context(|| format!("encryption key {key_id:?} is not in the key ring"))?;
    let private = key
        .private
        .as_ref()
        .with_context(|| format!("no secret key configured for {key_id:?}"))?;
    private
        .parse::<x25519::Identity>()
        .map_err(|e| anyhow::anyhow!("invalid secret key for {key_id:?}: {e}"))
}

/// Wraps an age stream so reads yield the decrypted bytes.
pub async fn decrypt_reader<R>(
    identity: &x25519::Identity,
    reader: R,
) -> anyhow::Result<BoxedReader>
where
    R: AsyncRead + Send + Sync + Unpin + 'static,
{
    let decryptor = age::Decryptor::new_async(reader.compat())
        .await
        .context("read age header")?;
    let plain = decryptor
        .decrypt_async(std::iter::once(identity as &dyn age::Identity))
        .context("unlock blob with the configured identity")?;
    Ok(Box::new(plain.compat()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncryptionKey;
    use std::collections::HashMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn site_with_key(key_id: &str, key: EncryptionKey) -> SiteConfig {
        let mut site: SiteConfig = toml::from_str(
            r#"
            prefix = "a/b/c"
            pg_data_directory = "/nonexistent"
            connection_string = ""

            [object_storage]
            kind = "local-fs"
            local_path = "/nonexistent"
        "#,
        )
        .unwrap();
        site.encryption_key_id = Some(key_id.to_string());
        site.encryption_keys = HashMap::from([(key_id.to_string(), key)]);
        site
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let identity = x25519::Identity::generate();
        let site = site_with_key(
            "backup-key",
            EncryptionKey {
                public: Some(identity.to_public().to_string()),
                private: Some(identity.to_string().expose_secret().to_string()),
            },
        );

        let encryption = ActiveEncryption::from_site(&site).unwrap().unwrap();
        assert_eq!(encryption.key_id, "backup-key");

        let dir = camino_tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.age");
        {
            let file = tokio::fs::File::create(&path).await.unwrap();
            let mut writer = encryption.wrap_writer(file).await.unwrap();
            writer.write_all(b"tar bytes, compressed").await.unwrap();
            writer.shutdown().await.unwrap();
        }

        let sealed = tokio::fs::read(&path).await.unwrap();
        assert_ne!(&sealed, b"tar bytes, compressed");

        let identity = identity_for(&site, "backup-key").unwrap();
        let file = tokio::fs::File::open(&path).await.unwrap();
        let mut reader = decrypt_reader(&identity, file).await.unwrap();
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).await.unwrap();
        assert_eq!(&plain, b"tar bytes, compressed");
    }

    #[tokio::test]
    async fn recipient_is_derived_from_secret_half() {
        let identity = x25519::Identity::generate();
        let site = site_with_key(
            "only-secret",
            EncryptionKey {
                public: None,
                private: Some(identity.to_string().expose_secret().to_string()),
            },
        );
        assert!(ActiveEncryption::from_site(&site).unwrap().is_some());
    }

    #[test]
    fn missing_ring_entry_is_an_error() {
        let mut site = site_with_key("k1", EncryptionKey::default());
        site.encryption_keys.clear();
        assert!(ActiveEncryption::from_site(&site).is_err());
        assert!(identity_for(&site, "k1").is_err());
    }
}
