use crate::cache::{BlobInfo, BlobStore};
use crate::error::{DiskError, Result};
use crate::manifest::{
    self, OciManifest, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Fetcher seam
// ---------------------------------------------------------------------------

/// Retrieves the disk archive blob for a registry reference into a local
/// blob store.
///
/// On success the blob is available at `store.blob_path(&info)`.
pub trait OciFetcher {
    fn fetch(&self, reference: &str, store: &BlobStore) -> Result<BlobInfo>;
}

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "quay.io").
    pub registry: String,
    /// Repository path (e.g. "libpod/podman-machine-images").
    pub repository: String,
    /// Tag or digest reference (e.g. "5.0-qcow2" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `quay.io/libpod/podman-machine-images:5.0-qcow2`
    /// - `localhost:5000/disks:latest`
    /// - `my.registry.io/org/repo@sha256:abc123`
    /// - `docker://` prefixed forms of the above
    ///
    /// Docker Hub shorthands (`alpine`, `user/repo`) map to
    /// `registry-1.docker.io`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = crate::reference::strip_transport_prefix(raw.trim());
        if raw.is_empty() {
            return Err(DiskError::ReferenceBuild("empty image reference".to_string()));
        }

        // Split off the reference (tag or digest).
        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/', otherwise it is a
            // registry port ("localhost:5000/repo").
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        if name_part.is_empty() || reference.is_empty() {
            return Err(DiskError::ReferenceBuild(format!(
                "malformed image reference {raw:?}"
            )));
        }

        // The first component is a registry hostname when it contains a dot
        // or a colon (port), or is "localhost".
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => ("registry-1.docker.io".to_string(), name_part.to_string()),
            None => (
                "registry-1.docker.io".to_string(),
                format!("library/{}", name_part),
            ),
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Blocking OCI Distribution client that pulls single-manifest disk image
/// artifacts anonymously.
pub struct RegistryClient {
    client: Client,
    /// Overrides the scheme/host derived from the reference (tests, mirrors).
    base_url: Option<String>,
}

/// Plain HTTP is only used for registries on the loopback interface, where
/// test and developer mirrors usually run without TLS.
fn registry_scheme(registry: &str) -> &'static str {
    if is_loopback_host(registry) {
        "http"
    } else {
        "https"
    }
}

/// `registry` is `host`, `host:port` or `[v6addr]:port`.
fn is_loopback_host(registry: &str) -> bool {
    let host = match registry.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => registry.rsplit_once(':').map_or(registry, |(h, _)| h),
    };
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("machine-disk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: None,
        })
    }

    /// Send every request to `base_url` (e.g. `http://127.0.0.1:8080`)
    /// instead of the registry named in the reference.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    fn base(&self, image_ref: &ImageRef) -> String {
        match &self.base_url {
            Some(base) => base.clone(),
            None => format!(
                "{}://{}",
                registry_scheme(&image_ref.registry),
                image_ref.registry
            ),
        }
    }

    /// Fetch the manifest for `image_ref`. Image indexes are rejected.
    pub fn fetch_manifest(&self, image_ref: &ImageRef) -> Result<OciManifest> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base(image_ref),
            image_ref.repository,
            image_ref.reference,
        );

        let accept = [
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
        ]
        .join(", ");

        let body = self.authenticated_get(&url, image_ref, Some(&accept))?.bytes()?;

        // Peek at the response to decide which type it is.
        let raw: serde_json::Value = serde_json::from_slice(&body)?;
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");
        if manifest::is_index_media_type(media_type) || raw.get("manifests").is_some() {
            return Err(DiskError::UnsupportedMediaType(format!(
                "{} resolves to an image index; multi-arch selection is not supported",
                url
            )));
        }
        Ok(serde_json::from_value(raw)?)
    }

    /// Stream a blob into `store`, verifying its digest. A blob that is
    /// already cached is not downloaded again.
    pub fn fetch_blob_to_store(
        &self,
        image_ref: &ImageRef,
        blob: &BlobInfo,
        store: &BlobStore,
    ) -> Result<()> {
        if store.has_blob(blob) {
            debug!(digest = %blob.digest, "blob already cached");
            return Ok(());
        }

        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base(image_ref),
            image_ref.repository,
            blob.digest,
        );
        info!(digest = %blob.digest, size = blob.size, "downloading blob");
        let resp = self.authenticated_get(&url, image_ref, None)?;
        store.store_blob(blob, resp)?;
        Ok(())
    }

    // -- internals ----------------------------------------------------------

    /// Perform a GET with anonymous-then-bearer-token auth flow.
    fn authenticated_get(
        &self,
        url: &str,
        image_ref: &ImageRef,
        accept: Option<&str>,
    ) -> Result<Response> {
        let mut req = self.client.get(url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }
        let resp = req.send()?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            let www_auth = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let token = self.fetch_bearer_token(&www_auth, image_ref)?;

            let mut retry = self
                .client
                .get(url)
                .header(AUTHORIZATION, format!("Bearer {}", token));
            if let Some(a) = accept {
                retry = retry.header(ACCEPT, a);
            }
            retry.send()?
        } else {
            resp
        };

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            Err(DiskError::NotFound(url.to_string()))
        } else if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            Err(DiskError::fetch(
                url,
                format!("GET returned {}: {}", status, body),
            ))
        } else {
            Ok(resp)
        }
    }

    /// Answer a bearer challenge with an anonymous pull token.
    fn fetch_bearer_token(&self, www_auth: &str, image_ref: &ImageRef) -> Result<String> {
        let challenge = BearerChallenge::parse(www_auth).ok_or_else(|| {
            DiskError::fetch(
                &image_ref.registry,
                format!("unsupported authentication challenge {www_auth:?}"),
            )
        })?;
        let realm = challenge.realm;
        let service = challenge.service.unwrap_or_default();
        let scope = challenge
            .scope
            .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));

        debug!(%realm, %service, %scope, "fetching bearer token");
        let resp = self
            .client
            .get(&realm)
            .query(&[("service", service.as_str()), ("scope", scope.as_str())])
            .send()?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(DiskError::fetch(
                realm,
                format!("token endpoint returned {}: {}", status, body),
            ));
        }

        let body: serde_json::Value = resp.json()?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| DiskError::fetch(realm, "token response missing token field"))
    }
}

impl OciFetcher for RegistryClient {
    fn fetch(&self, reference: &str, store: &BlobStore) -> Result<BlobInfo> {
        let image_ref = ImageRef::parse(reference)?;
        info!(
            registry = %image_ref.registry,
            repository = %image_ref.repository,
            reference = %image_ref.reference,
            "pulling disk image",
        );

        let manifest = self.fetch_manifest(&image_ref)?;
        let blob = manifest.disk_layer()?.blob_info()?;
        self.fetch_blob_to_store(&image_ref, &blob, store)?;
        Ok(blob)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The parts of a `WWW-Authenticate: Bearer ...` challenge needed to request
/// an anonymous token.
#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    /// Returns `None` for non-bearer schemes and challenges without a realm.
    fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after) = rest.split_once('=')?;
            let (value, after) = match after.strip_prefix('"') {
                Some(quoted) => {
                    let end = quoted.find('"')?;
                    (&quoted[..end], &quoted[end + 1..])
                }
                None => after.split_once(',').map_or((after, ""), |(v, r)| (v, r)),
            };
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
            rest = after.trim_start_matches([',', ' ']);
        }

        Some(Self {
            realm: realm.filter(|r| !r.is_empty())?,
            service,
            scope,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Digest;
    use httpmock::prelude::*;

    #[test]
    fn parse_machine_image_reference() {
        let r = ImageRef::parse("quay.io/libpod/podman-machine-images:5.0-qcow2").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "libpod/podman-machine-images");
        assert_eq!(r.reference, "5.0-qcow2");
    }

    #[test]
    fn parse_strips_transport() {
        let r = ImageRef::parse("docker://ghcr.io/foo/bar:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "foo/bar");
        assert_eq!(r.reference, "v1");
    }

    #[test]
    fn parse_digest_reference() {
        let r = ImageRef::parse("my.registry.io/org/repo@sha256:abc123").unwrap();
        assert_eq!(r.registry, "my.registry.io");
        assert_eq!(r.repository, "org/repo");
        assert_eq!(r.reference, "sha256:abc123");
    }

    #[test]
    fn parse_docker_hub_shorthands() {
        let r = ImageRef::parse("ubuntu").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.reference, "latest");

        let r = ImageRef::parse("myuser/myrepo:v2").unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "myuser/myrepo");
    }

    #[test]
    fn parse_registry_with_port() {
        let r = ImageRef::parse("localhost:5000/disks:tag").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "disks");
        assert_eq!(r.reference, "tag");
    }

    #[test]
    fn parse_empty_returns_error() {
        assert!(ImageRef::parse("").is_err());
        assert!(ImageRef::parse("docker://").is_err());
        assert!(ImageRef::parse("quay.io/repo:").is_err());
    }

    #[test]
    fn loopback_registries_use_plain_http() {
        assert_eq!(registry_scheme("localhost:5555"), "http");
        assert_eq!(registry_scheme("127.0.0.1:5000"), "http");
        assert_eq!(registry_scheme("[::1]:5000"), "http");
        assert_eq!(registry_scheme("quay.io"), "https");
        assert_eq!(registry_scheme("my.registry.io:443"), "https");
        assert_eq!(registry_scheme("10.0.0.7:5000"), "https");
    }

    #[test]
    fn bearer_challenge_from_quay() {
        let header = r#"Bearer realm="https://quay.io/v2/auth",service="quay.io",scope="repository:libpod/x:pull""#;
        assert_eq!(
            BearerChallenge::parse(header),
            Some(BearerChallenge {
                realm: "https://quay.io/v2/auth".to_string(),
                service: Some("quay.io".to_string()),
                scope: Some("repository:libpod/x:pull".to_string()),
            })
        );
    }

    #[test]
    fn bearer_challenge_tolerates_spacing_and_unquoted_values() {
        let header = r#"bearer realm="https://auth.example/token", service=registry"#;
        let challenge = BearerChallenge::parse(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.example/token");
        assert_eq!(challenge.service.as_deref(), Some("registry"));
        assert_eq!(challenge.scope, None);
    }

    #[test]
    fn bearer_challenge_rejects_basic_and_missing_realm() {
        assert_eq!(BearerChallenge::parse(r#"Basic realm="registry""#), None);
        assert_eq!(BearerChallenge::parse(r#"Bearer service="quay.io""#), None);
        assert_eq!(BearerChallenge::parse(""), None);
    }


    fn manifest_json(layer: &[u8]) -> String {
        format!(
            r#"{{
                "schemaVersion": 2,
                "mediaType": "{MEDIA_TYPE_OCI_MANIFEST}",
                "config": {{"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a", "size": 2}},
                "layers": [{{"mediaType": "application/x-xz", "digest": "{}", "size": {}}}]
            }}"#,
            Digest::sha256_of(layer),
            layer.len()
        )
    }

    #[test]
    fn fetch_stores_first_layer() {
        let server = MockServer::start();
        let layer = b"compressed disk archive";
        let digest = Digest::sha256_of(layer);

        server.mock(|when, then| {
            when.method(GET)
                .path("/v2/libpod/machine/manifests/5.0-raw");
            then.status(200)
                .header("content-type", MEDIA_TYPE_OCI_MANIFEST)
                .body(manifest_json(layer));
        });
        let mut blob_mock = server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/libpod/machine/blobs/{}", digest));
            then.status(200).body(&layer[..]);
        });

        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::new(tmp.path());
        let client = RegistryClient::new().unwrap().with_base_url(server.base_url());

        let info = client
            .fetch("quay.io/libpod/machine:5.0-raw", &store)
            .unwrap();
        assert_eq!(info.digest, digest);
        assert_eq!(std::fs::read(store.blob_path(&info)).unwrap(), layer);

        // With the blob endpoint gone, a second fetch must use the cache.
        blob_mock.delete();
        client
            .fetch("quay.io/libpod/machine:5.0-raw", &store)
            .unwrap();
    }

    #[test]
    fn fetch_answers_bearer_challenge() {
        let server = MockServer::start();
        let layer = b"disk";
        let realm = format!("{}/token", server.base_url());

        server.mock(|when, then| {
            when.method(GET)
                .path("/v2/org/disk/manifests/1.0-qcow2")
                .header_missing("authorization");
            then.status(401).header(
                "www-authenticate",
                format!(r#"Bearer realm="{realm}",service="test""#),
            );
        });
        server.mock(|when, then| {
            when.method(GET).path("/token").query_param("service", "test");
            then.status(200).body(r#"{"token":"abc"}"#);
        });
        server.mock(|when, then| {
            when.method(GET)
                .path("/v2/org/disk/manifests/1.0-qcow2")
                .header("authorization", "Bearer abc");
            then.status(200).body(manifest_json(layer));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/org/disk/blobs/{}", Digest::sha256_of(layer)));
            then.status(200).body(&layer[..]);
        });

        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::new(tmp.path());
        let client = RegistryClient::new().unwrap().with_base_url(server.base_url());
        let info = client.fetch("example.com/org/disk:1.0-qcow2", &store).unwrap();
        assert!(store.has_blob(&info));
    }

    #[test]
    fn fetch_rejects_index_and_missing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/org/multi/manifests/latest");
            then.status(200).body(format!(
                r#"{{"schemaVersion":2,"mediaType":"{MEDIA_TYPE_OCI_INDEX}","manifests":[]}}"#
            ));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v2/org/gone/manifests/latest");
            then.status(404);
        });

        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::new(tmp.path());
        let client = RegistryClient::new().unwrap().with_base_url(server.base_url());

        assert!(matches!(
            client.fetch("example.com/org/multi", &store),
            Err(DiskError::UnsupportedMediaType(_))
        ));
        assert!(matches!(
            client.fetch("example.com/org/gone", &store),
            Err(DiskError::NotFound(_))
        ));
    }

    #[test]
    fn fetch_detects_tampered_blob() {
        let server = MockServer::start();
        let layer = b"the real bytes";
        server.mock(|when, then| {
            when.method(GET).path("/v2/org/disk/manifests/latest");
            then.status(200).body(manifest_json(layer));
        });
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/v2/org/disk/blobs/{}", Digest::sha256_of(layer)));
            then.status(200).body("something else");
        });

        let tmp = tempfile::tempdir().unwrap();
        let store = BlobStore::new(tmp.path());
        let client = RegistryClient::new().unwrap().with_base_url(server.base_url());
        assert!(matches!(
            client.fetch("example.com/org/disk", &store),
            Err(DiskError::DigestMismatch { .. })
        ));
    }
}
