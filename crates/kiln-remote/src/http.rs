use crate::{verify_blob, ImageRef, ImageTransport, RemoteConfig, RemoteError};
use kiln_schema::image::MANIFEST_MEDIA_TYPE;
use kiln_schema::{Digest, Image, ImageManifest};
use std::io::Read;
use tracing::{debug, trace};

const BLOB_MEDIA_TYPE: &str = "application/octet-stream";

/// What a request targets inside a repository.
enum Resource<'a> {
    Manifest(&'a str),
    Blob(&'a Digest),
}

enum Verb<'a> {
    Get,
    Head,
    Put { content_type: &'a str, body: &'a [u8] },
}

impl Verb<'_> {
    fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "GET",
            Verb::Head => "HEAD",
            Verb::Put { .. } => "PUT",
        }
    }
}

struct Reply {
    status: u16,
    body: Vec<u8>,
}

/// Image transport over a registry's HTTP API.
///
/// Only the subset of the distribution API the lifecycle needs is used:
/// manifests are read and written by tag or digest under
/// `/v2/<repository>/manifests/`, blobs are checked, read and written by
/// digest under `/v2/<repository>/blobs/`. Blob uploads are single `PUT`s.
pub struct HttpRegistry {
    config: RemoteConfig,
    agent: ureq::Agent,
}

impl HttpRegistry {
    pub fn new(config: RemoteConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into();
        Self { config, agent }
    }

    fn url(&self, image: &ImageRef, resource: &Resource<'_>) -> String {
        match resource {
            Resource::Manifest(reference) => {
                format!("{}/v2/{}/manifests/{reference}", self.config.url, image.repository)
            }
            Resource::Blob(digest) => {
                format!("{}/v2/{}/blobs/{digest}", self.config.url, image.repository)
            }
        }
    }

    fn authorize<B>(&self, req: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        match &self.config.auth_token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    /// One round trip. Statuses are returned, not turned into errors, except
    /// for rejected credentials.
    fn exchange(&self, verb: &Verb<'_>, url: &str) -> Result<Reply, RemoteError> {
        trace!("{} {url}", verb.as_str());
        let sent = match verb {
            Verb::Get => self
                .authorize(self.agent.get(url))
                .header("Accept", MANIFEST_MEDIA_TYPE)
                .call(),
            Verb::Head => self.authorize(self.agent.head(url)).call(),
            Verb::Put { content_type, body } => self
                .authorize(self.agent.put(url))
                .header("Content-Type", *content_type)
                .send(*body),
        };
        let resp = sent.map_err(|e| RemoteError::Http(format!("{} {url}: {e}", verb.as_str())))?;
        let status = resp.status().as_u16();
        if status == 401 || status == 403 {
            return Err(RemoteError::Http(format!(
                "{} rejected the credentials for {url} (HTTP {status})",
                self.config.host()
            )));
        }

        let mut body = Vec::new();
        if matches!(verb, Verb::Get) && status < 300 {
            resp.into_body()
                .into_reader()
                .read_to_end(&mut body)
                .map_err(|e| RemoteError::Http(format!("reading {url}: {e}")))?;
        }
        Ok(Reply { status, body })
    }

    /// GET a resource; `Ok(None)` when the registry does not have it.
    fn download(&self, image: &ImageRef, resource: &Resource<'_>) -> Result<Option<Vec<u8>>, RemoteError> {
        let url = self.url(image, resource);
        let reply = self.exchange(&Verb::Get, &url)?;
        match reply.status {
            200..=299 => Ok(Some(reply.body)),
            404 => Ok(None),
            status => Err(RemoteError::Http(format!("GET {url}: HTTP {status}"))),
        }
    }

    fn upload(
        &self,
        image: &ImageRef,
        resource: &Resource<'_>,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), RemoteError> {
        let url = self.url(image, resource);
        let reply = self.exchange(&Verb::Put { content_type, body }, &url)?;
        if (200..300).contains(&reply.status) {
            Ok(())
        } else {
            Err(RemoteError::Http(format!("PUT {url}: HTTP {}", reply.status)))
        }
    }
}

impl ImageTransport for HttpRegistry {
    fn name(&self) -> String {
        format!("registry {}", self.config.host())
    }

    fn fetch_image(&self, image: &ImageRef) -> Result<Option<Image>, RemoteError> {
        let reference = image.reference();
        let Some(manifest) = self.download(image, &Resource::Manifest(&reference))? else {
            debug!("{image} not found on {}", self.config.host());
            return Ok(None);
        };
        if let Some(pinned) = &image.digest {
            verify_blob(&image.to_string(), pinned, &manifest)?;
        }
        let parsed: ImageManifest = serde_json::from_slice(&manifest)
            .map_err(|e| RemoteError::Serialization(format!("manifest of {image}: {e}")))?;
        let config = self.fetch_blob(image, &parsed.config.digest)?;
        Ok(Some(Image::from_blobs(&manifest, &config)?))
    }

    fn fetch_blob(&self, image: &ImageRef, digest: &Digest) -> Result<Vec<u8>, RemoteError> {
        let data = self
            .download(image, &Resource::Blob(digest))?
            .ok_or_else(|| RemoteError::NotFound(format!("{}@{digest}", image.repository)))?;
        verify_blob(&format!("{}@{digest}", image.repository), digest, &data)?;
        Ok(data)
    }

    fn has_blob(&self, image: &ImageRef, digest: &Digest) -> Result<bool, RemoteError> {
        let url = self.url(image, &Resource::Blob(digest));
        match self.exchange(&Verb::Head, &url)?.status {
            200..=299 => Ok(true),
            404 => Ok(false),
            status => Err(RemoteError::Http(format!("HEAD {url}: HTTP {status}"))),
        }
    }

    fn push_blob(&self, image: &ImageRef, digest: &Digest, data: &[u8]) -> Result<(), RemoteError> {
        verify_blob(digest.as_str(), digest, data)?;
        debug!("uploading {digest} ({} bytes) to {}", data.len(), image.repository);
        self.upload(image, &Resource::Blob(digest), BLOB_MEDIA_TYPE, data)
    }

    fn push_image(&self, image: &ImageRef, manifest: &Image) -> Result<Digest, RemoteError> {
        let config = manifest.config_bytes()?;
        let config_digest = &manifest.manifest.config.digest;
        verify_blob("image config", config_digest, &config)?;
        if !self.has_blob(image, config_digest)? {
            self.push_blob(image, config_digest, &config)?;
        }

        let body = manifest.manifest_bytes()?;
        let reference = image.reference();
        self.upload(image, &Resource::Manifest(&reference), MANIFEST_MEDIA_TYPE, &body)?;
        Ok(Digest::of(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Seen {
        method: String,
        path: String,
        authorization: Option<String>,
    }

    #[derive(Default)]
    struct State {
        objects: HashMap<String, Vec<u8>>,
        seen: Vec<Seen>,
        /// Every request is answered with this status when set.
        force_status: Option<u16>,
    }

    /// Registry double: stores PUT bodies by path and serves them back.
    /// Connections are handled one at a time on a background thread.
    struct FakeRegistry {
        url: String,
        state: Arc<Mutex<State>>,
    }

    impl FakeRegistry {
        fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let state = Arc::new(Mutex::new(State::default()));
            let shared = Arc::clone(&state);
            std::thread::spawn(move || {
                for stream in listener.incoming().flatten() {
                    serve(stream, &shared);
                }
            });
            Self { url, state }
        }

        fn client(&self) -> HttpRegistry {
            HttpRegistry::new(RemoteConfig::new(&self.url))
        }

        fn seen(&self) -> Vec<Seen> {
            self.state.lock().unwrap().seen.clone()
        }

        fn plant(&self, path: &str, body: &[u8]) {
            self.state
                .lock()
                .unwrap()
                .objects
                .insert(path.to_owned(), body.to_vec());
        }

        fn force_status(&self, status: u16) {
            self.state.lock().unwrap().force_status = Some(status);
        }
    }

    fn serve(stream: TcpStream, state: &Mutex<State>) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() {
            return;
        }
        let mut words = line.split_whitespace();
        let (Some(method), Some(path)) = (words.next(), words.next()) else {
            return;
        };
        let (method, path) = (method.to_owned(), path.to_owned());

        let mut headers = HashMap::new();
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap_or(0) == 0 || header.trim().is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }
        let length = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).unwrap();

        let (status, payload) = {
            let mut state = state.lock().unwrap();
            state.seen.push(Seen {
                method: method.clone(),
                path: path.clone(),
                authorization: headers.get("authorization").cloned(),
            });
            match (state.force_status, method.as_str()) {
                (Some(status), _) => (status, Vec::new()),
                (None, "PUT") => {
                    state.objects.insert(path, body);
                    (201, Vec::new())
                }
                (None, "GET" | "HEAD") => match state.objects.get(&path) {
                    Some(stored) if method == "GET" => (200, stored.clone()),
                    Some(_) => (200, Vec::new()),
                    None => (404, Vec::new()),
                },
                (None, _) => (405, Vec::new()),
            }
        };

        let mut out = stream;
        let _ = write!(
            out,
            "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            payload.len()
        );
        let _ = out.write_all(&payload);
    }

    fn app() -> ImageRef {
        ImageRef::parse("acme/app:v1").unwrap()
    }

    #[test]
    fn blobs_are_uploaded_and_checked_by_digest() {
        let server = FakeRegistry::start();
        let reg = server.client();
        let d = Digest::of(b"layer tar");
        assert!(!reg.has_blob(&app(), &d).unwrap());
        reg.push_blob(&app(), &d, b"layer tar").unwrap();
        assert!(reg.has_blob(&app(), &d).unwrap());
        assert_eq!(reg.fetch_blob(&app(), &d).unwrap(), b"layer tar");

        let put = server.seen().into_iter().find(|s| s.method == "PUT").unwrap();
        assert_eq!(put.path, format!("/v2/acme/app/blobs/{d}"));
    }

    #[test]
    fn pushed_image_reads_back_by_tag() {
        let server = FakeRegistry::start();
        let reg = server.client();
        let layer = b"runtime layer";
        let d = Digest::of(layer);
        reg.push_blob(&app(), &d, layer).unwrap();

        let mut image = Image::empty("linux", "amd64");
        image.push_layer(d, layer.len() as u64);
        image.set_label("io.buildpacks.stack.id", "io.acme.stack");
        image.seal().unwrap();
        assert_eq!(reg.push_image(&app(), &image).unwrap(), image.digest().unwrap());

        assert_eq!(reg.fetch_image(&app()).unwrap().unwrap(), image);
        assert!(server
            .seen()
            .iter()
            .any(|s| s.method == "PUT" && s.path == "/v2/acme/app/manifests/v1"));
    }

    #[test]
    fn absent_image_and_blob() {
        let server = FakeRegistry::start();
        let reg = server.client();
        assert!(reg.fetch_image(&app()).unwrap().is_none());
        assert!(matches!(
            reg.fetch_blob(&app(), &Digest::of(b"nope")),
            Err(RemoteError::NotFound(_))
        ));
    }

    #[test]
    fn token_travels_as_bearer() {
        let server = FakeRegistry::start();
        let reg = HttpRegistry::new(RemoteConfig::new(&server.url).with_token("s3cret"));
        let _ = reg.has_blob(&app(), &Digest::of(b"x")).unwrap();
        assert_eq!(server.seen()[0].authorization.as_deref(), Some("Bearer s3cret"));

        let anonymous = server.client();
        let _ = anonymous.has_blob(&app(), &Digest::of(b"x")).unwrap();
        assert!(server.seen()[1].authorization.is_none());
    }

    #[test]
    fn rejected_credentials_name_the_registry() {
        let server = FakeRegistry::start();
        server.force_status(401);
        let err = server.client().fetch_image(&app()).unwrap_err();
        assert!(err.to_string().contains("rejected the credentials"), "{err}");
    }

    #[test]
    fn server_errors_are_reported() {
        let server = FakeRegistry::start();
        server.force_status(500);
        let reg = server.client();
        assert!(matches!(reg.has_blob(&app(), &Digest::of(b"x")), Err(RemoteError::Http(_))));
        assert!(reg.push_blob(&app(), &Digest::of(b"x"), b"x").is_err());
    }

    #[test]
    fn tampered_blob_fails_verification() {
        let server = FakeRegistry::start();
        let d = Digest::of(b"expected");
        server.plant(&format!("/v2/acme/app/blobs/{d}"), b"swapped");
        assert!(matches!(
            server.client().fetch_blob(&app(), &d),
            Err(RemoteError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn unreachable_registry_is_an_error() {
        let reg = HttpRegistry::new(RemoteConfig::new("http://127.0.0.1:1"));
        assert!(reg.push_blob(&app(), &Digest::of(b"d"), b"d").is_err());
    }
}
