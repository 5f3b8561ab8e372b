//! Source artifact download and unpacking.

use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::time::Duration;
use tracing::debug;

use super::ArtifactFetcher;
use crate::error::GeneratorError;

/// An unpacked artifact held in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    files: BTreeMap<String, Vec<u8>>,
    directories: BTreeSet<String>,
}

impl Artifact {
    /// Builds an artifact from `(path, contents)` pairs. Parent directories are implied.
    #[must_use]
    pub fn from_files<P: Into<String>, C: Into<Vec<u8>>>(files: impl IntoIterator<Item = (P, C)>) -> Self {
        let mut artifact = Self::default();
        for (path, contents) in files {
            artifact.insert_file(&path.into(), contents.into());
        }
        artifact
    }

    /// Unpacks a gzipped tarball.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure if the archive is corrupt.
    pub fn from_tar_gz(bytes: &[u8]) -> Result<Self, String> {
        let mut archive = tar::Archive::new(GzDecoder::new(bytes));
        let mut artifact = Self::default();

        let entries = archive.entries().map_err(|e| e.to_string())?;
        for entry in entries {
            let mut entry = entry.map_err(|e| e.to_string())?;
            let path = entry
                .path()
                .map_err(|e| e.to_string())?
                .to_string_lossy()
                .into_owned();
            let entry_type = entry.header().entry_type();
            if entry_type.is_dir() {
                artifact.insert_dir(&path);
            } else if entry_type.is_file() {
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).map_err(|e| e.to_string())?;
                artifact.insert_file(&path, contents);
            }
        }
        Ok(artifact)
    }

    fn insert_file(&mut self, path: &str, contents: Vec<u8>) {
        let path = normalize(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.insert_dir(parent);
        }
        self.files.insert(path, contents);
    }

    fn insert_dir(&mut self, path: &str) {
        let path = normalize(path);
        let mut prefix = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.directories.insert(prefix.clone());
        }
    }

    /// Contents of the file at `path`, relative to the artifact root.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize(path)).map(Vec::as_slice)
    }

    /// All directories, sorted.
    pub fn directories(&self) -> impl Iterator<Item = &str> {
        self.directories.iter().map(String::as_str)
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./")
        .trim_start_matches('/')
        .trim_end_matches('/')
        .to_string()
}

/// Fetches artifacts over HTTP from the source controller.
#[derive(Debug, Clone)]
pub struct HttpArtifactFetcher {
    client: reqwest::Client,
}

impl HttpArtifactFetcher {
    /// Creates a fetcher with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeneratorError::fetch("", e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpArtifactFetcher {
    async fn fetch(&self, url: &str) -> Result<Artifact, GeneratorError> {
        debug!(url, "Fetching artifact");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| GeneratorError::fetch(url, e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GeneratorError::fetch(url, e.to_string()))?;
        tokio::task::spawn_blocking(move || Artifact::from_tar_gz(&bytes))
            .await
            .map_err(|e| GeneratorError::fetch(url, format!("unpack task failed: {e}")))?
            .map_err(|message| GeneratorError::fetch(url, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .expect("append entry");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip")
    }

    #[test]
    fn test_unpack_tarball() {
        let bytes = tarball(&[
            ("./clusters/dev/config.yaml", "env: dev"),
            ("clusters/prod/config.yaml", "env: prod"),
        ]);
        let artifact = Artifact::from_tar_gz(&bytes).expect("valid archive");
        assert_eq!(artifact.file("clusters/dev/config.yaml"), Some("env: dev".as_bytes()));
        let dirs: Vec<&str> = artifact.directories().collect();
        assert_eq!(dirs, vec!["clusters", "clusters/dev", "clusters/prod"]);
    }

    #[test]
    fn test_corrupt_archive() {
        assert!(Artifact::from_tar_gz(b"not a tarball").is_err());
    }

    #[tokio::test]
    async fn test_http_fetch() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/artifact.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball(&[("a.json", "{}")])))
            .mount(&server)
            .await;

        let fetcher = HttpArtifactFetcher::new(Duration::from_secs(5)).expect("client");
        let artifact = fetcher
            .fetch(&format!("{}/artifact.tar.gz", server.uri()))
            .await
            .expect("fetched");
        assert_eq!(artifact.file("a.json"), Some("{}".as_bytes()));
    }

    #[tokio::test]
    async fn test_http_fetch_corrupt_body() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a tarball".to_vec()))
            .mount(&server)
            .await;

        let fetcher = HttpArtifactFetcher::new(Duration::from_secs(5)).expect("client");
        let err = fetcher
            .fetch(&format!("{}/broken.tar.gz", server.uri()))
            .await
            .expect_err("corrupt archive");
        assert!(matches!(err, GeneratorError::Fetch { .. }), "{err}");
    }
}
