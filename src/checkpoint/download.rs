use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while fetching a checkpoint
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The HTTP request could not be sent or its body could not be read
    #[error("request to {url} failed: {source}")]
    Request {
        /// Requested URL
        url: String,
        /// Underlying error
        source: reqwest::Error,
    },

    /// The server answered with a non-success status
    #[error("download failed with status {status}: {url}")]
    Status {
        /// Requested URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The server answered with an empty body
    #[error("download from {url} returned no data")]
    Empty {
        /// Requested URL
        url: String,
    },

    /// Filesystem error around the downloaded file
    #[error("i/o error at {path}: {source}")]
    Io {
        /// Path being written
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Fetches a URL into a local file
///
/// The export pipeline only talks to the network through this trait, so tests
/// can count calls with `MockFetch`.
#[cfg_attr(test, mockall::automock)]
pub trait Fetch {
    /// Downloads `url` into `dest`, returning the number of bytes written
    ///
    /// # Errors
    /// Returns error on network failure, non-success status or write failure
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError>;
}

/// Blocking HTTP fetcher backed by `reqwest`
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    /// Creates a fetcher without a request timeout (checkpoints are large)
    ///
    /// # Errors
    /// Returns error if the TLS backend can't be initialized
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .build()
            .map_err(|source| DownloadError::Request {
                url: String::new(),
                source,
            })?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        tracing::info!(url = %url, "downloading checkpoint");

        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|source| DownloadError::Request {
                url: url.to_owned(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_owned(),
                status: response.status().as_u16(),
            });
        }

        let file = fs::File::create(dest).map_err(|source| DownloadError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);

        let written = response
            .copy_to(&mut writer)
            .map_err(|source| DownloadError::Request {
                url: url.to_owned(),
                source,
            })?;

        writer
            .into_inner()
            .map_err(|e| DownloadError::Io {
                path: dest.to_path_buf(),
                source: e.into_error(),
            })?
            .sync_all()
            .map_err(|source| DownloadError::Io {
                path: dest.to_path_buf(),
                source,
            })?;

        Ok(written)
    }
}

/// Ensures the checkpoint exists locally, returns true if downloaded, false if already existed
///
/// When the file is missing, exactly one fetch of `url` is made into a
/// temporary sibling which is renamed into place only once it holds data.
///
/// # Errors
/// Returns error if the download fails or the file can't be moved into place
pub fn ensure_checkpoint(
    fetcher: &dyn Fetch,
    url: &str,
    checkpoint_path: &Path,
) -> Result<bool, DownloadError> {
    if checkpoint_path.exists() {
        tracing::info!(
            path = %checkpoint_path.display(),
            "checkpoint already exists, skipping download"
        );
        return Ok(false);
    }

    tracing::info!(
        path = %checkpoint_path.display(),
        "checkpoint not found, starting download"
    );

    if let Some(parent) = checkpoint_path.parent() {
        fs::create_dir_all(parent).map_err(|source| DownloadError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let temp_path = temp_path(checkpoint_path);
    let written = match fetcher.fetch(url, &temp_path) {
        Ok(0) => {
            let _ = fs::remove_file(&temp_path);
            return Err(DownloadError::Empty {
                url: url.to_owned(),
            });
        }
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
    };

    fs::rename(&temp_path, checkpoint_path).map_err(|source| DownloadError::Io {
        path: checkpoint_path.to_path_buf(),
        source,
    })?;

    tracing::info!(
        path = %checkpoint_path.display(),
        size = written,
        "checkpoint downloaded successfully"
    );

    Ok(true)
}

/// `<name>.tmp` next to `path`
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
