//! Weight artifact fetching and verification.
//!
//! [`Fetcher::ensure`] makes a remote artifact available at a local path:
//! plain files stream straight to their destination, tar archives go through
//! a private temporary file and a traversal-checked extraction. Downloads
//! resume from whatever bytes are already on disk and retry transient
//! failures on a fixed budget.
//!
//! Completion is keyed purely by "does the destination exist": no checksum
//! is taken, so a corrupted partial file at the destination is trusted as-is.
//! That matches the upstream serving behavior and is a known gap rather than
//! a contract.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A named (remote URL, local destination) pair.
#[derive(Debug, Clone, Copy)]
pub struct WeightSource {
    pub name: &'static str,
    pub url: &'static str,
    pub local_path: &'static str,
}

/// The denoising transformer checkpoint.
pub const TRANSFORMER_WEIGHTS: WeightSource = WeightSource {
    name: "transformer",
    url: "https://weights.replicate.delivery/default/black-forest-labs/kontext/pre-release/preliminary-dev-kontext.sft",
    local_path: "/models/kontext/preliminary-dev-kontext.sft",
};

/// The image autoencoder checkpoint.
pub const AE_WEIGHTS: WeightSource = WeightSource {
    name: "autoencoder",
    url: "https://weights.replicate.delivery/default/black-forest-labs/FLUX.1-dev/safetensors/ae.safetensors",
    local_path: "/models/flux-dev/ae.safetensors",
};

const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Resumable, retrying artifact downloader.
pub struct Fetcher {
    client: reqwest::blocking::Client,
    max_attempts: usize,
    retry_delay: Duration,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher {
    pub fn new() -> Self {
        Self::with_policy(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY)
    }

    /// Override the retry budget and delay, mainly for tests.
    pub fn with_policy(max_attempts: usize, retry_delay: Duration) -> Self {
        assert!(max_attempts >= 1);
        // No overall request timeout: weight files are tens of gigabytes.
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .expect("reqwest client");
        Self {
            client,
            max_attempts,
            retry_delay,
        }
    }

    /// Guarantee that `dest` holds the resource named by `url`.
    ///
    /// A destination that already exists is taken as complete and skipped
    /// without any network traffic. Tar archives (`.tar`, `.tar.gz`, `.tgz`)
    /// are extracted into `dest` as a directory; everything else is written
    /// to `dest` as a file, creating parent directories as needed.
    pub fn ensure(&self, url: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            debug!(?dest, "artifact already present, skipping fetch");
            return Ok(());
        }
        info!(url, ?dest, "fetching artifact");
        let start = Instant::now();
        if is_archive(url) {
            let tmp = tempfile::NamedTempFile::new()?;
            self.download_with_retry(url, tmp.path())?;
            fs::create_dir_all(dest)?;
            extract_archive(tmp.path(), dest)?;
            tmp.close()?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            self.download_with_retry(url, dest)?;
        }
        info!(elapsed = ?start.elapsed(), url, "artifact ready");
        Ok(())
    }

    /// [`ensure`](Self::ensure) for a named weight source, returning its
    /// local path.
    pub fn ensure_source(&self, source: &WeightSource) -> Result<PathBuf> {
        let dest = PathBuf::from(source.local_path);
        self.ensure(source.url, &dest)?;
        Ok(dest)
    }

    fn download_with_retry(&self, url: &str, dest: &Path) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.download_once(url, dest) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    warn!(
                        attempt,
                        error = %e,
                        delay = ?self.retry_delay,
                        "transient download failure, will resume after delay"
                    );
                    std::thread::sleep(self.retry_delay);
                }
                Err(e) => {
                    return Err(Error::Download {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// One download attempt. Any bytes already at `dest` are kept: the
    /// request asks the origin only for the remaining range and appends.
    fn download_once(&self, url: &str, dest: &Path) -> Result<()> {
        let offset = fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
        let mut request = self.client.get(url);
        if offset > 0 {
            debug!(offset, "resuming download from existing bytes");
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let mut response = request.send()?.error_for_status()?;
        let mut file = if offset > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT {
            OpenOptions::new().append(true).open(dest)?
        } else {
            // Fresh download, or the origin ignored the range request and
            // replied with the full body.
            File::create(dest)?
        };
        response.copy_to(&mut file)?;
        Ok(())
    }
}

fn is_archive(url: &str) -> bool {
    url.ends_with(".tar") || url.ends_with(".tar.gz") || url.ends_with(".tgz")
}

/// Extract a tar (optionally gzipped) archive into `dest`.
///
/// Every member path is validated before anything is written: a single member
/// escaping `dest` rejects the whole archive with [`Error::PathTraversal`]
/// and leaves no extracted files behind.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    let mut tar = open_tar(archive)?;
    for entry in tar.entries()? {
        let entry = entry?;
        let member = entry.path()?.into_owned();
        if !stays_within_dest(&member) {
            return Err(Error::PathTraversal {
                member,
                dest: dest.to_path_buf(),
            });
        }
    }
    // Second pass over a fresh reader actually unpacks.
    let mut tar = open_tar(archive)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        entry.unpack_in(dest)?;
    }
    Ok(())
}

/// Lexical containment check: no absolute members, and no `..` that climbs
/// above the extraction root at any point.
fn stays_within_dest(member: &Path) -> bool {
    let mut depth = 0i64;
    for component in member.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return false,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::Normal(_) => depth += 1,
        }
    }
    true
}

fn open_tar(path: &Path) -> Result<tar::Archive<Box<dyn Read>>> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic)?;
    file.rewind()?;
    let reader: Box<dyn Read> = if n == 2 && magic == [0x1f, 0x8b] {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    Ok(tar::Archive::new(reader))
}

// ---------------------------------------------------------------------------
// Weight key verification
// ---------------------------------------------------------------------------

/// How to treat a checkpoint whose tensor names do not exactly match the
/// model's expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Any mismatch fails the load.
    Strict,
    /// Mismatches are reported and logged; loading proceeds with whatever
    /// keys line up.
    Lenient,
}

/// Outcome of comparing a checkpoint's tensor names against a model's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyReport {
    /// Expected by the model, absent from the file.
    pub missing: Vec<String>,
    /// Present in the file, unknown to the model.
    pub unexpected: Vec<String>,
}

impl KeyReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

/// List the tensor names in a safetensors file by reading only its header:
/// an 8-byte little-endian length followed by a JSON object mapping tensor
/// names to their layout. The tensor data itself is never touched.
pub fn read_weight_keys(path: &Path) -> Result<Vec<String>> {
    let mut file = File::open(path)?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    let mut header = vec![0u8; header_len];
    file.read_exact(&mut header)?;
    let header: std::collections::HashMap<String, serde_json::Value> =
        serde_json::from_slice(&header)?;
    let mut keys: Vec<String> = header
        .into_keys()
        .filter(|k| k != "__metadata__")
        .collect();
    keys.sort();
    Ok(keys)
}

/// Compare a checkpoint's keys against `expected`.
///
/// In [`LoadMode::Lenient`] a mismatch is logged as a warning and returned
/// in the report; in [`LoadMode::Strict`] it is an error.
pub fn verify_weight_keys(path: &Path, expected: &[String], mode: LoadMode) -> Result<KeyReport> {
    let found: HashSet<String> = read_weight_keys(path)?.into_iter().collect();
    let wanted: HashSet<&String> = expected.iter().collect();

    let mut missing: Vec<String> = expected
        .iter()
        .filter(|k| !found.contains(*k))
        .cloned()
        .collect();
    missing.sort();
    let mut unexpected: Vec<String> = found
        .iter()
        .filter(|k| !wanted.contains(k))
        .cloned()
        .collect();
    unexpected.sort();

    let report = KeyReport {
        missing,
        unexpected,
    };
    if report.is_clean() {
        return Ok(report);
    }
    match mode {
        LoadMode::Strict => Err(Error::WeightKeyMismatch {
            path: path.to_path_buf(),
            missing: report.missing.len(),
            unexpected: report.unexpected.len(),
        }),
        LoadMode::Lenient => {
            warn!(
                ?path,
                missing = report.missing.len(),
                unexpected = report.unexpected.len(),
                "checkpoint keys do not match the model exactly, loading leniently"
            );
            debug!(missing = ?report.missing, unexpected = ?report.unexpected, "key mismatch detail");
            Ok(report)
        }
    }
}
