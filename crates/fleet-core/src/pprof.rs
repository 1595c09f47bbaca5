//! Profile capture from every selected node's debug endpoint.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::cluster::SyncedCluster;
use crate::parallel::{self, UnitError};
use crate::{Error, Result};

/// Shortest client timeout, whatever the profile duration.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Cpu,
    Heap,
}

impl ProfileKind {
    fn endpoint(&self) -> &'static str {
        match self {
            Self::Cpu => "profile",
            Self::Heap => "heap",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PprofOpts {
    pub kind: ProfileKind,
    pub duration: Duration,
    pub output_dir: PathBuf,
}

/// Timeout for one capture: twice the profile duration, at least
/// [`MIN_TIMEOUT`].
pub fn capture_timeout(duration: Duration) -> Duration {
    duration.saturating_mul(2).max(MIN_TIMEOUT)
}

/// Capture a profile from every selected node into `opts.output_dir`.
///
/// Returns the written files sorted by name. When some nodes fail the
/// error lists them, and the files that were captured are still kept.
pub async fn pprof(c: &SyncedCluster, opts: &PprofOpts) -> Result<Vec<PathBuf>> {
    let scheme = if c.opts.secure { "https" } else { "http" };
    let path = format!(
        "debug/pprof/{}?seconds={}",
        opts.kind.endpoint(),
        opts.duration.as_secs()
    );
    let mut targets = Vec::with_capacity(c.nodes.len());
    for &node in &c.nodes {
        let vm = c.vm(node)?;
        targets.push(CaptureTarget {
            node,
            url: format!("{scheme}://{}:{}/{path}", vm.public_ip, c.admin_port(node)),
            file_name: format!(
                "pprof-{}-{}-{}-{node:04}.out",
                opts.kind.endpoint(),
                Utc::now().timestamp(),
                c.name()
            ),
        });
    }

    let description = match opts.kind {
        ProfileKind::Cpu => "capturing CPU profile",
        ProfileKind::Heap => "capturing heap profile",
    };
    capture(description, &targets, &opts.output_dir, capture_timeout(opts.duration)).await
}

#[derive(Debug, Clone)]
struct CaptureTarget {
    node: usize,
    url: String,
    file_name: String,
}

async fn capture(
    description: &str,
    targets: &[CaptureTarget],
    output_dir: &Path,
    timeout: Duration,
) -> Result<Vec<PathBuf>> {
    tokio::fs::create_dir_all(output_dir).await?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()?;
    let written: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

    let result = parallel::run(description, targets.len(), 0, |i| {
        let target = &targets[i];
        let client = &client;
        let written = &written;
        async move {
            let file = download(client, &target.url, output_dir, &target.file_name).await?;
            match written.lock() {
                Ok(mut files) => files.push(file),
                Err(poisoned) => poisoned.into_inner().push(file),
            }
            Ok(Vec::new())
        }
    })
    .await;

    let mut files = match written.into_inner() {
        Ok(files) => files,
        Err(poisoned) => poisoned.into_inner(),
    };
    files.sort();
    for file in &files {
        info!(file = %file.display(), "created profile");
    }

    result.map(|_| files).map_err(|mut e| {
        for failure in &mut e.failures {
            failure.index = targets[failure.index].node;
        }
        Error::Partial(e)
    })
}

/// Stream `url` into a hidden temporary file next to the destination, then
/// rename it into place. The temporary file never outlives the call.
async fn download(
    client: &reqwest::Client,
    url: &str,
    dir: &Path,
    file_name: &str,
) -> std::result::Result<PathBuf, UnitError> {
    let tmp = dir.join(format!(".pprof-{}", uuid::Uuid::new_v4()));
    let dest = dir.join(file_name);

    let fetched = async {
        let mut resp = client.get(url).send().await.map_err(Error::from)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(UnitError {
                error: Error::InvalidInput(format!(
                    "unexpected status from pprof endpoint: {status}"
                )),
                output: body.into_bytes(),
            });
        }

        let mut file = tokio::fs::File::create(&tmp).await.map_err(Error::from)?;
        while let Some(chunk) = resp.chunk().await.map_err(Error::from)? {
            file.write_all(&chunk).await.map_err(Error::from)?;
        }
        file.sync_all().await.map_err(Error::from)?;
        drop(file);
        tokio::fs::rename(&tmp, &dest).await.map_err(Error::from)?;
        Ok::<_, UnitError>(dest.clone())
    }
    .await;

    if fetched.is_err()
        && let Err(e) = tokio::fs::remove_file(&tmp).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(file = %tmp.display(), error = %e, "could not remove temporary file");
    }
    fetched
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Serve `responses` in order, one per connection.
    async fn serve(responses: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                sock.write_all(response.as_bytes()).await.unwrap();
                sock.shutdown().await.ok();
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn test_capture_timeout_has_floor() {
        assert_eq!(capture_timeout(Duration::from_secs(5)), MIN_TIMEOUT);
        assert_eq!(capture_timeout(Duration::from_secs(60)), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_capture_writes_files_and_reports_failures() {
        let ok = serve(vec![
            "HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nPROFILE",
        ])
        .await;
        let bad = serve(vec![
            "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 4\r\nConnection: close\r\n\r\nboom",
        ])
        .await;
        let dir = tempfile::tempdir().unwrap();
        let targets = vec![
            CaptureTarget {
                node: 1,
                url: format!("{ok}/debug/pprof/profile?seconds=1"),
                file_name: "pprof-profile-1-a-0001.out".into(),
            },
            CaptureTarget {
                node: 2,
                url: format!("{bad}/debug/pprof/profile?seconds=1"),
                file_name: "pprof-profile-1-a-0002.out".into(),
            },
        ];

        let err = capture("capturing CPU profile", &targets, dir.path(), MIN_TIMEOUT)
            .await
            .unwrap_err();
        let Error::Partial(p) = err else {
            panic!("expected partial failure, got {err:?}");
        };
        assert_eq!(p.failures.len(), 1);
        assert_eq!(p.failures[0].index, 2);
        assert_eq!(p.failures[0].output, b"boom");

        let written = std::fs::read(dir.path().join("pprof-profile-1-a-0001.out")).unwrap();
        assert_eq!(written, b"PROFILE");
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".pprof"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
