//! End-to-end fetcher tests against a scripted local HTTP server.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flux_kontext::weights::{extract_archive, Fetcher};
use flux_kontext::Error;

/// Serves one pre-baked raw response per connection and records the raw
/// request heads it saw.
struct ScriptedServer {
    url: String,
    requests: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl ScriptedServer {
    fn start(responses: Vec<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/weights.sft", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        let handle = thread::spawn(move || {
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if stream.read(&mut byte).unwrap() == 0 {
                        break;
                    }
                    head.push(byte[0]);
                }
                seen.lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(&head).into_owned());
                stream.write_all(&response).unwrap();
                let _ = stream.flush();
            }
        });
        Self {
            url,
            requests,
            handle,
        }
    }

    fn finish(self) -> Vec<String> {
        self.handle.join().unwrap();
        Arc::try_unwrap(self.requests)
            .unwrap()
            .into_inner()
            .unwrap()
    }
}

fn full_response(body: &[u8]) -> Vec<u8> {
    let mut r = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    r.extend_from_slice(body);
    r
}

/// Claims the full length but delivers only a prefix before closing, which
/// the client sees as a truncated transfer.
fn truncated_response(body: &[u8], delivered: usize) -> Vec<u8> {
    let mut r = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    r.extend_from_slice(&body[..delivered]);
    r
}

fn partial_response(body: &[u8], offset: usize) -> Vec<u8> {
    let rest = &body[offset..];
    let mut r = format!(
        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
        rest.len(),
        offset,
        body.len() - 1,
        body.len()
    )
    .into_bytes();
    r.extend_from_slice(rest);
    r
}

fn quick_fetcher() -> Fetcher {
    Fetcher::with_policy(3, Duration::from_millis(10))
}

#[test]
fn existing_destination_skips_the_network() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("weights.sft");
    std::fs::write(&dest, b"cached").unwrap();

    // Unroutable url: any network attempt would fail loudly.
    quick_fetcher()
        .ensure("http://127.0.0.1:9/weights.sft", &dest)
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), b"cached");
}

#[test]
fn plain_download_lands_at_the_destination() {
    let body = b"0123456789abcdef";
    let server = ScriptedServer::start(vec![full_response(body)]);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("sub/dir/weights.sft");

    quick_fetcher().ensure(&server.url, &dest).unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let requests = server.finish();
    assert_eq!(requests.len(), 1);
    assert!(
        !requests[0].to_ascii_lowercase().contains("range:"),
        "fresh fetch must not send a range"
    );
}

#[test]
fn truncated_download_resumes_with_a_range_request() {
    let body = b"0123456789abcdef";
    let server = ScriptedServer::start(vec![
        truncated_response(body, 6),
        partial_response(body, 6),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("weights.sft");

    quick_fetcher().ensure(&server.url, &dest).unwrap();

    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let requests = server.finish();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].to_ascii_lowercase().contains("range: bytes=6-"));
}

#[test]
fn origin_ignoring_the_range_restarts_from_scratch() {
    let body = b"0123456789abcdef";
    // Second attempt answers 200 with the full body despite the range header.
    let server = ScriptedServer::start(vec![
        truncated_response(body, 6),
        full_response(body),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("weights.sft");

    quick_fetcher().ensure(&server.url, &dest).unwrap();

    // The partial bytes are discarded, not prepended.
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    server.finish();
}

#[test]
fn client_errors_are_not_retried() {
    let server = ScriptedServer::start(vec![
        b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
    ]);
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("weights.sft");

    let err = quick_fetcher().ensure(&server.url, &dest).unwrap_err();
    match err {
        Error::Download { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(server.finish().len(), 1);
}

fn tar_with(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        // Write the name bytes directly: `append_data`/`set_path` refuse to
        // author `..` members, which the traversal test needs in its fixture.
        header.as_gnu_mut().unwrap().name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

#[test]
fn archives_are_downloaded_and_extracted() {
    let archive = tar_with(&[("a.txt", b"alpha"), ("sub/b.txt", b"beta")]);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/weights.tar", listener.local_addr().unwrap());
    let response = full_response(&archive);
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut head = [0u8; 1024];
        let _ = stream.read(&mut head).unwrap();
        stream.write_all(&response).unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("weights");
    quick_fetcher().ensure(&url, &dest).unwrap();
    handle.join().unwrap();

    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(dest.join("sub/b.txt")).unwrap(), b"beta");
}

#[test]
fn traversal_member_rejects_the_whole_archive() {
    let archive = tar_with(&[("ok.txt", b"fine"), ("../evil.txt", b"nope")]);
    let dir = tempfile::tempdir().unwrap();
    let tar_path = dir.path().join("weights.tar");
    std::fs::write(&tar_path, &archive).unwrap();
    let dest = dir.path().join("out");
    std::fs::create_dir(&dest).unwrap();

    let err = extract_archive(&tar_path, &dest).unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }));
    // Nothing gets extracted, not even the benign member before the bad one.
    assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
}

#[test]
fn gzipped_archives_are_sniffed_and_unpacked() {
    let plain = tar_with(&[("model/w.sft", b"weights")]);
    let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    gz.write_all(&plain).unwrap();
    let gzipped = gz.finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let tar_path = dir.path().join("weights.tar.gz");
    std::fs::write(&tar_path, &gzipped).unwrap();
    let dest = dir.path().join("out");
    std::fs::create_dir(&dest).unwrap();

    extract_archive(&tar_path, &dest).unwrap();
    assert_eq!(std::fs::read(dest.join("model/w.sft")).unwrap(), b"weights");
}
