use std::fs;
use std::io::Read;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tempfile::TempDir;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(6);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const DOC: &str = "# Home\n\n## Diagrams\n\n```mermaid\ngraph TD;\nA-->B;\n```\n\n| A | B |\n|---|---|\n| 1 | 2 |\n\n<script>alert(1)</script>\n";

struct Fixture {
    _tmp: TempDir,
    root: PathBuf,
    entry: PathBuf,
}

impl Fixture {
    fn new(markdown: &str) -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let root = tmp.path().to_path_buf();
        let entry = root.join("notes.md");
        fs::write(&entry, markdown).expect("write notes.md");
        fs::write(root.join("other.md"), "# Other\n").expect("write other.md");
        Self {
            _tmp: tmp,
            root,
            entry,
        }
    }
}

fn bin_path() -> String {
    std::env::var("CARGO_BIN_EXE_mdhydrate").expect("CARGO_BIN_EXE_mdhydrate is set by cargo test")
}

fn run_cli(args: &[&str], file: &Path) -> Output {
    Command::new(bin_path())
        .args(args)
        .arg(file)
        .output()
        .expect("run mdhydrate")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ---------------------------------------------------------------------------
// render
// ---------------------------------------------------------------------------

#[test]
fn test_render_without_engine_leaves_placeholder() {
    let fixture = Fixture::new(DOC);
    let output = run_cli(&["render", "--engine", "none"], &fixture.entry);
    assert!(output.status.success(), "stderr:\n{}", stderr_of(&output));

    let html = stdout_of(&output);
    assert!(html.starts_with("<!DOCTYPE html>"));
    assert!(html.contains("<h1 id=\"home\">Home</h1>"));
    assert!(html.contains("href=\"#diagrams\""));
    assert!(html.contains("<pre class=\"mermaid\">graph TD;\nA--&gt;B;\n</pre>"));
    assert!(!html.contains("data-processed"));
    assert!(html.contains("<table>"));
    assert!(!html.contains("<script>alert(1)</script>"));
}

#[test]
fn test_render_native_engine_inlines_svg() {
    let fixture = Fixture::new(DOC);
    let output = run_cli(&["render", "--engine", "native"], &fixture.entry);
    assert!(output.status.success(), "stderr:\n{}", stderr_of(&output));

    let html = stdout_of(&output);
    assert!(html.contains("data-processed=\"true\""), "html:\n{html}");
    assert!(html.contains("<svg"), "html:\n{html}");
    assert!(!html.contains("<?xml"));
    assert!(stderr_of(&output).contains("[render] id=mermaid-1 ok"));
}

#[test]
fn test_render_missing_mmdc_fails_open() {
    let fixture = Fixture::new(DOC);
    let output = run_cli(
        &["render", "--engine", "command", "--mmdc", "/nonexistent/mmdc"],
        &fixture.entry,
    );
    assert!(output.status.success(), "stderr:\n{}", stderr_of(&output));
    let html = stdout_of(&output);
    assert!(html.contains("<pre class=\"mermaid\">"));
    assert!(!html.contains("data-processed"));
    assert!(stderr_of(&output).contains("[engine]"));
}

#[test]
fn test_render_empty_diagram_is_skipped() {
    let fixture = Fixture::new("```mermaid\n\n```\n");
    let output = run_cli(&["render", "--engine", "native"], &fixture.entry);
    assert!(output.status.success(), "stderr:\n{}", stderr_of(&output));
    let html = stdout_of(&output);
    assert!(html.contains("data-render-skipped=\"empty\""), "html:\n{html}");
}

#[test]
fn test_render_writes_output_file() {
    let fixture = Fixture::new(DOC);
    let out = fixture.root.join("notes.html");
    let output = Command::new(bin_path())
        .args(["render", "--engine", "none", "-o"])
        .arg(&out)
        .arg(&fixture.entry)
        .output()
        .expect("run mdhydrate");
    assert!(output.status.success(), "stderr:\n{}", stderr_of(&output));
    assert!(output.stdout.is_empty());
    let html = fs::read_to_string(&out).expect("read output");
    assert!(html.contains("<title>Home · mdhydrate</title>"));
    assert!(html.contains("<style>"), "standalone page inlines its stylesheet");
}

#[test]
fn test_render_uses_mermaid_config_file() {
    let fixture = Fixture::new(DOC);
    let config = fixture.root.join("mermaid.json");
    fs::write(&config, r#"{"theme":"dark","flowchart":{"curve":"linear"}}"#).expect("write config");
    let output = Command::new(bin_path())
        .args(["render", "--engine", "none", "--mermaid-config"])
        .arg(&config)
        .arg(&fixture.entry)
        .output()
        .expect("run mdhydrate");
    assert!(output.status.success(), "stderr:\n{}", stderr_of(&output));
    let html = stdout_of(&output);
    assert!(html.contains("\"theme\":\"dark\""));
    assert!(html.contains("\"curve\":\"linear\""));
    assert!(html.contains("\"securityLevel\":\"loose\""));
}

#[test]
fn test_render_rejects_non_markdown_extension() {
    let fixture = Fixture::new(DOC);
    let txt = fixture.root.join("notes.txt");
    fs::write(&txt, "hello").expect("write txt");
    let output = run_cli(&["render"], &txt);
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("not a recognized markdown extension"));
}

#[test]
fn test_render_missing_file() {
    let fixture = Fixture::new(DOC);
    let output = run_cli(&["render"], &fixture.root.join("absent.md"));
    assert!(!output.status.success());
    assert!(stderr_of(&output).contains("file not found"));
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

struct ResponseSnapshot {
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseSnapshot {
    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_owned())
    }
}

struct ServerHandle {
    child: Option<Child>,
    base_url: String,
}

impl ServerHandle {
    fn new(scenario: &str, fixture: &Fixture, engine: &str) -> Self {
        let port = free_port();
        eprintln!("[TEST] scenario={} port={}", scenario, port);

        let mut child = Command::new(bin_path())
            .arg("serve")
            .arg("--bind")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--engine")
            .arg(engine)
            .arg(&fixture.entry)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn mdhydrate serve");

        let base_url = format!("http://127.0.0.1:{port}");
        wait_for_server_ready(&mut child, &base_url);

        Self {
            child: Some(child),
            base_url,
        }
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    fn shutdown_with_sigint(mut self) -> Output {
        let mut child = self.child.take().expect("server child exists");
        send_sigint(child.id());
        wait_with_timeout(&mut child, Duration::from_secs(5));
        child.wait_with_output().expect("collect server output")
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        if child.try_wait().ok().flatten().is_none() {
            let _ = child.kill();
        }
        let _ = child.wait();
    }
}

fn client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("build reqwest client")
}

fn client_no_auto_decode() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .no_gzip()
        .no_brotli()
        .build()
        .expect("build reqwest client")
}

fn fetch_with_headers(client: &Client, url: &str, headers: &[(&str, &str)]) -> ResponseSnapshot {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes()).expect("valid header name");
        let value = HeaderValue::from_str(v).expect("valid header value");
        map.insert(name, value);
    }

    let resp = client
        .get(url)
        .headers(map)
        .send()
        .unwrap_or_else(|e| panic!("GET {} failed: {e}", url));
    let status = resp.status().as_u16();
    let headers = resp.headers().clone();
    let body = resp
        .bytes()
        .unwrap_or_else(|e| panic!("read body for {} failed: {e}", url))
        .to_vec();

    ResponseSnapshot {
        status,
        headers,
        body,
    }
}

fn fetch(client: &Client, url: &str) -> ResponseSnapshot {
    fetch_with_headers(client, url, &[])
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local addr").port()
}

fn wait_for_server_ready(child: &mut Child, base_url: &str) {
    let ready_client = Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .expect("build readiness client");

    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait().expect("try_wait server") {
            let mut stdout = String::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_string(&mut stdout);
            }
            panic!("server exited early status={}\nstdout:\n{}", status, stdout);
        }

        if ready_client
            .get(format!("{}/assets/mdhydrate.css", base_url))
            .send()
            .is_ok()
        {
            return;
        }

        if start.elapsed() > STARTUP_TIMEOUT {
            panic!("server did not become ready within {:?}", STARTUP_TIMEOUT);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) {
    let start = std::time::Instant::now();
    loop {
        if child.try_wait().expect("try_wait child").is_some() {
            return;
        }
        if start.elapsed() >= timeout {
            return;
        }
        thread::sleep(Duration::from_millis(25));
    }
}

#[cfg(unix)]
fn send_sigint(pid: u32) {
    let status = Command::new("kill")
        .arg("-INT")
        .arg(pid.to_string())
        .status()
        .expect("send SIGINT");
    assert!(status.success(), "kill -INT failed for pid {pid}");
}

#[cfg(not(unix))]
fn send_sigint(_pid: u32) {
    panic!("SIGINT test is only supported on unix");
}

#[test]
fn test_serve_renders_entry_file() {
    let fixture = Fixture::new(DOC);
    let server = ServerHandle::new("test_serve_renders_entry_file", &fixture, "none");

    for path in ["/", "/notes.md"] {
        let resp = fetch(&client(), &server.url(path));
        assert_eq!(resp.status, 200, "path {path}");
        assert!(resp
            .header("content-type")
            .is_some_and(|v| v.starts_with("text/html")));
        let body = resp.body_text();
        assert!(body.contains("<h1 id=\"home\">Home</h1>"), "path {path}");
        assert!(body.contains("<pre class=\"mermaid\">"));
        assert!(body.contains("/assets/mdhydrate.js"));
    }
}

#[test]
fn test_serve_hydrates_with_native_engine() {
    let fixture = Fixture::new(DOC);
    let server = ServerHandle::new("test_serve_hydrates_with_native_engine", &fixture, "native");

    let resp = fetch(&client(), &server.url("/"));
    assert_eq!(resp.status, 200);
    let body = resp.body_text();
    assert!(body.contains("data-processed=\"true\""), "body:\n{body}");
    assert!(body.contains("<svg"));

    // Engine is already initialized; the second request renders again.
    let resp = fetch(&client(), &server.url("/"));
    assert!(resp.body_text().contains("<svg"));
}

#[test]
fn test_serve_raw_mode() {
    let fixture = Fixture::new(DOC);
    let server = ServerHandle::new("test_serve_raw_mode", &fixture, "none");

    let resp = fetch(&client(), &server.url("/?raw=1"));
    assert_eq!(resp.status, 200);
    assert!(resp
        .header("content-type")
        .is_some_and(|v| v.starts_with("text/plain")));
    assert_eq!(resp.body_text(), DOC);
}

#[test]
fn test_serve_assets_and_not_found() {
    let fixture = Fixture::new(DOC);
    let server = ServerHandle::new("test_serve_assets_and_not_found", &fixture, "none");

    let css = fetch(&client(), &server.url("/assets/mdhydrate.css"));
    assert_eq!(css.status, 200);
    assert!(css.header("content-type").is_some_and(|v| v.contains("text/css")));

    let js = fetch(&client(), &server.url("/assets/mdhydrate.js"));
    assert_eq!(js.status, 200);
    assert!(js
        .header("content-type")
        .is_some_and(|v| v.contains("text/javascript")));

    // Only the entry file is served, even when siblings exist.
    for path in ["/other.md", "/missing", "/sub/notes.md"] {
        let resp = fetch(&client(), &server.url(path));
        assert_eq!(resp.status, 404, "path {path}");
        assert_eq!(resp.header("x-content-type-options").as_deref(), Some("nosniff"));
    }
}

#[test]
fn test_serve_compression_gzip() {
    let fixture = Fixture::new(DOC);
    let server = ServerHandle::new("test_serve_compression_gzip", &fixture, "none");

    let resp = fetch_with_headers(
        &client_no_auto_decode(),
        &server.url("/"),
        &[("accept-encoding", "gzip")],
    );
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("content-encoding").as_deref(), Some("gzip"));
}

#[cfg(unix)]
#[test]
fn test_serve_graceful_shutdown_prints_url() {
    let fixture = Fixture::new(DOC);
    let server = ServerHandle::new("test_serve_graceful_shutdown_prints_url", &fixture, "none");
    let base_url = format!("{}/", server.base_url);

    let output = server.shutdown_with_sigint();
    assert!(
        output.status.success(),
        "server should exit cleanly on SIGINT\nstdout:\n{}",
        stdout_of(&output)
    );
    assert_eq!(stdout_of(&output).lines().next(), Some(base_url.as_str()));
}
